//! Plain TCP port forwarder
//!
//! Listens on a local address and relays every accepted connection to a fixed
//! remote address. Each connection pair is spliced by a [`PairedConn`] so it
//! shares the relay and teardown path with tunnelled sessions.

use crate::instance::RelayError;
use crate::paired::PairedConn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub listen_addr: SocketAddr,
    /// `host:port` dialed for every accepted connection
    pub remote_addr: String,
}

pub struct TcpForwarder {
    listener: TcpListener,
    remote_addr: String,
    tracker: TaskTracker,
}

impl TcpForwarder {
    pub async fn bind(config: ForwarderConfig) -> Result<Self, RelayError> {
        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|e| RelayError::BindError {
                    role: "forward",
                    address: config.listen_addr,
                    reason: e.to_string(),
                })?;

        info!(
            "Forwarding {} -> {}",
            listener.local_addr()?,
            config.remote_addr
        );

        Ok(Self {
            listener,
            remote_addr: config.remote_addr,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` is cancelled, then wait for open relays to end
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let result = loop {
            let (inbound, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
                        warn!("Accept aborted: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("Forward listener failed: {}", e);
                        break Err(RelayError::IoError(e));
                    }
                },
            };

            let remote_addr = self.remote_addr.clone();
            let tracker = self.tracker.clone();
            let cancel = shutdown.child_token();
            self.tracker.spawn(async move {
                let outbound = match TcpStream::connect(&remote_addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Failed to connect to {} for {}: {}", remote_addr, peer_addr, e);
                        return;
                    }
                };

                debug!("Forwarding {} -> {}", peer_addr, remote_addr);
                let pair = Arc::new(
                    PairedConn::with_far(inbound, outbound)
                        .with_peer_addr(peer_addr)
                        .with_cancellation(cancel),
                );
                if let Err(e) = pair.relay(&tracker) {
                    warn!("Failed to relay {}: {}", peer_addr, e);
                }
            });
        };

        drop(self.listener);
        self.tracker.close();
        self.tracker.wait().await;
        result
    }
}
