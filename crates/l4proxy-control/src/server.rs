//! TCP control server
//!
//! Every connection carries one RPC. The first frame picks it:
//! - `CreateClient` registers an agent and turns the connection into its event
//!   stream. The agent may send `Ping` frames (answered with `Pong`) and the
//!   stream ends with `Disconnect` when the server stops or the instance goes
//!   away. When the agent hangs up, the instance is deregistered.
//! - `ListClients` and `ListBackendServiceUsers` get one response frame.

use crate::error::ControlError;
use crate::plane::ControlPlane;
use futures::{SinkExt, StreamExt};
use l4proxy_proto::{ClientEvent, ControlCodec, ControlMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type ControlStream = Framed<TcpStream, ControlCodec>;

pub struct ControlServer {
    listener: TcpListener,
    plane: Arc<ControlPlane>,
    tracker: TaskTracker,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, plane: Arc<ControlPlane>) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Control server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            plane,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Serve until `shutdown` is cancelled, then close every instance and
    /// wait for open control connections to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControlError> {
        let result = loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Control connection from {}", peer_addr);
                    let plane = self.plane.clone();
                    let shutdown = shutdown.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = handle_connection(plane, stream, peer_addr, shutdown).await
                        {
                            warn!("Control connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
                    warn!("Control accept aborted: {}", e);
                }
                Err(e) => {
                    error!("Control listener failed: {}", e);
                    break Err(ControlError::Io(e));
                }
            }
        };

        info!("Control server shutting down");
        drop(self.listener);
        self.plane.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;
        result
    }
}

/// Serve the single RPC carried by one control connection
pub async fn handle_connection(
    plane: Arc<ControlPlane>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ControlError> {
    let mut framed = Framed::new(stream, ControlCodec::new());

    let request = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        request = framed.next() => request,
    };

    let request = match request {
        Some(request) => request?,
        None => {
            debug!("Control connection from {} closed before a request", peer_addr);
            return Ok(());
        }
    };

    match request {
        ControlMessage::CreateClient {
            display_name,
            public_port,
            internal_port,
        } => {
            serve_registration(
                plane,
                framed,
                display_name,
                public_port,
                internal_port,
                peer_addr,
                shutdown,
            )
            .await
        }
        ControlMessage::ListClients => {
            let clients = plane.list_clients().await;
            framed.send(ControlMessage::Clients { clients }).await?;
            Ok(())
        }
        ControlMessage::ListBackendServiceUsers { parent } => {
            let response = match plane.list_users(&parent).await {
                Ok(users) => ControlMessage::BackendServiceUsers { users },
                Err(e) => error_message(&e),
            };
            framed.send(response).await?;
            Ok(())
        }
        other => {
            warn!("Unexpected first frame from {}: {:?}", peer_addr, other);
            let e = ControlError::InvalidRequest(
                "expected CreateClient, ListClients or ListBackendServiceUsers".to_string(),
            );
            framed.send(error_message(&e)).await?;
            Ok(())
        }
    }
}

fn error_message(e: &ControlError) -> ControlMessage {
    ControlMessage::Error {
        code: e.code(),
        message: e.to_string(),
    }
}

async fn serve_registration(
    plane: Arc<ControlPlane>,
    mut framed: ControlStream,
    display_name: String,
    public_port: u16,
    internal_port: u16,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ControlError> {
    let name = Uuid::new_v4().to_string();
    let registration = match plane
        .register(name.clone(), display_name.clone(), public_port, internal_port)
        .await
    {
        Ok(registration) => registration,
        Err(e) => {
            warn!(
                "Registration of {} from {} failed: {}",
                display_name, peer_addr, e
            );
            framed.send(error_message(&e)).await?;
            return Ok(());
        }
    };

    info!(
        client = %name,
        display_name = %display_name,
        agent = %peer_addr,
        public = %registration.public_address,
        "Agent connected"
    );

    let result = stream_events(registration.events, framed, &name, &shutdown).await;

    // The instance may already be gone if the whole plane is shutting down
    match plane.deregister(&name).await {
        Ok(()) | Err(ControlError::NotFound(_)) => {}
        Err(e) => warn!(client = %name, "Failed to deregister: {}", e),
    }

    info!(client = %name, "Agent disconnected");
    result
}

/// Forward instance events to the agent until either side ends the stream
async fn stream_events(
    mut events: mpsc::Receiver<ClientEvent>,
    framed: ControlStream,
    name: &str,
    shutdown: &CancellationToken,
) -> Result<(), ControlError> {
    let (mut sink, mut inbound) = framed.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink
                    .send(ControlMessage::Disconnect {
                        reason: "server shutting down".to_string(),
                    })
                    .await;
                return Ok(());
            }

            event = events.recv() => match event {
                Some(event) => {
                    debug!(client = %name, "Sending event {:?}", event);
                    sink.send(ControlMessage::ClientEvent(event)).await?;
                }
                None => {
                    let _ = sink
                        .send(ControlMessage::Disconnect {
                            reason: "client closed".to_string(),
                        })
                        .await;
                    return Ok(());
                }
            },

            frame = inbound.next() => match frame {
                Some(Ok(ControlMessage::Ping { timestamp })) => {
                    debug!(client = %name, "Received ping");
                    sink.send(ControlMessage::Pong { timestamp }).await?;
                }
                Some(Ok(ControlMessage::Disconnect { reason })) => {
                    info!(client = %name, "Agent disconnecting: {}", reason);
                    return Ok(());
                }
                Some(Ok(other)) => {
                    warn!(client = %name, "Unexpected message on event stream: {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}
