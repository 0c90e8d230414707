use futures::{SinkExt, StreamExt};
use l4proxy_proto::{
    write_token, CodecError, ControlCodec, ControlMessage, ErrorCode, EventKind, Token,
    TokenError,
};
use l4proxy_relay::{PairError, PairedConn};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to control server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Request rejected ({}): {message}", .code.as_str())]
    Rejected { code: ErrorCode, message: String },

    #[error("Control stream closed by server")]
    StreamClosed,

    #[error("Unexpected control message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid target address '{0}', expected host:port")]
    InvalidTarget(String),

    #[error("Invalid token {token:?}: {source}")]
    InvalidToken {
        token: String,
        #[source]
        source: TokenError,
    },

    #[error("Relay error: {0}")]
    Relay(#[from] PairError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control server address (host:port)
    pub server_addr: String,
    pub display_name: String,
    /// Requested public port, 0 for any
    pub public_port: u16,
    /// Requested internal port, 0 for any
    pub internal_port: u16,
    /// Local service every user is relayed to (host:port)
    pub target_address: String,
    /// `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:2222".to_string(),
            display_name: String::new(),
            public_port: 0,
            internal_port: 0,
            target_address: "127.0.0.1:22".to_string(),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// A registered agent holding its event stream
pub struct Agent {
    config: AgentConfig,
    public_address: String,
    framed: Framed<TcpStream, ControlCodec>,
    tracker: TaskTracker,
}

impl Agent {
    /// Connect to the control server and register.
    ///
    /// Returns once the broker has announced the public address.
    pub async fn connect(config: AgentConfig) -> Result<Self, AgentError> {
        if !config.target_address.contains(':') {
            return Err(AgentError::InvalidTarget(config.target_address));
        }

        let stream = TcpStream::connect(&config.server_addr)
            .await
            .map_err(|source| AgentError::Connect {
                addr: config.server_addr.clone(),
                source,
            })?;
        let mut framed = Framed::new(stream, ControlCodec::new());

        framed
            .send(ControlMessage::CreateClient {
                display_name: config.display_name.clone(),
                public_port: config.public_port,
                internal_port: config.internal_port,
            })
            .await?;

        let public_address = match framed.next().await {
            Some(Ok(ControlMessage::ClientEvent(event))) => match event.kind() {
                EventKind::Assigned { public_address } => public_address.to_string(),
                EventKind::NewUser { .. } => {
                    return Err(AgentError::UnexpectedMessage(format!("{:?}", event)))
                }
            },
            Some(Ok(ControlMessage::Error { code, message })) => {
                return Err(AgentError::Rejected { code, message })
            }
            Some(Ok(other)) => return Err(AgentError::UnexpectedMessage(format!("{:?}", other))),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(AgentError::StreamClosed),
        };

        info!(
            server = %config.server_addr,
            target = %config.target_address,
            "Registered, public address is {}", public_address
        );

        Ok(Self {
            config,
            public_address,
            framed,
            tracker: TaskTracker::new(),
        })
    }

    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    /// Consume events until the server ends the stream or `shutdown` is
    /// cancelled, then wait for open relays.
    ///
    /// A failed dial-back only affects that one user. Relays outlive a closed
    /// event stream and are cancelled only through `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let Agent {
            config,
            public_address: _,
            framed,
            tracker,
        } = self;
        let (mut sink, mut inbound) = framed.split();
        let mut heartbeat = config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink
                        .send(ControlMessage::Disconnect {
                            reason: "agent shutting down".to_string(),
                        })
                        .await;
                    break Ok(());
                }

                _ = next_tick(&mut heartbeat) => {
                    debug!("Sending ping");
                    if let Err(e) = sink.send(ControlMessage::Ping { timestamp: unix_timestamp() }).await {
                        break Err(e.into());
                    }
                }

                frame = inbound.next() => match frame {
                    Some(Ok(ControlMessage::ClientEvent(event))) => match event.kind() {
                        EventKind::Assigned { public_address } => {
                            debug!("Public address re-announced: {}", public_address);
                        }
                        EventKind::NewUser { token, internal_address } => {
                            dial_back(
                                token,
                                internal_address,
                                &config.target_address,
                                shutdown.child_token(),
                                &tracker,
                            );
                        }
                    },
                    Some(Ok(ControlMessage::Pong { .. })) => {
                        debug!("Received pong");
                    }
                    Some(Ok(ControlMessage::Disconnect { reason })) => {
                        info!("Server ended the event stream: {}", reason);
                        break Ok(());
                    }
                    Some(Ok(ControlMessage::Error { code, message })) => {
                        break Err(AgentError::Rejected { code, message });
                    }
                    Some(Ok(other)) => {
                        warn!("Unexpected message on event stream: {:?}", other);
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => {
                        info!("Control server closed the event stream");
                        break Ok(());
                    }
                },
            }
        };

        tracker.close();
        tracker.wait().await;
        result
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Serve one announced user on its own task
fn dial_back(
    token: &str,
    internal_address: &str,
    target_address: &str,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) {
    let token: Token = match token.parse() {
        Ok(token) => token,
        Err(source) => {
            let err = AgentError::InvalidToken {
                token: token.to_string(),
                source,
            };
            warn!("Ignoring user: {}", err);
            return;
        }
    };

    let internal_address = internal_address.to_string();
    let target_address = target_address.to_string();
    let relays = tracker.clone();
    tracker.spawn(async move {
        if let Err(e) = serve_user(token, &internal_address, &target_address, cancel, &relays).await {
            warn!(%token, "Failed to serve user: {}", e);
        }
    });
}

async fn serve_user(
    token: Token,
    internal_address: &str,
    target_address: &str,
    cancel: CancellationToken,
    tracker: &TaskTracker,
) -> Result<(), AgentError> {
    let mut callback = TcpStream::connect(internal_address).await?;
    callback.set_nodelay(true)?;
    write_token(&mut callback, token).await?;

    // Dropping the callback on failure closes the user's connection on the broker
    let backend = TcpStream::connect(target_address).await?;

    debug!(%token, "Relaying {} <-> {}", internal_address, target_address);
    let pair = Arc::new(PairedConn::with_far(callback, backend).with_cancellation(cancel));
    pair.relay(tracker)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use l4proxy_proto::ClientEvent;
    use tokio::net::TcpListener;

    /// Accepts one control connection and answers the registration with `reply`
    async fn fake_server(reply: ControlMessage) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, ControlCodec::new());
            let request = framed.next().await.unwrap().unwrap();
            assert!(matches!(request, ControlMessage::CreateClient { .. }));
            framed.send(reply).await.unwrap();
            // Keep the stream open until the agent hangs up
            while framed.next().await.is_some() {}
        });
        addr
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.server_addr, "127.0.0.1:2222");
        assert_eq!(config.target_address, "127.0.0.1:22");
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let config = AgentConfig {
            target_address: "no-port".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Agent::connect(config).await,
            Err(AgentError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reads_public_address() {
        let server_addr =
            fake_server(ControlMessage::ClientEvent(ClientEvent::assigned("198.51.100.7:40000")))
                .await;
        let agent = Agent::connect(AgentConfig {
            server_addr,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(agent.public_address(), "198.51.100.7:40000");
    }

    #[tokio::test]
    async fn test_connect_surfaces_rejection() {
        let server_addr = fake_server(ControlMessage::Error {
            code: ErrorCode::BindFailed,
            message: "port in use".to_string(),
        })
        .await;
        let result = Agent::connect(AgentConfig {
            server_addr,
            ..Default::default()
        })
        .await;
        match result {
            Err(AgentError::Rejected { code, message }) => {
                assert_eq!(code, ErrorCode::BindFailed);
                assert_eq!(message, "port in use");
            }
            Err(e) => panic!("Expected rejection, got {}", e),
            Ok(_) => panic!("Expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = vacant.local_addr().unwrap().to_string();
        drop(vacant);

        let result = Agent::connect(AgentConfig {
            server_addr: addr,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(AgentError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_bad_token_does_not_spawn() {
        let tracker = TaskTracker::new();
        dial_back(
            "not-a-token",
            "127.0.0.1:1",
            "127.0.0.1:2",
            CancellationToken::new(),
            &tracker,
        );
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, ControlCodec::new());
            let _ = framed.next().await.unwrap().unwrap();
            framed
                .send(ControlMessage::ClientEvent(ClientEvent::assigned("127.0.0.1:1")))
                .await
                .unwrap();
            let ping = framed.next().await.unwrap().unwrap();
            assert!(matches!(ping, ControlMessage::Ping { .. }));
            framed
                .send(ControlMessage::Disconnect {
                    reason: "done".to_string(),
                })
                .await
                .unwrap();
        });

        let agent = Agent::connect(AgentConfig {
            server_addr: addr,
            heartbeat_interval: Some(Duration::from_millis(20)),
            ..Default::default()
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), agent.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap();
    }
}
