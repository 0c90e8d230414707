//! Agent instance
//!
//! One instance exists per registered agent. It owns a public listener for
//! users, an internal listener for the agent's callback connections, and the
//! registry of paired sessions between them.
//!
//! Task layout:
//! - one accept loop per listener
//! - one handshake task per callback connection (reads the token)
//! - one serial matcher task that issues tokens, notifies the subscriber and
//!   matches callbacks to pending sessions
//! - relay tasks per active session
//!
//! Every task is spawned on the instance's [`TaskTracker`]. Two tokens stop
//! them: `stopping` ends the listeners, the matcher and pending sessions,
//! while `shutdown` (its parent) also cancels active relays.
//! [`AgentInstance::drain`] cancels the former and [`AgentInstance::close`]
//! the latter; both wait for the tracker.

use crate::paired::PairedConn;
use crate::registry::SessionRegistry;
use chrono::{DateTime, Utc};
use l4proxy_proto::{read_token, ClientEvent, ClientInfo, Token, TokenGenerator};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Queue between an accept loop and the matcher task
const ACCEPT_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind {role} listener on {address}: {reason}")]
    BindError {
        role: &'static str,
        address: SocketAddr,
        reason: String,
    },

    #[error("Client {0} is already running")]
    AlreadyStarted(String),
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Unique registry key
    pub name: String,
    pub display_name: String,
    /// Host advertised in public and internal addresses
    pub host: String,
    /// Address both listeners bind to
    pub bind_ip: IpAddr,
    /// 0 picks any free port
    pub public_port: u16,
    /// 0 picks any free port
    pub internal_port: u16,
    /// How long a user waits for the agent's callback. `None` waits forever.
    pub pending_timeout: Option<Duration>,
    /// How long a callback connection may take to send its token
    pub handshake_timeout: Duration,
    /// Capacity of the subscriber's event queue
    pub event_buffer: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: "unknown".to_string(),
            host: "127.0.0.1".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_port: 0,
            internal_port: 0,
            pending_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 64,
        }
    }
}

struct Startup {
    public: TcpListener,
    internal: TcpListener,
    events: mpsc::Sender<ClientEvent>,
}

pub struct AgentInstance {
    name: String,
    display_name: String,
    public_address: String,
    internal_address: String,
    public_bind: SocketAddr,
    internal_bind: SocketAddr,
    registered_at: DateTime<Utc>,
    sessions: SessionRegistry<TcpStream>,
    shutdown: CancellationToken,
    stopping: CancellationToken,
    tracker: TaskTracker,
    pending_timeout: Option<Duration>,
    handshake_timeout: Duration,
    startup: Mutex<Option<Startup>>,
}

impl AgentInstance {
    /// Bind both listeners. Nothing is accepted until [`start`](Self::start).
    ///
    /// Returns the instance and the receiving end of its event stream. The
    /// instance stops when `shutdown` (or a parent of it) is cancelled.
    pub async fn bind(
        config: InstanceConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), RelayError> {
        let internal = bind_listener("internal", config.bind_ip, config.internal_port).await?;
        let public = bind_listener("public", config.bind_ip, config.public_port).await?;

        let internal_bind = internal.local_addr()?;
        let public_bind = public.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));

        let instance = Self {
            public_address: join_host_port(&config.host, public_bind.port()),
            internal_address: join_host_port(&config.host, internal_bind.port()),
            name: config.name,
            display_name: config.display_name,
            public_bind,
            internal_bind,
            registered_at: Utc::now(),
            sessions: SessionRegistry::new(),
            stopping: shutdown.child_token(),
            shutdown,
            tracker: TaskTracker::new(),
            pending_timeout: config.pending_timeout,
            handshake_timeout: config.handshake_timeout,
            startup: Mutex::new(Some(Startup {
                public,
                internal,
                events: events_tx,
            })),
        };

        info!(
            client = %instance.name,
            display_name = %instance.display_name,
            public = %instance.public_bind,
            internal = %instance.internal_bind,
            "Client listening"
        );

        Ok((instance, events_rx))
    }

    /// Start the accept loops and the matcher.
    ///
    /// The first event on the stream carries the public address.
    pub fn start(&self) -> Result<(), RelayError> {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RelayError::AlreadyStarted(self.name.clone()))?;

        let (users_tx, users_rx) = mpsc::channel(ACCEPT_QUEUE);
        let (callbacks_tx, callbacks_rx) = mpsc::channel(ACCEPT_QUEUE);

        self.tracker.spawn(accept_users(
            startup.public,
            users_tx,
            self.name.clone(),
            self.stopping.clone(),
        ));

        self.tracker.spawn(accept_callbacks(
            startup.internal,
            callbacks_tx,
            self.name.clone(),
            self.handshake_timeout,
            self.stopping.clone(),
            self.tracker.clone(),
        ));

        let matcher = Matcher {
            name: self.name.clone(),
            internal_address: self.internal_address.clone(),
            sessions: self.sessions.clone(),
            tokens: TokenGenerator::new(),
            events: startup.events,
            shutdown: self.shutdown.clone(),
            stopping: self.stopping.clone(),
            tracker: self.tracker.clone(),
            pending_timeout: self.pending_timeout,
        };
        self.tracker
            .spawn(matcher.run(self.public_address.clone(), users_rx, callbacks_rx));

        Ok(())
    }

    /// Stop accepting and drop pending users, but let active relays run to
    /// completion. Returns once every relay has finished.
    pub async fn drain(&self) {
        self.stopping.cancel();
        self.wait().await;
        info!(client = %self.name, "Client drained");
    }

    /// Stop accepting, close every session and wait for all tasks to finish
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.wait().await;

        let leftover = self.sessions.close_all();
        if leftover > 0 {
            debug!(client = %self.name, "Closed {} sessions after shutdown", leftover);
        }

        info!(client = %self.name, "Client closed");
    }

    async fn wait(&self) {
        // Never started: the listeners are still parked here
        drop(
            self.startup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Resolves once the instance stops accepting
    pub async fn cancelled(&self) {
        self.stopping.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.stopping.is_cancelled()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Advertised `host:port` users connect to
    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    /// Advertised `host:port` the agent dials back on
    pub fn internal_address(&self) -> &str {
        &self.internal_address
    }

    pub fn public_bind_addr(&self) -> SocketAddr {
        self.public_bind
    }

    pub fn internal_bind_addr(&self) -> SocketAddr {
        self.internal_bind
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Remote addresses of users with a pending or active session
    pub fn users(&self) -> Vec<SocketAddr> {
        self.sessions.peer_addrs()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            public_address: self.public_address.clone(),
            internal_address: self.internal_address.clone(),
            registered_at: self.registered_at,
        }
    }
}

async fn bind_listener(
    role: &'static str,
    ip: IpAddr,
    port: u16,
) -> Result<TcpListener, RelayError> {
    let address = SocketAddr::new(ip, port);
    TcpListener::bind(address)
        .await
        .map_err(|e| RelayError::BindError {
            role,
            address,
            reason: e.to_string(),
        })
}

/// `host:port`, bracketing IPv6 literals
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    )
}

/// Next accepted connection, or `None` once the listener should stop.
///
/// Shutdown is the expected way out and is not reported as a failure.
async fn accept_next(
    listener: &TcpListener,
    role: &'static str,
    name: &str,
    shutdown: &CancellationToken,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(client = %name, "{} listener closed", role);
                return None;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => return Some(conn),
            Err(e) if is_transient_accept_error(&e) => {
                warn!(client = %name, "Transient {} accept error: {}", role, e);
            }
            Err(e) => {
                error!(client = %name, "{} listener failed, no longer accepting: {}", role, e);
                return None;
            }
        }
    }
}

async fn accept_users(
    listener: TcpListener,
    users: mpsc::Sender<(TcpStream, SocketAddr)>,
    name: String,
    shutdown: CancellationToken,
) {
    while let Some((stream, peer_addr)) = accept_next(&listener, "public", &name, &shutdown).await
    {
        debug!(client = %name, "New public connection from {}", peer_addr);
        if users.send((stream, peer_addr)).await.is_err() {
            break;
        }
    }
}

struct Callback {
    token: Token,
    stream: TcpStream,
    peer_addr: SocketAddr,
}

async fn accept_callbacks(
    listener: TcpListener,
    callbacks: mpsc::Sender<Callback>,
    name: String,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    while let Some((mut stream, peer_addr)) =
        accept_next(&listener, "internal", &name, &shutdown).await
    {
        let callbacks = callbacks.clone();
        let name = name.clone();
        let shutdown = shutdown.clone();

        // The token is read off the matcher task so a slow agent cannot stall it
        tracker.spawn(async move {
            let handshake = tokio::select! {
                _ = shutdown.cancelled() => return,
                handshake = tokio::time::timeout(handshake_timeout, read_token(&mut stream)) => handshake,
            };

            match handshake {
                Ok(Ok(token)) => {
                    let callback = Callback {
                        token,
                        stream,
                        peer_addr,
                    };
                    let _ = callbacks.send(callback).await;
                }
                Ok(Err(e)) => {
                    warn!(client = %name, "Bad handshake from {}: {}", peer_addr, e);
                }
                Err(_) => {
                    warn!(
                        client = %name,
                        "Handshake from {} timed out after {:?}", peer_addr, handshake_timeout
                    );
                }
            }
        });
    }
}

/// Owns every matching decision for one instance
struct Matcher {
    name: String,
    internal_address: String,
    sessions: SessionRegistry<TcpStream>,
    tokens: TokenGenerator,
    events: mpsc::Sender<ClientEvent>,
    /// Parent of every session's cancellation
    shutdown: CancellationToken,
    stopping: CancellationToken,
    tracker: TaskTracker,
    pending_timeout: Option<Duration>,
}

impl Matcher {
    async fn run(
        self,
        public_address: String,
        mut users: mpsc::Receiver<(TcpStream, SocketAddr)>,
        mut callbacks: mpsc::Receiver<Callback>,
    ) {
        if !self.notify(ClientEvent::assigned(public_address)).await {
            warn!(client = %self.name, "Subscriber went away before the public address was sent");
        }

        loop {
            tokio::select! {
                biased;
                _ = self.stopping.cancelled() => break,
                // Callbacks first so a busy public port cannot starve matching
                Some(callback) = callbacks.recv() => {
                    self.on_callback(callback);
                }
                Some((stream, peer_addr)) = users.recv() => {
                    self.on_user(stream, peer_addr).await;
                }
                else => break,
            }
        }

        let closed = self.sessions.close_pending();
        debug!(client = %self.name, "Matcher stopped, dropped {} pending users", closed);
    }

    /// Blocks while the subscriber's queue is full. False if the event was not delivered.
    async fn notify(&self, event: ClientEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.stopping.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn on_user(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let token = self.tokens.next_token();
        let session = Arc::new(
            PairedConn::new(stream)
                .with_peer_addr(peer_addr)
                .with_cancellation(self.shutdown.child_token()),
        );

        let sessions = self.sessions.clone();
        let name = self.name.clone();
        session.set_on_close(move || {
            sessions.remove(&token);
            debug!(client = %name, %token, "Backend service user {} disconnected", peer_addr);
        });
        self.sessions.insert(token, session.clone());

        debug!(client = %self.name, %token, "New backend service user from {}", peer_addr);

        if !self
            .notify(ClientEvent::new_user(token, self.internal_address.clone()))
            .await
        {
            if !self.stopping.is_cancelled() {
                warn!(
                    client = %self.name,
                    "No subscriber to notify, dropping user {}", peer_addr
                );
            }
            session.close();
            return;
        }

        let name = self.name.clone();
        let stopping = self.stopping.clone();
        let pending_timeout = self.pending_timeout;
        self.tracker.spawn(async move {
            let deadline = async {
                match pending_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = deadline => {
                    if session.expire() {
                        warn!(
                            client = %name,
                            %token,
                            "Agent did not call back within {:?}, closing user {}",
                            pending_timeout.unwrap_or_default(),
                            peer_addr
                        );
                    }
                }
                hung_up = session.near_hangup() => {
                    if hung_up && session.expire() {
                        debug!(
                            client = %name,
                            %token,
                            "User {} left before the agent called back", peer_addr
                        );
                    }
                }
                _ = session.closed() => {}
                _ = stopping.cancelled() => {}
            }
        });
    }

    fn on_callback(&self, callback: Callback) {
        let Callback {
            token,
            stream,
            peer_addr,
        } = callback;

        let Some(session) = self.sessions.get(&token) else {
            warn!(
                client = %self.name,
                %token,
                "No pending session for callback from {}, closing it", peer_addr
            );
            return;
        };

        if let Err(e) = session.set_far(stream) {
            warn!(
                client = %self.name,
                %token,
                "Rejected callback from {}: {}", peer_addr, e
            );
            return;
        }

        match session.relay(&self.tracker) {
            Ok(()) => debug!(client = %self.name, %token, "Paired callback from {}", peer_addr),
            Err(e) => warn!(client = %self.name, %token, "Failed to start relay: {}", e),
        }
    }
}
