//! Paired connections
//!
//! A [`PairedConn`] owns a "near" and a "far" byte stream and copies bytes in
//! both directions until either side ends. On the broker the near side is the
//! public user and the far side is the agent's callback connection; on the
//! agent the near side is the callback connection and the far side is the
//! backend service.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes held from a pending near side before reading from it stops
const EARLY_LIMIT: usize = 64 * 1024;

/// Callback fired once, after both connections of a pair are closed
pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Near side only, waiting for the far side
    Pending,
    /// Both sides assigned and relaying
    Active,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("session is closed")]
    Closed,

    #[error("session is already relaying")]
    AlreadyActive,

    #[error("far side is already assigned")]
    FarAlreadySet,

    #[error("far side is not assigned")]
    Incomplete,
}

struct Inner<S> {
    near: Option<S>,
    far: Option<S>,
    /// Read from the near side while pending, replayed to the far side first
    early: Vec<u8>,
    on_close: Option<OnClose>,
    state: SessionState,
    relaying: bool,
}

pub struct PairedConn<S> {
    inner: Mutex<Inner<S>>,
    peer_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl<S> PairedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// A pending pair with only the near side set
    pub fn new(near: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                near: Some(near),
                far: None,
                early: Vec::new(),
                on_close: None,
                state: SessionState::Pending,
                relaying: false,
            }),
            peer_addr: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A pair that is ready to relay
    pub fn with_far(near: S, far: S) -> Self {
        let pair = Self::new(near);
        pair.lock().far = Some(far);
        pair
    }

    /// Remote address of the near side, reported by user listings
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Tie this pair to a parent shutdown signal. Cancelling `token` closes the pair.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == SessionState::Pending
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Assign the far side. Only a pending pair without a far side accepts one.
    pub fn set_far(&self, far: S) -> Result<(), PairError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Closed => Err(PairError::Closed),
            SessionState::Active => Err(PairError::AlreadyActive),
            SessionState::Pending if inner.far.is_some() => Err(PairError::FarAlreadySet),
            SessionState::Pending => {
                inner.far = Some(far);
                Ok(())
            }
        }
    }

    /// Replace the on-close callback.
    ///
    /// If the pair already finished closing, the callback runs immediately.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if inner.state != SessionState::Closed || inner.relaying {
                inner.on_close = Some(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Close both connections. Idempotent; the callback fires exactly once.
    pub fn close(&self) {
        let (near, far, callback) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            // While relaying, the relay tasks own the streams and the
            // supervisor fires the callback once they have exited.
            let callback = if inner.relaying {
                None
            } else {
                inner.on_close.take()
            };
            (inner.near.take(), inner.far.take(), callback)
        };

        self.cancel.cancel();
        drop(near);
        drop(far);

        if let Some(callback) = callback {
            callback();
        }
    }

    /// Close the pair only if it is still pending. Returns whether it was closed.
    pub fn expire(&self) -> bool {
        let (near, far, callback) = {
            let mut inner = self.lock();
            if inner.state != SessionState::Pending {
                return false;
            }
            inner.state = SessionState::Closed;
            (inner.near.take(), inner.far.take(), inner.on_close.take())
        };

        self.cancel.cancel();
        drop(near);
        drop(far);

        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Resolves once the pair starts closing
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Resolves `true` once the near side hangs up while the pair is pending,
    /// or `false` as soon as the pair is no longer pending.
    ///
    /// Bytes the near side sends in the meantime are held (up to 64 KiB) and
    /// written to the far side before anything else once relaying starts.
    /// Past that limit the near side is no longer read here.
    pub async fn near_hangup(&self) -> bool {
        let mut chunk = vec![0u8; BUFFER_SIZE];
        std::future::poll_fn(|cx| {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state != SessionState::Pending {
                return Poll::Ready(false);
            }
            let Some(near) = inner.near.as_mut() else {
                return Poll::Ready(false);
            };

            while inner.early.len() < EARLY_LIMIT {
                let mut buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut *near).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) if buf.filled().is_empty() => return Poll::Ready(true),
                    Poll::Ready(Ok(())) => inner.early.extend_from_slice(buf.filled()),
                    Poll::Ready(Err(_)) => return Poll::Ready(true),
                    Poll::Pending => return Poll::Pending,
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Start copying in both directions.
    ///
    /// Both directions and their supervisor are spawned on `tracker`, so
    /// `tracker.wait()` covers full teardown. When either direction ends the
    /// pair closes, which ends the other direction too.
    pub fn relay(self: &Arc<Self>, tracker: &TaskTracker) -> Result<(), PairError> {
        let (near, far, early) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(PairError::Closed),
                SessionState::Active => return Err(PairError::AlreadyActive),
                SessionState::Pending => {}
            }
            let (near, far) = match (inner.near.take(), inner.far.take()) {
                (Some(near), Some(far)) => (near, far),
                (near, far) => {
                    inner.near = near;
                    inner.far = far;
                    return Err(PairError::Incomplete);
                }
            };
            inner.state = SessionState::Active;
            inner.relaying = true;
            (near, far, std::mem::take(&mut inner.early))
        };

        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);

        let upstream = tracker.spawn(pipe(early, near_read, far_write, self.cancel.clone()));
        let downstream = tracker.spawn(pipe(Vec::new(), far_read, near_write, self.cancel.clone()));

        let session = Arc::clone(self);
        tracker.spawn(async move {
            let (up, down) = tokio::join!(upstream, downstream);
            debug!(
                peer = ?session.peer_addr,
                near_to_far = ?relay_outcome(up),
                far_to_near = ?relay_outcome(down),
                "Relay finished"
            );
            session.finish();
        });

        Ok(())
    }

    fn finish(&self) {
        let callback = {
            let mut inner = self.lock();
            inner.state = SessionState::Closed;
            inner.relaying = false;
            inner.on_close.take()
        };
        self.cancel.cancel();

        if let Some(callback) = callback {
            callback();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn relay_outcome(
    result: Result<std::io::Result<u64>, tokio::task::JoinError>,
) -> Result<u64, String> {
    match result {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Write `prefix`, then copy one direction until EOF, an I/O error, or
/// cancellation.
///
/// Any exit cancels the pair so the opposite direction stops as well.
async fn pipe<R, W>(
    prefix: Vec<u8>,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    if !prefix.is_empty() {
        let written = tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            written = writer.write_all(&prefix) => written,
        };
        if let Err(e) = written {
            cancel.cancel();
            return Err(e);
        }
        total = prefix.len() as u64;
    }

    let result = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break Ok(total),
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(total),
            written = writer.write_all(&buffer[..n]) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }
        total += n as u64;
    };

    cancel.cancel();
    result
}
