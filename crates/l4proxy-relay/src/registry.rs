//! Per-instance session registry
//!
//! Maps tokens to the paired connections they identify. Inserts come from the
//! instance's control task while removals come from on-close callbacks running
//! on relay tasks, so every access goes through one mutex. The lock is never
//! held while a session is closed or a callback runs.

use crate::paired::PairedConn;
use l4proxy_proto::Token;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};

type Sessions<S> = BTreeMap<Token, Arc<PairedConn<S>>>;

pub struct SessionRegistry<S> {
    sessions: Arc<Mutex<Sessions<S>>>,
}

impl<S> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<S> SessionRegistry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Track a session. Returns the session previously stored under `token`, if any.
    pub fn insert(&self, token: Token, session: Arc<PairedConn<S>>) -> Option<Arc<PairedConn<S>>> {
        self.lock().insert(token, session)
    }

    pub fn get(&self, token: &Token) -> Option<Arc<PairedConn<S>>> {
        self.lock().get(token).cloned()
    }

    pub fn remove(&self, token: &Token) -> Option<Arc<PairedConn<S>>> {
        self.lock().remove(token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Near-side addresses of every session that is not closed, in token order
    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.lock()
            .values()
            .filter(|session| !session.is_closed())
            .filter_map(|session| session.peer_addr())
            .collect()
    }

    /// Remove every session and close it outside the lock
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for session in drained.into_values() {
            session.close();
        }
        count
    }

    /// Remove and close sessions still waiting for their far side.
    /// Active sessions keep relaying and deregister themselves.
    pub fn close_pending(&self) -> usize {
        let pending: Vec<_> = {
            let mut sessions = self.lock();
            let tokens: Vec<Token> = sessions
                .iter()
                .filter(|(_, session)| session.is_pending())
                .map(|(token, _)| *token)
                .collect();
            tokens
                .iter()
                .filter_map(|token| sessions.remove(token))
                .collect()
        };

        let mut closed = 0;
        for session in pending {
            if session.expire() {
                closed += 1;
            }
        }
        closed
    }

    fn lock(&self) -> MutexGuard<'_, Sessions<S>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Default for SessionRegistry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
