//! Control-plane message types

use crate::token::Token;
use serde::{Deserialize, Serialize};

/// Every frame exchanged on a control connection
///
/// The first frame a caller sends selects the RPC; a connection carries exactly one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Agent registers and asks for a public endpoint (0 = any free port).
    /// Answered by a stream of `ClientEvent` frames.
    CreateClient {
        display_name: String,
        public_port: u16,
        internal_port: u16,
    },
    ClientEvent(ClientEvent),

    // Heartbeat on the event stream
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    /// Broker ends an event stream
    Disconnect {
        reason: String,
    },

    ListClients,
    Clients {
        clients: Vec<ClientInfo>,
    },
    ListBackendServiceUsers {
        parent: String,
    },
    BackendServiceUsers {
        users: Vec<BackendServiceUser>,
    },

    Error {
        code: ErrorCode,
        message: String,
    },
}

/// One entry of a registration's event stream
///
/// Either `public_address` is set (the first event) or `token` and
/// `internal_address` are set, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientEvent {
    pub public_address: String,
    pub token: String,
    pub internal_address: String,
}

/// Typed view of a [`ClientEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    Assigned {
        public_address: &'a str,
    },
    NewUser {
        token: &'a str,
        internal_address: &'a str,
    },
}

impl ClientEvent {
    pub fn assigned(public_address: impl Into<String>) -> Self {
        Self {
            public_address: public_address.into(),
            ..Default::default()
        }
    }

    pub fn new_user(token: Token, internal_address: impl Into<String>) -> Self {
        Self {
            public_address: String::new(),
            token: token.to_string(),
            internal_address: internal_address.into(),
        }
    }

    /// Classified by the presence of `public_address`
    pub fn kind(&self) -> EventKind<'_> {
        if !self.public_address.is_empty() {
            EventKind::Assigned {
                public_address: &self.public_address,
            }
        } else {
            EventKind::NewUser {
                token: &self.token,
                internal_address: &self.internal_address,
            }
        }
    }
}

/// A registered agent as reported by `ListClients`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub display_name: String,
    pub public_address: String,
    pub internal_address: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// A public user connected through an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendServiceUser {
    pub user_address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    NameConflict,
    NotFound,
    BindFailed,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NameConflict => "name-conflict",
            ErrorCode::NotFound => "not-found",
            ErrorCode::BindFailed => "bind-failed",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::Internal => "internal",
        }
    }
}
