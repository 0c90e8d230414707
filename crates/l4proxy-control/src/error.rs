use l4proxy_proto::{CodecError, ErrorCode};
use l4proxy_relay::RelayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Client {0} is already registered")]
    NameConflict(String),

    #[error("Client {0} not found")]
    NotFound(String),

    #[error("Failed to start client: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Control plane is shutting down")]
    ShuttingDown,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Wire code reported to the caller
    pub fn code(&self) -> ErrorCode {
        match self {
            ControlError::NameConflict(_) => ErrorCode::NameConflict,
            ControlError::NotFound(_) => ErrorCode::NotFound,
            ControlError::Relay(RelayError::BindError { .. }) => ErrorCode::BindFailed,
            ControlError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::Internal,
        }
    }
}
