//! L4 Proxy Protocol Definitions
//!
//! This crate defines the pieces both ends of the reverse tunnel must agree on:
//! the fixed-width session token written on callback connections, and the
//! control-plane messages carried between the broker and its agents.

pub mod codec;
pub mod handshake;
pub mod messages;
pub mod token;

pub use codec::{CodecError, ControlCodec};
pub use handshake::{read_token, write_token, HandshakeError};
pub use messages::*;
pub use token::{Token, TokenError, TokenGenerator, TOKEN_WIDTH};

/// Maximum control frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
