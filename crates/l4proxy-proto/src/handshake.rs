//! Callback connection handshake
//!
//! The agent opens a connection to the broker's internal listener and
//! immediately writes the token it was notified about. Nothing else frames the
//! token, so the reader must keep reading until it has all [`TOKEN_WIDTH`]
//! bytes; a single `read` may return only part of it.

use crate::token::{Token, TokenError, TOKEN_WIDTH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed after {received} of {TOKEN_WIDTH} token bytes")]
    Truncated { received: usize },

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] TokenError),
}

/// Read exactly one token from a freshly accepted callback connection
pub async fn read_token<R>(reader: &mut R) -> Result<Token, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; TOKEN_WIDTH];
    let mut filled = 0;

    while filled < TOKEN_WIDTH {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(HandshakeError::Truncated { received: filled });
        }
        filled += n;
    }

    Ok(Token::decode(&buf)?)
}

/// Write a token in full. `write_all` retries partial writes.
pub async fn write_token<W>(writer: &mut W, token: Token) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&token.encode()).await?;
    writer.flush().await
}
