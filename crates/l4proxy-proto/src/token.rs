//! Session tokens
//!
//! A token correlates a pending public connection with the agent's callback
//! connection. On the wire it is always exactly [`TOKEN_WIDTH`] ASCII digits,
//! zero-padded, with no length prefix and no terminator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Serialized width of a token in bytes. Wide enough for every `u64`.
pub const TOKEN_WIDTH: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token must be exactly {TOKEN_WIDTH} bytes, got {0}")]
    InvalidLength(usize),

    #[error("token contains non-digit byte 0x{byte:02x} at offset {offset}")]
    InvalidDigit { offset: usize, byte: u8 },

    #[error("token value out of range")]
    Overflow,
}

/// Fixed-width session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(u64);

impl Token {
    /// Value a fresh generator starts from. It is never issued itself.
    pub const INITIAL: Token = Token(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The exact bytes written during the handshake
    pub fn encode(&self) -> [u8; TOKEN_WIDTH] {
        let mut out = [b'0'; TOKEN_WIDTH];
        let mut value = self.0;
        let mut idx = TOKEN_WIDTH;
        while value > 0 {
            idx -= 1;
            out[idx] = b'0' + (value % 10) as u8;
            value /= 10;
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != TOKEN_WIDTH {
            return Err(TokenError::InvalidLength(bytes.len()));
        }

        let mut value: u64 = 0;
        for (offset, &byte) in bytes.iter().enumerate() {
            if !byte.is_ascii_digit() {
                return Err(TokenError::InvalidDigit { offset, byte });
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(byte - b'0')))
                .ok_or(TokenError::Overflow)?;
        }

        Ok(Self(value))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = TOKEN_WIDTH)
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s.as_bytes())
    }
}

/// Issues strictly increasing tokens, starting right after [`Token::INITIAL`]
#[derive(Debug)]
pub struct TokenGenerator {
    last: AtomicU64,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(Token::INITIAL.value()),
        }
    }

    pub fn next_token(&self) -> Token {
        Token(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_fixed_width() {
        assert_eq!(&Token::new(1).encode(), b"00000000000000000001");
        assert_eq!(&Token::new(0).encode(), b"00000000000000000000");
        assert_eq!(
            &Token::new(u64::MAX).encode(),
            u64::MAX.to_string().as_bytes()
        );
        assert_eq!(Token::new(42).to_string().len(), TOKEN_WIDTH);
    }

    #[test]
    fn test_display_matches_encode() {
        let token = Token::new(987_654_321);
        assert_eq!(token.to_string().as_bytes(), &token.encode());
    }

    #[test]
    fn test_decode_roundtrip_boundaries() {
        for value in [0, 1, 9, 10, 99_999, u64::MAX - 1, u64::MAX] {
            let token = Token::new(value);
            assert_eq!(Token::decode(&token.encode()), Ok(token));
        }
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            Token::decode(b"0000000000000000001"),
            Err(TokenError::InvalidLength(19))
        );
        assert_eq!(
            Token::decode(b"000000000000000000001"),
            Err(TokenError::InvalidLength(21))
        );
        assert_eq!(Token::decode(b""), Err(TokenError::InvalidLength(0)));
    }

    #[test]
    fn test_decode_rejects_non_digits() {
        assert_eq!(
            Token::decode(b"0000000000000000000x"),
            Err(TokenError::InvalidDigit {
                offset: 19,
                byte: b'x'
            })
        );
        assert!(Token::decode(b" 0000000000000000001").is_err());
        assert!(Token::decode(b"-0000000000000000001").is_err());
    }

    #[test]
    fn test_decode_rejects_overflow() {
        assert_eq!(
            Token::decode(b"99999999999999999999"),
            Err(TokenError::Overflow)
        );
        assert_eq!(
            Token::decode(b"18446744073709551616"),
            Err(TokenError::Overflow)
        );
    }

    #[test]
    fn test_from_str() {
        let token: Token = "00000000000000000007".parse().unwrap();
        assert_eq!(token.value(), 7);
        assert!("7".parse::<Token>().is_err());
    }

    #[test]
    fn test_generator_starts_after_initial() {
        let gen = TokenGenerator::new();
        assert_eq!(gen.next_token(), Token::new(1));
        assert_eq!(gen.next_token(), Token::new(2));
    }

    #[test]
    fn test_generator_strictly_increasing_and_distinct() {
        let gen = TokenGenerator::new();
        let tokens: Vec<Token> = (0..1000).map(|_| gen.next_token()).collect();
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));

        let mut unique = tokens.clone();
        unique.dedup();
        assert_eq!(unique.len(), tokens.len());
    }
}
