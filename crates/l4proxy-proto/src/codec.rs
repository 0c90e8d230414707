//! Codec for encoding/decoding control messages
//!
//! Format: [length: u32 big-endian][payload: bincode serialized message]

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control message codec, for use with `tokio_util::codec::Framed`
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        let msg = bincode::deserialize(&payload)?;

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ClientEvent;
    use crate::token::Token;

    fn encode(msg: ControlMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        ControlCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode() {
        let msg = ControlMessage::Ping { timestamp: 12345 };

        let mut buf = encode(msg.clone());
        let decoded = ControlCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::ClientEvent(ClientEvent::new_user(
            Token::new(9),
            "127.0.0.1:7001",
        ));
        let encoded = encode(msg.clone());

        // Only the length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), None);

        // Header plus part of the payload
        buf.extend_from_slice(&encoded[4..encoded.len() - 1]);
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = ControlMessage::ListClients;
        let msg2 = ControlMessage::ListBackendServiceUsers {
            parent: "abc".to_string(),
        };

        let mut buf = encode(msg1.clone());
        buf.extend_from_slice(&encode(msg2.clone()));

        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg2));
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);

        let result = ControlCodec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[test]
    fn test_decode_rejects_garbage_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let result = ControlCodec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }
}
