//! Binary frame codec for raw TCP multiplexing.
//!
//! Frame layout (big-endian):
//! - 2 bytes: unsigned length N of the UTF-8 connection id
//! - N bytes: connection id
//! - remaining bytes: raw payload for that sub-connection
//!
//! The id namespace is scoped to one tunnel; routing is always
//! (tunnel id, connection id). A frame with an empty payload is the close
//! marker for its connection id: a live TCP read never yields zero bytes,
//! so the value is free.

use crate::error::{Error, Result};

/// Maximum connection id length representable by the 16-bit prefix.
pub const MAX_CONNECTION_ID_LEN: usize = u16::MAX as usize;

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    /// True if this frame is the close marker for its connection id.
    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Decode outcome. `Incomplete` means "buffer more bytes and retry";
/// it is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Incomplete,
}

/// Encode a frame for `connection_id` wrapping `payload`.
pub fn encode(connection_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let id = connection_id.as_bytes();
    if id.len() > MAX_CONNECTION_ID_LEN {
        return Err(Error::ConnectionIdTooLong(id.len()));
    }
    let mut out = Vec::with_capacity(2 + id.len() + payload.len());
    out.extend_from_slice(&(id.len() as u16).to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode the close marker for `connection_id`.
pub fn encode_close(connection_id: &str) -> Result<Vec<u8>> {
    encode(connection_id, &[])
}

/// Decode a frame from `buf`. Never mutates the input. Returns
/// `Decoded::Incomplete` when fewer than 2 bytes, or fewer than the
/// declared id length, are available. The only malformed case is a
/// connection id that is not valid UTF-8.
pub fn decode(buf: &[u8]) -> Result<Decoded> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }
    let id_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + id_len {
        return Ok(Decoded::Incomplete);
    }
    let connection_id = std::str::from_utf8(&buf[2..2 + id_len])
        .map_err(|_| Error::MalformedFrame)?
        .to_owned();
    Ok(Decoded::Frame(Frame {
        connection_id,
        payload: buf[2 + id_len..].to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(id: &str, payload: &[u8]) {
        let encoded = encode(id, payload).unwrap();
        match decode(&encoded).unwrap() {
            Decoded::Frame(frame) => {
                assert_eq!(frame.connection_id, id);
                assert_eq!(frame.payload, payload);
            }
            Decoded::Incomplete => panic!("complete frame decoded as incomplete"),
        }
    }

    #[test]
    fn test_roundtrip() {
        roundtrip("conn-1", b"hello world");
        roundtrip("", b"payload without id");
        roundtrip("c", &[]);
        roundtrip("verbindung-\u{00fc}ber-\u{00e4}ther", &[0x00, 0xff, 0x7f]);
    }

    #[test]
    fn test_roundtrip_large_payload() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        roundtrip("550e8400-e29b-41d4-a716-446655440000", &payload);
    }

    #[test]
    fn test_every_strict_prefix_is_incomplete() {
        let encoded = encode("abc", b"xyz").unwrap();
        // The payload is the unframed tail, so only prefixes shorter than
        // 2 + id are incomplete; anything past that decodes with a shorter
        // payload. Check the id boundary exactly.
        for len in 0..5 {
            assert_eq!(decode(&encoded[..len]).unwrap(), Decoded::Incomplete);
        }
        match decode(&encoded[..5]).unwrap() {
            Decoded::Frame(frame) => {
                assert_eq!(frame.connection_id, "abc");
                assert!(frame.payload.is_empty());
            }
            Decoded::Incomplete => panic!("id boundary should decode"),
        }
    }

    #[test]
    fn test_id_too_long_rejected() {
        let id = "x".repeat(MAX_CONNECTION_ID_LEN + 1);
        assert!(matches!(
            encode(&id, b""),
            Err(Error::ConnectionIdTooLong(_))
        ));
        // Exactly at the limit is fine.
        let id = "x".repeat(MAX_CONNECTION_ID_LEN);
        assert!(encode(&id, b"tail").is_ok());
    }

    #[test]
    fn test_non_utf8_id_is_malformed() {
        let mut buf = vec![0x00, 0x02, 0xff, 0xfe];
        buf.extend_from_slice(b"payload");
        assert!(matches!(decode(&buf), Err(Error::MalformedFrame)));
    }

    #[test]
    fn test_close_marker() {
        let encoded = encode_close("conn-9").unwrap();
        match decode(&encoded).unwrap() {
            Decoded::Frame(frame) => {
                assert!(frame.is_close());
                assert_eq!(frame.connection_id, "conn-9");
            }
            Decoded::Incomplete => panic!("close marker should decode"),
        }
    }
}
