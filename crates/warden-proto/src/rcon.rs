//! Source RCON packet framing.
//!
//! Wire layout (little endian): `size: i32`, `id: i32`, `type: i32`, body, `\0`, `\0`.
//! `size` counts everything after itself.

use crate::{DecodeError, Reader};

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// id + type + two NUL terminators.
pub const MIN_FRAME_LEN: usize = 10;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Id the server answers with when authentication is rejected.
pub const AUTH_FAILED_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn auth(id: i32, password: &str) -> Self {
        Self {
            id,
            kind: SERVERDATA_AUTH,
            body: password.to_string(),
        }
    }

    pub fn command(id: i32, command: &str) -> Self {
        Self {
            id,
            kind: SERVERDATA_EXECCOMMAND,
            body: command.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (MIN_FRAME_LEN + body.len()) as i32;
        let mut out = Vec::with_capacity(4 + size as usize);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Decodes one frame body (everything after the size prefix).
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::Truncated {
                needed: MIN_FRAME_LEN - frame.len(),
            });
        }
        let mut r = Reader::new(frame);
        let id = r.i32_le()?;
        let kind = r.i32_le()?;
        let rest = r.take(r.remaining())?;
        // Body is terminated by at least one NUL; some servers omit the trailing pad.
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let body = String::from_utf8_lossy(&rest[..end]).into_owned();
        Ok(Self { id, kind, body })
    }
}

/// Validates the size prefix and returns how many bytes follow it.
pub fn frame_len(size_prefix: [u8; 4]) -> Result<usize, DecodeError> {
    let size = i32::from_le_bytes(size_prefix);
    if size < MIN_FRAME_LEN as i32 || size as i64 > MAX_FRAME_LEN as i64 {
        return Err(DecodeError::InvalidSize(size as i64));
    }
    Ok(size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_layout() {
        let bytes = Packet::command(7, "saveworld").encode();
        assert_eq!(&bytes[..4], &(19i32).to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &SERVERDATA_EXECCOMMAND.to_le_bytes());
        assert_eq!(&bytes[12..21], b"saveworld");
        assert_eq!(&bytes[21..], &[0, 0]);
    }

    #[test]
    fn decode_reads_frame_after_prefix() {
        let bytes = Packet {
            id: 3,
            kind: SERVERDATA_RESPONSE_VALUE,
            body: "Server received, But no response!!".to_string(),
        }
        .encode();
        let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]]).unwrap();
        assert_eq!(len, bytes.len() - 4);

        let p = Packet::decode(&bytes[4..]).unwrap();
        assert_eq!(p.id, 3);
        assert_eq!(p.body, "Server received, But no response!!");
    }

    #[test]
    fn decode_tolerates_missing_pad() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(-1i32).to_le_bytes());
        frame.extend_from_slice(&SERVERDATA_AUTH_RESPONSE.to_le_bytes());
        frame.extend_from_slice(b"no\0\0");
        let p = Packet::decode(&frame).unwrap();
        assert_eq!(p.id, AUTH_FAILED_ID);
        assert_eq!(p.body, "no");
    }

    #[test]
    fn frame_len_rejects_out_of_range() {
        assert!(frame_len(5i32.to_le_bytes()).is_err());
        assert!(frame_len((-20i32).to_le_bytes()).is_err());
        assert!(frame_len(((MAX_FRAME_LEN as i32) + 1).to_le_bytes()).is_err());
        assert_eq!(frame_len(10i32.to_le_bytes()).unwrap(), 10);
    }
}
