//! Source Query `A2S_INFO` datagrams.
//!
//! A request may be answered with a challenge (`S2C_CHALLENGE`), in which case the
//! same request is re-sent with the 4 challenge bytes appended.

use crate::{DecodeError, Reader};

const SINGLE_PACKET: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_PACKET: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

const A2S_INFO: u8 = 0x54;
const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO_SRC: u8 = 0x49;
const S2A_INFO_GOLDSRC: u8 = 0x6D;

const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoReply {
    Challenge([u8; 4]),
    Info(ServerInfo),
}

pub fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + INFO_PAYLOAD.len() + 4);
    out.extend_from_slice(&SINGLE_PACKET);
    out.push(A2S_INFO);
    out.extend_from_slice(INFO_PAYLOAD);
    if let Some(c) = challenge {
        out.extend_from_slice(&c);
    }
    out
}

pub fn parse_info_reply(buf: &[u8]) -> Result<InfoReply, DecodeError> {
    let mut r = Reader::new(buf);
    let header = r.take(4)?;
    if header == SPLIT_PACKET {
        return Err(DecodeError::Unsupported(
            "split A2S_INFO response".to_string(),
        ));
    }
    if header != SINGLE_PACKET {
        return Err(DecodeError::InvalidHeader(format!("{header:02x?}")));
    }

    match r.u8()? {
        S2C_CHALLENGE => {
            let c = r.take(4)?;
            Ok(InfoReply::Challenge([c[0], c[1], c[2], c[3]]))
        }
        S2A_INFO_SRC => {
            let _protocol = r.u8()?;
            let name = r.cstr()?;
            let map = r.cstr()?;
            let folder = r.cstr()?;
            let game = r.cstr()?;
            let _app_id = r.i16_le()?;
            let players = r.u8()?;
            let max_players = r.u8()?;
            let bots = r.u8()?;
            // Remaining fields (server type, environment, visibility, vac, version, EDF)
            // are not consumed.
            Ok(InfoReply::Info(ServerInfo {
                name,
                map,
                folder,
                game,
                players,
                max_players,
                bots,
            }))
        }
        S2A_INFO_GOLDSRC => {
            let _address = r.cstr()?;
            let name = r.cstr()?;
            let map = r.cstr()?;
            let folder = r.cstr()?;
            let game = r.cstr()?;
            let players = r.u8()?;
            let max_players = r.u8()?;
            let _protocol = r.u8()?;
            Ok(InfoReply::Info(ServerInfo {
                name,
                map,
                folder,
                game,
                players,
                max_players,
                bots: 0,
            }))
        }
        other => Err(DecodeError::Unsupported(format!(
            "response type 0x{other:02x}"
        ))),
    }
}

/// Server side of `A2S_INFO`, for answering queries from fakes and local tooling.
pub fn encode_info_reply(info: &ServerInfo) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SINGLE_PACKET);
    out.push(S2A_INFO_SRC);
    out.push(17);
    for s in [&info.name, &info.map, &info.folder, &info.game] {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(&0i16.to_le_bytes());
    out.push(info.players);
    out.push(info.max_players);
    out.push(info.bots);
    // server type, environment, visibility, vac
    out.extend_from_slice(b"dlw0");
    out.extend_from_slice(b"1.0\0");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerInfo {
        ServerInfo {
            name: "Island".to_string(),
            map: "TheIsland_WP".to_string(),
            folder: "ark".to_string(),
            game: "ARK".to_string(),
            players: 12,
            max_players: 70,
            bots: 0,
        }
    }

    #[test]
    fn request_without_challenge() {
        let req = info_request(None);
        assert_eq!(&req[..5], &[0xFF, 0xFF, 0xFF, 0xFF, 0x54]);
        assert!(req.ends_with(b"Query\0"));
    }

    #[test]
    fn request_appends_challenge() {
        let req = info_request(Some([1, 2, 3, 4]));
        assert!(req.ends_with(&[0, 1, 2, 3, 4]));
    }

    #[test]
    fn parses_challenge() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x41, 9, 8, 7, 6];
        assert_eq!(
            parse_info_reply(&buf).unwrap(),
            InfoReply::Challenge([9, 8, 7, 6])
        );
    }

    #[test]
    fn parses_source_info() {
        let buf = encode_info_reply(&sample());
        assert_eq!(parse_info_reply(&buf).unwrap(), InfoReply::Info(sample()));
    }

    #[test]
    fn rejects_split_and_truncated() {
        let split = [0xFE, 0xFF, 0xFF, 0xFF, 0x00];
        assert!(matches!(
            parse_info_reply(&split),
            Err(DecodeError::Unsupported(_))
        ));

        let buf = encode_info_reply(&sample());
        let cut = &buf[..12];
        assert!(matches!(
            parse_info_reply(cut),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_header() {
        let buf = [0x00, 0x01, 0x02, 0x03, 0x49];
        assert!(matches!(
            parse_info_reply(&buf),
            Err(DecodeError::InvalidHeader(_))
        ));
    }
}
