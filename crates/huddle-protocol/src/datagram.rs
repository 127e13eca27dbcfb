//! Media channel datagram layout
//!
//! Each datagram is:
//! - 1 byte: protocol version
//! - 1 byte: media kind (1 video, 2 audio, 3 screen)
//! - 16 bytes: sender participant id
//! - 1 byte: session name length
//! - N bytes: session name (UTF-8)
//!
//! Followed by the opaque payload (JPEG for video/screen, PCM for audio).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{MediaKind, PROTOCOL_VERSION};

/// Size of the fixed part of the header, before the session name
pub const DATAGRAM_FIXED_HEADER: usize = 1 + 1 + 16 + 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatagramError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported datagram version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown media kind {0}")]
    UnknownKind(u8),

    #[error("session name is not UTF-8")]
    InvalidSession,

    #[error("session name longer than 255 bytes")]
    SessionTooLong,
}

/// Parsed view of a received datagram; the payload borrows from the packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDatagram<'a> {
    pub kind: MediaKind,
    pub sender: Uuid,
    pub session: &'a str,
    pub payload: &'a [u8],
}

impl<'a> MediaDatagram<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, DatagramError> {
        if packet.len() < DATAGRAM_FIXED_HEADER {
            return Err(DatagramError::TooShort(packet.len()));
        }
        if packet[0] != PROTOCOL_VERSION {
            return Err(DatagramError::UnsupportedVersion(packet[0]));
        }
        let kind = MediaKind::try_from(packet[1]).map_err(DatagramError::UnknownKind)?;

        let mut sender = [0u8; 16];
        sender.copy_from_slice(&packet[2..18]);

        let session_len = packet[18] as usize;
        let session_end = DATAGRAM_FIXED_HEADER + session_len;
        if packet.len() < session_end {
            return Err(DatagramError::TooShort(packet.len()));
        }
        let session = std::str::from_utf8(&packet[DATAGRAM_FIXED_HEADER..session_end])
            .map_err(|_| DatagramError::InvalidSession)?;

        Ok(Self {
            kind,
            sender: Uuid::from_bytes(sender),
            session,
            payload: &packet[session_end..],
        })
    }
}

/// Build a datagram from its parts
pub fn encode_datagram(
    kind: MediaKind,
    sender: Uuid,
    session: &str,
    payload: &[u8],
) -> Result<Bytes, DatagramError> {
    if session.len() > u8::MAX as usize {
        return Err(DatagramError::SessionTooLong);
    }

    let mut buf = BytesMut::with_capacity(DATAGRAM_FIXED_HEADER + session.len() + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(kind as u8);
    buf.put_slice(sender.as_bytes());
    buf.put_u8(session.len() as u8);
    buf.put_slice(session.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_borrows_payload() {
        let sender = Uuid::new_v4();
        let packet = encode_datagram(MediaKind::Video, sender, "S", b"\xff\xd8jpeg").unwrap();
        let parsed = MediaDatagram::parse(&packet).unwrap();
        assert_eq!(parsed.kind, MediaKind::Video);
        assert_eq!(parsed.sender, sender);
        assert_eq!(parsed.session, "S");
        assert_eq!(parsed.payload, b"\xff\xd8jpeg");
    }

    #[test]
    fn test_empty_payload_is_allowed() {
        let packet = encode_datagram(MediaKind::Audio, Uuid::nil(), "room", b"").unwrap();
        assert!(MediaDatagram::parse(&packet).unwrap().payload.is_empty());
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        assert_eq!(
            MediaDatagram::parse(&[1, 1, 0]),
            Err(DatagramError::TooShort(3))
        );

        let mut packet = encode_datagram(MediaKind::Screen, Uuid::nil(), "S", b"x")
            .unwrap()
            .to_vec();
        packet[1] = 9;
        assert_eq!(
            MediaDatagram::parse(&packet),
            Err(DatagramError::UnknownKind(9))
        );

        packet[0] = 2;
        assert_eq!(
            MediaDatagram::parse(&packet),
            Err(DatagramError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_session_length_past_end() {
        let mut packet = encode_datagram(MediaKind::Video, Uuid::nil(), "S", b"")
            .unwrap()
            .to_vec();
        packet[18] = 40;
        assert!(matches!(
            MediaDatagram::parse(&packet),
            Err(DatagramError::TooShort(_))
        ));
    }

    #[test]
    fn test_session_name_limit() {
        let long = "s".repeat(256);
        assert_eq!(
            encode_datagram(MediaKind::Video, Uuid::nil(), &long, b""),
            Err(DatagramError::SessionTooLong)
        );
    }
}
