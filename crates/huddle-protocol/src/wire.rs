//! Binary encoding of control-channel messages
//!
//! Every frame body is laid out as:
//! - 1 byte: protocol version
//! - 1 byte: message kind
//! - kind-specific fields
//!
//! Field encodings: integers big-endian, `bool` as one byte, strings as a
//! `u16` length followed by UTF-8, blobs as a `u32` length followed by the
//! bytes, ids as 16 raw UUID bytes, timestamps as `i64` Unix milliseconds,
//! optionals as a presence byte followed by the value, lists as a `u16` count.
//!
//! The outer 4-byte length prefix is applied by the transport codec, not here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::messages::{ClientMessage, ServerMessage};
use crate::types::{ErrorCode, FileEntry, PROTOCOL_VERSION, ParticipantInfo};

mod kind {
    pub const JOIN: u8 = 0x01;
    pub const CHAT: u8 = 0x02;
    pub const VIDEO_STATUS: u8 = 0x03;
    pub const AUDIO_STATUS: u8 = 0x04;
    pub const SCREEN_SHARE_REQUEST: u8 = 0x05;
    pub const SCREEN_SHARE_STOP: u8 = 0x06;
    pub const FILE_METADATA: u8 = 0x07;
    pub const FILE_CHUNK: u8 = 0x08;
    pub const FILE_END: u8 = 0x09;
    pub const FILE_REQUEST: u8 = 0x0A;
    pub const HEARTBEAT: u8 = 0x0B;
    pub const LEAVE: u8 = 0x0C;

    pub const JOINED: u8 = 0x81;
    pub const JOIN_REJECTED: u8 = 0x82;
    pub const PARTICIPANT_JOINED: u8 = 0x83;
    pub const PARTICIPANT_LEFT: u8 = 0x84;
    pub const SERVER_CHAT: u8 = 0x85;
    pub const NOTICE: u8 = 0x86;
    pub const SERVER_VIDEO_STATUS: u8 = 0x87;
    pub const SERVER_AUDIO_STATUS: u8 = 0x88;
    pub const PRESENTER_GRANTED: u8 = 0x89;
    pub const PRESENTER_DENIED: u8 = 0x8A;
    pub const PRESENTER_RELEASED: u8 = 0x8B;
    pub const FILE_AVAILABLE: u8 = 0x8C;
    pub const FILE_START: u8 = 0x8D;
    pub const SERVER_FILE_CHUNK: u8 = 0x8E;
    pub const SERVER_FILE_END: u8 = 0x8F;
    pub const ERROR: u8 = 0x90;
}

/// Reasons a frame body could not be decoded
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

impl WireError {
    /// Framing-level failures mean the peer does not speak this protocol.
    pub fn is_framing(&self) -> bool {
        matches!(self, WireError::Empty | WireError::UnsupportedVersion(_))
    }
}

/// Split the version/kind header off a frame body.
fn open_frame(frame: &mut Bytes) -> Result<u8, WireError> {
    if frame.is_empty() {
        return Err(WireError::Empty);
    }
    let version = frame.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    if frame.is_empty() {
        return Err(WireError::Empty);
    }
    Ok(frame.get_u8())
}

fn start_frame(kind: u8, capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + capacity);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(kind);
    buf
}

struct Reader {
    buf: Bytes,
    kind: &'static str,
}

impl Reader {
    fn new(buf: Bytes, kind: &'static str) -> Self {
        Self { buf, kind }
    }

    fn malformed(&self, reason: impl Into<String>) -> WireError {
        WireError::Malformed {
            kind: self.kind,
            reason: reason.into(),
        }
    }

    fn need(&self, len: usize) -> Result<(), WireError> {
        if self.buf.remaining() < len {
            return Err(self.malformed(format!(
                "truncated: need {} bytes, {} left",
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.malformed(format!("invalid bool byte {}", other))),
        }
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| self.malformed("string is not UTF-8"))
    }

    fn blob(&mut self) -> Result<Bytes, WireError> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn uuid(&mut self) -> Result<Uuid, WireError> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, WireError> {
        self.need(8)?;
        let millis = self.buf.get_i64();
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| self.malformed(format!("timestamp {} out of range", millis)))
    }

    fn opt_u16(&mut self) -> Result<Option<u16>, WireError> {
        if self.bool()? {
            Ok(Some(self.u16()?))
        } else {
            Ok(None)
        }
    }

    fn opt_uuid(&mut self) -> Result<Option<Uuid>, WireError> {
        if self.bool()? {
            Ok(Some(self.uuid()?))
        } else {
            Ok(None)
        }
    }

    fn error_code(&mut self) -> Result<ErrorCode, WireError> {
        let raw = self.u8()?;
        ErrorCode::try_from(raw).map_err(|c| self.malformed(format!("unknown error code {}", c)))
    }

    fn participant(&mut self) -> Result<ParticipantInfo, WireError> {
        Ok(ParticipantInfo {
            id: self.uuid()?,
            username: self.string()?,
            video_on: self.bool()?,
            audio_on: self.bool()?,
        })
    }

    fn file_entry(&mut self) -> Result<FileEntry, WireError> {
        Ok(FileEntry {
            filename: self.string()?,
            size: self.u64()?,
            sender: self.string()?,
        })
    }

    fn finish<T>(self, value: T) -> Result<T, WireError> {
        if self.buf.has_remaining() {
            return Err(self.malformed(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(value)
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // Longer strings are cut at the nearest char boundary below the u16 limit.
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16(end as u16);
    buf.put_slice(&value.as_bytes()[..end]);
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

fn put_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

fn put_opt_u16(buf: &mut BytesMut, value: Option<u16>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u16(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_participant(buf: &mut BytesMut, p: &ParticipantInfo) {
    put_uuid(buf, &p.id);
    put_str(buf, &p.username);
    put_bool(buf, p.video_on);
    put_bool(buf, p.audio_on);
}

fn put_file_entry(buf: &mut BytesMut, f: &FileEntry) {
    put_str(buf, &f.filename);
    buf.put_u64(f.size);
    put_str(buf, &f.sender);
}

fn put_count(buf: &mut BytesMut, len: usize) -> usize {
    let count = len.min(u16::MAX as usize);
    buf.put_u16(count as u16);
    count
}

impl ClientMessage {
    /// Wire name of this message kind, as used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::VideoStatus { .. } => "video_status",
            ClientMessage::AudioStatus { .. } => "audio_status",
            ClientMessage::ScreenShareRequest => "screen_share_request",
            ClientMessage::ScreenShareStop => "screen_share_stop",
            ClientMessage::FileMetadata { .. } => "file_metadata",
            ClientMessage::FileChunk { .. } => "file_chunk",
            ClientMessage::FileEnd { .. } => "file_end",
            ClientMessage::FileRequest { .. } => "file_request",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::Leave => "leave",
        }
    }

    /// Encode into a frame body (without the length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf;
        match self {
            ClientMessage::Join {
                session,
                username,
                media_port,
            } => {
                buf = start_frame(kind::JOIN, session.len() + username.len() + 8);
                put_str(&mut buf, session);
                put_str(&mut buf, username);
                put_opt_u16(&mut buf, *media_port);
            }
            ClientMessage::Chat { message, timestamp } => {
                buf = start_frame(kind::CHAT, message.len() + 10);
                put_str(&mut buf, message);
                buf.put_i64(timestamp.timestamp_millis());
            }
            ClientMessage::VideoStatus { streaming } => {
                buf = start_frame(kind::VIDEO_STATUS, 1);
                put_bool(&mut buf, *streaming);
            }
            ClientMessage::AudioStatus { streaming } => {
                buf = start_frame(kind::AUDIO_STATUS, 1);
                put_bool(&mut buf, *streaming);
            }
            ClientMessage::ScreenShareRequest => {
                buf = start_frame(kind::SCREEN_SHARE_REQUEST, 0);
            }
            ClientMessage::ScreenShareStop => {
                buf = start_frame(kind::SCREEN_SHARE_STOP, 0);
            }
            ClientMessage::FileMetadata {
                session,
                filename,
                size,
            } => {
                buf = start_frame(kind::FILE_METADATA, session.len() + filename.len() + 12);
                put_str(&mut buf, session);
                put_str(&mut buf, filename);
                buf.put_u64(*size);
            }
            ClientMessage::FileChunk { filename, data } => {
                buf = start_frame(kind::FILE_CHUNK, filename.len() + data.len() + 6);
                put_str(&mut buf, filename);
                put_blob(&mut buf, data);
            }
            ClientMessage::FileEnd { filename } => {
                buf = start_frame(kind::FILE_END, filename.len() + 2);
                put_str(&mut buf, filename);
            }
            ClientMessage::FileRequest { filename } => {
                buf = start_frame(kind::FILE_REQUEST, filename.len() + 2);
                put_str(&mut buf, filename);
            }
            ClientMessage::Heartbeat { media_port } => {
                buf = start_frame(kind::HEARTBEAT, 3);
                put_opt_u16(&mut buf, *media_port);
            }
            ClientMessage::Leave => {
                buf = start_frame(kind::LEAVE, 0);
            }
        }
        buf.freeze()
    }

    /// Decode a frame body (without the length prefix)
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        let tag = open_frame(&mut frame)?;
        match tag {
            kind::JOIN => {
                let mut r = Reader::new(frame, "join");
                let msg = ClientMessage::Join {
                    session: r.string()?,
                    username: r.string()?,
                    media_port: r.opt_u16()?,
                };
                r.finish(msg)
            }
            kind::CHAT => {
                let mut r = Reader::new(frame, "chat");
                let msg = ClientMessage::Chat {
                    message: r.string()?,
                    timestamp: r.timestamp()?,
                };
                r.finish(msg)
            }
            kind::VIDEO_STATUS => {
                let mut r = Reader::new(frame, "video_status");
                let msg = ClientMessage::VideoStatus {
                    streaming: r.bool()?,
                };
                r.finish(msg)
            }
            kind::AUDIO_STATUS => {
                let mut r = Reader::new(frame, "audio_status");
                let msg = ClientMessage::AudioStatus {
                    streaming: r.bool()?,
                };
                r.finish(msg)
            }
            kind::SCREEN_SHARE_REQUEST => {
                Reader::new(frame, "screen_share_request").finish(ClientMessage::ScreenShareRequest)
            }
            kind::SCREEN_SHARE_STOP => {
                Reader::new(frame, "screen_share_stop").finish(ClientMessage::ScreenShareStop)
            }
            kind::FILE_METADATA => {
                let mut r = Reader::new(frame, "file_metadata");
                let msg = ClientMessage::FileMetadata {
                    session: r.string()?,
                    filename: r.string()?,
                    size: r.u64()?,
                };
                r.finish(msg)
            }
            kind::FILE_CHUNK => {
                let mut r = Reader::new(frame, "file_chunk");
                let msg = ClientMessage::FileChunk {
                    filename: r.string()?,
                    data: r.blob()?,
                };
                r.finish(msg)
            }
            kind::FILE_END => {
                let mut r = Reader::new(frame, "file_end");
                let msg = ClientMessage::FileEnd {
                    filename: r.string()?,
                };
                r.finish(msg)
            }
            kind::FILE_REQUEST => {
                let mut r = Reader::new(frame, "file_request");
                let msg = ClientMessage::FileRequest {
                    filename: r.string()?,
                };
                r.finish(msg)
            }
            kind::HEARTBEAT => {
                let mut r = Reader::new(frame, "heartbeat");
                let msg = ClientMessage::Heartbeat {
                    media_port: r.opt_u16()?,
                };
                r.finish(msg)
            }
            kind::LEAVE => Reader::new(frame, "leave").finish(ClientMessage::Leave),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl ServerMessage {
    /// Encode into a frame body (without the length prefix)
    pub fn encode(&self) -> Bytes {
        let mut buf;
        match self {
            ServerMessage::Joined {
                participant_id,
                session,
                participants,
                presenter,
                files,
            } => {
                buf = start_frame(kind::JOINED, 64 + participants.len() * 32 + files.len() * 48);
                put_uuid(&mut buf, participant_id);
                put_str(&mut buf, session);
                let count = put_count(&mut buf, participants.len());
                for p in participants.iter().take(count) {
                    put_participant(&mut buf, p);
                }
                match presenter {
                    Some(id) => {
                        buf.put_u8(1);
                        put_uuid(&mut buf, id);
                    }
                    None => buf.put_u8(0),
                }
                let count = put_count(&mut buf, files.len());
                for f in files.iter().take(count) {
                    put_file_entry(&mut buf, f);
                }
            }
            ServerMessage::JoinRejected { code, reason } => {
                buf = start_frame(kind::JOIN_REJECTED, reason.len() + 3);
                buf.put_u8(*code as u8);
                put_str(&mut buf, reason);
            }
            ServerMessage::ParticipantJoined { participant } => {
                buf = start_frame(kind::PARTICIPANT_JOINED, 32);
                put_participant(&mut buf, participant);
            }
            ServerMessage::ParticipantLeft {
                participant_id,
                username,
            } => {
                buf = start_frame(kind::PARTICIPANT_LEFT, 18 + username.len());
                put_uuid(&mut buf, participant_id);
                put_str(&mut buf, username);
            }
            ServerMessage::Chat {
                sender_id,
                username,
                message,
                timestamp,
                sequence,
            } => {
                buf = start_frame(kind::SERVER_CHAT, 36 + username.len() + message.len());
                put_uuid(&mut buf, sender_id);
                put_str(&mut buf, username);
                put_str(&mut buf, message);
                buf.put_i64(timestamp.timestamp_millis());
                buf.put_u64(*sequence);
            }
            ServerMessage::Notice { text } => {
                buf = start_frame(kind::NOTICE, 2 + text.len());
                put_str(&mut buf, text);
            }
            ServerMessage::VideoStatus {
                participant_id,
                username,
                streaming,
            } => {
                buf = start_frame(kind::SERVER_VIDEO_STATUS, 19 + username.len());
                put_uuid(&mut buf, participant_id);
                put_str(&mut buf, username);
                put_bool(&mut buf, *streaming);
            }
            ServerMessage::AudioStatus {
                participant_id,
                username,
                streaming,
            } => {
                buf = start_frame(kind::SERVER_AUDIO_STATUS, 19 + username.len());
                put_uuid(&mut buf, participant_id);
                put_str(&mut buf, username);
                put_bool(&mut buf, *streaming);
            }
            ServerMessage::PresenterGranted {
                participant_id,
                username,
            } => {
                buf = start_frame(kind::PRESENTER_GRANTED, 18 + username.len());
                put_uuid(&mut buf, participant_id);
                put_str(&mut buf, username);
            }
            ServerMessage::PresenterDenied {
                holder_id,
                holder_username,
                reason,
            } => {
                buf = start_frame(
                    kind::PRESENTER_DENIED,
                    20 + holder_username.len() + reason.len(),
                );
                put_uuid(&mut buf, holder_id);
                put_str(&mut buf, holder_username);
                put_str(&mut buf, reason);
            }
            ServerMessage::PresenterReleased { participant_id } => {
                buf = start_frame(kind::PRESENTER_RELEASED, 16);
                put_uuid(&mut buf, participant_id);
            }
            ServerMessage::FileAvailable {
                filename,
                size,
                sender,
            } => {
                buf = start_frame(kind::FILE_AVAILABLE, 12 + filename.len() + sender.len());
                put_str(&mut buf, filename);
                buf.put_u64(*size);
                put_str(&mut buf, sender);
            }
            ServerMessage::FileStart { filename, size } => {
                buf = start_frame(kind::FILE_START, 10 + filename.len());
                put_str(&mut buf, filename);
                buf.put_u64(*size);
            }
            ServerMessage::FileChunk {
                filename,
                offset,
                data,
            } => {
                buf = start_frame(kind::SERVER_FILE_CHUNK, 14 + filename.len() + data.len());
                put_str(&mut buf, filename);
                buf.put_u64(*offset);
                put_blob(&mut buf, data);
            }
            ServerMessage::FileEnd { filename } => {
                buf = start_frame(kind::SERVER_FILE_END, 2 + filename.len());
                put_str(&mut buf, filename);
            }
            ServerMessage::Error { code, message } => {
                buf = start_frame(kind::ERROR, 3 + message.len());
                buf.put_u8(*code as u8);
                put_str(&mut buf, message);
            }
        }
        buf.freeze()
    }

    /// Decode a frame body (without the length prefix)
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        let tag = open_frame(&mut frame)?;
        match tag {
            kind::JOINED => {
                let mut r = Reader::new(frame, "joined");
                let participant_id = r.uuid()?;
                let session = r.string()?;
                let count = r.u16()?;
                let mut participants = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    participants.push(r.participant()?);
                }
                let presenter = r.opt_uuid()?;
                let count = r.u16()?;
                let mut files = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    files.push(r.file_entry()?);
                }
                r.finish(ServerMessage::Joined {
                    participant_id,
                    session,
                    participants,
                    presenter,
                    files,
                })
            }
            kind::JOIN_REJECTED => {
                let mut r = Reader::new(frame, "join_rejected");
                let msg = ServerMessage::JoinRejected {
                    code: r.error_code()?,
                    reason: r.string()?,
                };
                r.finish(msg)
            }
            kind::PARTICIPANT_JOINED => {
                let mut r = Reader::new(frame, "participant_joined");
                let msg = ServerMessage::ParticipantJoined {
                    participant: r.participant()?,
                };
                r.finish(msg)
            }
            kind::PARTICIPANT_LEFT => {
                let mut r = Reader::new(frame, "participant_left");
                let msg = ServerMessage::ParticipantLeft {
                    participant_id: r.uuid()?,
                    username: r.string()?,
                };
                r.finish(msg)
            }
            kind::SERVER_CHAT => {
                let mut r = Reader::new(frame, "chat");
                let msg = ServerMessage::Chat {
                    sender_id: r.uuid()?,
                    username: r.string()?,
                    message: r.string()?,
                    timestamp: r.timestamp()?,
                    sequence: r.u64()?,
                };
                r.finish(msg)
            }
            kind::NOTICE => {
                let mut r = Reader::new(frame, "notice");
                let msg = ServerMessage::Notice { text: r.string()? };
                r.finish(msg)
            }
            kind::SERVER_VIDEO_STATUS => {
                let mut r = Reader::new(frame, "video_status");
                let msg = ServerMessage::VideoStatus {
                    participant_id: r.uuid()?,
                    username: r.string()?,
                    streaming: r.bool()?,
                };
                r.finish(msg)
            }
            kind::SERVER_AUDIO_STATUS => {
                let mut r = Reader::new(frame, "audio_status");
                let msg = ServerMessage::AudioStatus {
                    participant_id: r.uuid()?,
                    username: r.string()?,
                    streaming: r.bool()?,
                };
                r.finish(msg)
            }
            kind::PRESENTER_GRANTED => {
                let mut r = Reader::new(frame, "presenter_granted");
                let msg = ServerMessage::PresenterGranted {
                    participant_id: r.uuid()?,
                    username: r.string()?,
                };
                r.finish(msg)
            }
            kind::PRESENTER_DENIED => {
                let mut r = Reader::new(frame, "presenter_denied");
                let msg = ServerMessage::PresenterDenied {
                    holder_id: r.uuid()?,
                    holder_username: r.string()?,
                    reason: r.string()?,
                };
                r.finish(msg)
            }
            kind::PRESENTER_RELEASED => {
                let mut r = Reader::new(frame, "presenter_released");
                let msg = ServerMessage::PresenterReleased {
                    participant_id: r.uuid()?,
                };
                r.finish(msg)
            }
            kind::FILE_AVAILABLE => {
                let mut r = Reader::new(frame, "file_available");
                let msg = ServerMessage::FileAvailable {
                    filename: r.string()?,
                    size: r.u64()?,
                    sender: r.string()?,
                };
                r.finish(msg)
            }
            kind::FILE_START => {
                let mut r = Reader::new(frame, "file_start");
                let msg = ServerMessage::FileStart {
                    filename: r.string()?,
                    size: r.u64()?,
                };
                r.finish(msg)
            }
            kind::SERVER_FILE_CHUNK => {
                let mut r = Reader::new(frame, "file_chunk");
                let msg = ServerMessage::FileChunk {
                    filename: r.string()?,
                    offset: r.u64()?,
                    data: r.blob()?,
                };
                r.finish(msg)
            }
            kind::SERVER_FILE_END => {
                let mut r = Reader::new(frame, "file_end");
                let msg = ServerMessage::FileEnd {
                    filename: r.string()?,
                };
                r.finish(msg)
            }
            kind::ERROR => {
                let mut r = Reader::new(frame, "error");
                let msg = ServerMessage::Error {
                    code: r.error_code()?,
                    message: r.string()?,
                };
                r.finish(msg)
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_layout() {
        let msg = ClientMessage::Join {
            session: "S".to_string(),
            username: "al".to_string(),
            media_port: Some(5000),
        };
        let bytes = msg.encode();
        assert_eq!(
            &bytes[..],
            &[1, 0x01, 0, 1, b'S', 0, 2, b'a', b'l', 1, 0x13, 0x88]
        );
        assert_eq!(ClientMessage::decode(bytes).unwrap(), msg);
    }

    #[test]
    fn test_chat_preserves_timestamp_millis() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let msg = ServerMessage::Chat {
            sender_id: Uuid::new_v4(),
            username: "bob".to_string(),
            message: "hi".to_string(),
            timestamp,
            sequence: 7,
        };
        let decoded = ServerMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_joined_with_roster_and_files() {
        let alice = Uuid::new_v4();
        let msg = ServerMessage::Joined {
            participant_id: alice,
            session: "S".to_string(),
            participants: vec![ParticipantInfo {
                id: alice,
                username: "alice".to_string(),
                video_on: true,
                audio_on: false,
            }],
            presenter: Some(alice),
            files: vec![FileEntry {
                filename: "doc.pdf".to_string(),
                size: 100_000,
                sender: "alice".to_string(),
            }],
        };
        assert_eq!(ServerMessage::decode(msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_empty_frame_is_framing_error() {
        let err = ClientMessage::decode(Bytes::new()).unwrap_err();
        assert_eq!(err, WireError::Empty);
        assert!(err.is_framing());
    }

    #[test]
    fn test_version_mismatch_is_framing_error() {
        let err = ClientMessage::decode(Bytes::from_static(&[9, 0x02])).unwrap_err();
        assert_eq!(err, WireError::UnsupportedVersion(9));
        assert!(err.is_framing());
    }

    #[test]
    fn test_unknown_kind_is_not_framing_error() {
        let err = ClientMessage::decode(Bytes::from_static(&[1, 0x7f, 1, 2, 3])).unwrap_err();
        assert_eq!(err, WireError::UnknownKind(0x7f));
        assert!(!err.is_framing());
    }

    #[test]
    fn test_truncated_string_is_malformed() {
        // chat claiming a 10-byte message but carrying 2
        let err = ClientMessage::decode(Bytes::from_static(&[1, 0x02, 0, 10, b'h', b'i']))
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed { kind: "chat", .. }));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let err = ClientMessage::decode(Bytes::from_static(&[1, 0x05, 0])).unwrap_err();
        assert!(matches!(
            err,
            WireError::Malformed {
                kind: "screen_share_request",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_bool_is_malformed() {
        let err = ClientMessage::decode(Bytes::from_static(&[1, 0x03, 2])).unwrap_err();
        assert!(matches!(err, WireError::Malformed { .. }));
    }

    #[test]
    fn test_full_size_file_chunk() {
        let data = Bytes::from(vec![7u8; crate::types::FILE_CHUNK_SIZE]);
        let msg = ClientMessage::FileChunk {
            filename: "a.bin".to_string(),
            data: data.clone(),
        };
        match ClientMessage::decode(msg.encode()).unwrap() {
            ClientMessage::FileChunk { filename, data: got } => {
                assert_eq!(filename, "a.bin");
                assert_eq!(got, data);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_long_strings_are_cut_on_char_boundary() {
        let long = "é".repeat(40_000);
        let msg = ServerMessage::Notice { text: long };
        match ServerMessage::decode(msg.encode()).unwrap() {
            ServerMessage::Notice { text } => {
                assert!(text.len() <= u16::MAX as usize);
                assert!(text.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
