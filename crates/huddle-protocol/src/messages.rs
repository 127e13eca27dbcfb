use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{ErrorCode, FileEntry, ParticipantInfo};

/// Messages sent from client to server over the control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Join handshake, must be the first frame on a connection
    Join {
        session: String,
        username: String,
        media_port: Option<u16>,
    },

    /// Chat message to the rest of the session
    Chat {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Camera streaming toggled
    VideoStatus { streaming: bool },

    /// Microphone streaming toggled
    AudioStatus { streaming: bool },

    /// Ask for the session's presenter lock
    ScreenShareRequest,

    /// Give the presenter lock back
    ScreenShareStop,

    /// Announce an upload
    FileMetadata {
        session: String,
        filename: String,
        size: u64,
    },

    /// One upload chunk
    FileChunk { filename: String, data: Bytes },

    /// Upload finished
    FileEnd { filename: String },

    /// Ask for a completed file
    FileRequest { filename: String },

    /// Keepalive, optionally announcing a new media port
    Heartbeat { media_port: Option<u16> },

    /// Leave the session and close the connection
    Leave,
}

/// Messages sent from server to client over the control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake accepted
    Joined {
        participant_id: Uuid,
        session: String,
        participants: Vec<ParticipantInfo>,
        presenter: Option<Uuid>,
        files: Vec<FileEntry>,
    },

    /// Handshake refused, the connection closes after this
    JoinRejected { code: ErrorCode, reason: String },

    /// Someone joined the session
    ParticipantJoined { participant: ParticipantInfo },

    /// Someone left the session
    ParticipantLeft {
        participant_id: Uuid,
        username: String,
    },

    /// Chat message from a participant
    Chat {
        sender_id: Uuid,
        username: String,
        message: String,
        timestamp: DateTime<Utc>,
        sequence: u64,
    },

    /// Server-generated system message
    Notice { text: String },

    /// A participant's camera state changed
    VideoStatus {
        participant_id: Uuid,
        username: String,
        streaming: bool,
    },

    /// A participant's microphone state changed
    AudioStatus {
        participant_id: Uuid,
        username: String,
        streaming: bool,
    },

    /// Presenter lock granted
    PresenterGranted {
        participant_id: Uuid,
        username: String,
    },

    /// Presenter lock request refused (sent to the requester only)
    PresenterDenied {
        holder_id: Uuid,
        holder_username: String,
        reason: String,
    },

    /// Presenter lock released
    PresenterReleased { participant_id: Uuid },

    /// A completed upload is now downloadable
    FileAvailable {
        filename: String,
        size: u64,
        sender: String,
    },

    /// Download begins
    FileStart { filename: String, size: u64 },

    /// Download chunk
    FileChunk {
        filename: String,
        offset: u64,
        data: Bytes,
    },

    /// Download finished
    FileEnd { filename: String },

    /// Error reported to the affected participant
    Error { code: ErrorCode, message: String },
}
