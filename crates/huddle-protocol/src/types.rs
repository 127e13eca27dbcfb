use uuid::Uuid;

/// Current version byte carried by every control frame and datagram
pub const PROTOCOL_VERSION: u8 = 1;

/// Sender id stamped on datagrams produced by the server-side mixer
pub const MIXER_SENDER: Uuid = Uuid::nil();

/// Chunk size for file transfers in both directions (32 KB)
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Participant data shared between client and server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub username: String,
    pub video_on: bool,
    pub audio_on: bool,
}

/// A completed, downloadable file in a session's inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub sender: String,
}

/// Payload kind carried in the media datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Video = 1,
    Audio = 2,
    Screen = 3,
}

impl TryFrom<u8> for MediaKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MediaKind::Video),
            2 => Ok(MediaKind::Audio),
            3 => Ok(MediaKind::Screen),
            other => Err(other),
        }
    }
}

/// Streaming flag a participant can toggle over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Error codes reported in `error` and `join_rejected` events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    MalformedMessage = 1,
    SessionFull = 2,
    UsernameTaken = 3,
    InvalidJoin = 4,
    NotJoined = 5,
    PresenterConflict = 6,
    FileTooLarge = 7,
    FileOverrun = 8,
    FileNotFound = 9,
    UploadIncomplete = 10,
    UploadInProgress = 11,
    InvalidSession = 12,
    Internal = 255,
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ErrorCode::MalformedMessage,
            2 => ErrorCode::SessionFull,
            3 => ErrorCode::UsernameTaken,
            4 => ErrorCode::InvalidJoin,
            5 => ErrorCode::NotJoined,
            6 => ErrorCode::PresenterConflict,
            7 => ErrorCode::FileTooLarge,
            8 => ErrorCode::FileOverrun,
            9 => ErrorCode::FileNotFound,
            10 => ErrorCode::UploadIncomplete,
            11 => ErrorCode::UploadInProgress,
            12 => ErrorCode::InvalidSession,
            255 => ErrorCode::Internal,
            other => return Err(other),
        })
    }
}
