use huddle_protocol::{ErrorCode, ServerMessage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("{holder} is currently presenting")]
    PresenterConflict { holder: String },

    #[error("Upload of {filename} exceeds declared size of {declared} bytes")]
    FileOverrun { filename: String, declared: u64 },

    #[error("File of {size} bytes exceeds the limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("File {0} is not available")]
    FileNotFound(String),

    #[error("Upload of {filename} incomplete: received {received} of {declared} bytes")]
    UploadIncomplete {
        filename: String,
        received: u64,
        declared: u64,
    },

    #[error("Upload of {0} is already in progress")]
    UploadInProgress(String),

    #[error("Session {session} is full ({limit} participants)")]
    SessionFull { session: String, limit: usize },

    #[error("Username {0} is already taken in this session")]
    UsernameTaken(String),

    #[error("Invalid join: {0}")]
    InvalidJoin(String),

    #[error("Not joined to a session")]
    NotJoined,

    #[error("Message names session {requested}, but participant is in {actual}")]
    InvalidSession { requested: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::MalformedMessage(_)
            | RelayError::Protocol(_)
            | RelayError::ConnectionLost(_) => ErrorCode::MalformedMessage,
            RelayError::PresenterConflict { .. } => ErrorCode::PresenterConflict,
            RelayError::FileOverrun { .. } => ErrorCode::FileOverrun,
            RelayError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            RelayError::FileNotFound(_) => ErrorCode::FileNotFound,
            RelayError::UploadIncomplete { .. } => ErrorCode::UploadIncomplete,
            RelayError::UploadInProgress(_) => ErrorCode::UploadInProgress,
            RelayError::SessionFull { .. } => ErrorCode::SessionFull,
            RelayError::UsernameTaken(_) => ErrorCode::UsernameTaken,
            RelayError::InvalidJoin(_) => ErrorCode::InvalidJoin,
            RelayError::NotJoined => ErrorCode::NotJoined,
            RelayError::InvalidSession { .. } => ErrorCode::InvalidSession,
            RelayError::Io(_) | RelayError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the handler must stop serving the connection after this error
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectionLost(_) | RelayError::Protocol(_)
        )
    }

    /// Event reported to the participant that caused the error
    pub fn to_event(&self) -> ServerMessage {
        let message = match self {
            RelayError::Io(e) => {
                tracing::warn!("I/O error while serving participant: {:?}", e);
                "Internal server error".to_string()
            }
            RelayError::Internal(e) => {
                tracing::warn!("Internal error while serving participant: {:?}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        ServerMessage::Error {
            code: self.code(),
            message,
        }
    }

    /// Rejection sent in place of `joined` when the handshake fails
    pub fn to_rejection(&self) -> ServerMessage {
        ServerMessage::JoinRejected {
            code: self.code(),
            reason: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
