//! Error taxonomy of an export session.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Bad or duplicate configuration. Fatal to the session.
    #[error("config error: {0}")]
    Config(String),

    /// Message received in a state that does not accept it.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// The encoder rejected or failed on a single frame; the frame is dropped.
    #[error("encode error: {0}")]
    Encode(String),

    /// Internal consistency violation, e.g. a chunk whose declared size does
    /// not match its payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// The underlying encoder is unusable; every later operation fails.
    #[error("session dead: {0}")]
    SessionDead(String),
}

impl ExportError {
    /// Whether the session can keep accepting frames after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExportError::Encode(_))
    }
}

impl From<ffmpeg_next::Error> for ExportError {
    fn from(err: ffmpeg_next::Error) -> Self {
        ExportError::Encode(err.to_string())
    }
}
