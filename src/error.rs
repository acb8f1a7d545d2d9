//! Chat client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The channel is not `Open`; callers fall back to a local reply.
    #[error("not connected")]
    NotConnected,

    /// The host offers no dictation capability.
    #[error("speech recognition is not available")]
    SpeechUnavailable,

    #[error("speech engine error: {0}")]
    Speech(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
