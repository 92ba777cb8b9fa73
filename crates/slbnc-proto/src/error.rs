//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors surfaced by the codec and message layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message of {actual} bytes exceeds the {limit} byte limit")]
    MessageTooLong { actual: usize, limit: usize },

    #[error("invalid UTF-8 at byte {byte_pos}")]
    InvalidUtf8 { byte_pos: usize },

    #[error("invalid message {string:?}: {cause}")]
    InvalidMessage {
        string: String,
        cause: MessageParseError,
    },
}

/// Errors produced while parsing a single IRC message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("empty message")]
    EmptyMessage,

    #[error("missing command")]
    MissingCommand,

    #[error("invalid prefix {0:?}")]
    InvalidPrefix(String),

    #[error("parse error at byte {position}")]
    ParseFailure { position: usize },
}
