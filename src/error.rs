//! Error types for the chat client.
//!
//! `ChatError` is what callers see. Frame-level failures (`FrameError`) never
//! escape the read loop: a bad frame is logged and dropped.

use std::time::Duration;

use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Errors that end a request or a chat turn.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Backend answered with a non-success status
    #[error("HTTP error! status: {status}")]
    Status { status: u16, body: String },

    /// Backend rejected the bearer token
    #[error("Unauthorized: sign in again or pass a valid --token")]
    Unauthorized,

    /// Network failure opening the request or reading the response
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response bytes were not valid UTF-8
    #[error("Invalid UTF-8 in response stream at byte {offset}")]
    Decode { offset: usize },

    /// The overall deadline elapsed before the stream finished
    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Caller passed arguments the backend would reject
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// File type not accepted for chat sessions
    #[error("Unsupported file '{0}': chat sessions need a CSV file")]
    UnsupportedFile(String),

    /// A turn is already in flight for this session
    #[error("A reply is still streaming; wait for it to finish")]
    Busy,

    /// No chat session has been created yet
    #[error("No active chat session")]
    NoSession,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// HTTP status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::Status { status, .. } => Some(*status),
            ChatError::Unauthorized => Some(401),
            ChatError::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Why a single frame could not be turned into a record.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),

    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    #[error("invalid JSON after normalization: {0}")]
    Json(#[from] serde_json::Error),
}
