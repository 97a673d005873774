//! Error types for the streaming engine
//!
//! REST calls report through `anyhow`; everything on the Lightstreamer
//! side of the adapter reports through [`StreamError`] so callers can
//! tell a rejected control request from a dead connection.

use thiserror::Error;

/// Errors raised by the Lightstreamer session/subscription engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Network or IO failure reaching the server
    #[error("Transport error: {0}")]
    Transport(String),

    /// Create/bind session did not answer OK
    #[error("Session error: {message}")]
    Session {
        message: String,
        /// Remaining lines of the server response, kept for diagnosis
        diagnostic: Vec<String>,
    },

    /// Control request answered with something other than OK
    #[error("Control request {op} rejected: {response}")]
    ControlRejected { op: String, response: String },

    /// Update arrived for a handle that is no longer tracked
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    /// Server terminated the stream (ERROR / SYNC ERROR / END)
    #[error("Stream terminated by server: {0}")]
    ProtocolTermination(String),

    /// Control operation issued without a live session
    #[error("No active session")]
    NoSession,

    /// Line that could not be tokenized
    #[error("Malformed line: {0}")]
    Malformed(String),

    /// Listener index not of the form `<name>#<ordinal>`
    #[error("Invalid listener index: {0}")]
    InvalidListenerIndex(String),
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for StreamError {
    fn from(err: url::ParseError) -> Self {
        StreamError::Transport(format!("invalid url: {}", err))
    }
}

/// Result type for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;
