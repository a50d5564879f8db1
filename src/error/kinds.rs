use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide `Result` type using [`ExportError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Top-level error type for export operations.
///
/// This type wraps more specific error kinds and provides a single
/// error type that can be used throughout the crate.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Search backend errors.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Chunk file errors.
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Export or search session errors.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Rejected state machine transition.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// Filter expression parsing errors.
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// Request execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed client frames.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with a free-form message.
    #[error("{0}")]
    Generic(String),
}

/// Search backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Backend could not be reached or answered with a server error.
    #[error("search backend unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the request or returned an unreadable body.
    #[error("search backend rejected the query: {0}")]
    QueryError(String),

    /// Backend no longer recognizes the cursor id.
    #[error("scroll cursor expired: {0}")]
    CursorExpired(String),
}

/// Chunk file errors. Each variant carries the file it concerns.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The file could not be created.
    #[error("failed to create {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Appending rows failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Flushing or closing the file failed.
    #[error("failed to flush {}: {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A row could not be encoded as CSV.
    #[error("failed to encode row for {}: {message}", path.display())]
    Encode { path: PathBuf, message: String },
}

/// Export and search session errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No session with that id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The caller does not own the session.
    #[error("not authorized to access session {0}")]
    Unauthorized(String),

    /// The session was cancelled while work was in flight.
    #[error("session {0} was cancelled")]
    Cancelled(String),
}

/// A state change the lifecycle does not allow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

impl TransitionError {
    pub fn new(from: impl ToString, to: impl ToString) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Filter expression parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A character that starts no token.
    #[error("Unexpected character '{found}' at position {position}")]
    UnexpectedChar { found: char, position: usize },

    /// A token other than the one the grammar needs.
    #[error("Expected {expected} at position {position}, found '{found}'")]
    UnexpectedToken {
        expected: String,
        found: String,
        position: usize,
    },

    /// A quoted value with no closing quote.
    #[error("Unterminated string starting at position {0}")]
    UnterminatedString(usize),

    /// The expression stopped before it was complete.
    #[error("Unexpected end of filter expression")]
    UnexpectedEnd,
}

/// Request execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Invalid operation parameters.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The requested file is not part of the session.
    #[error("Unknown file: {0}")]
    UnknownFile(String),

    /// The requested file cannot be served in its current state.
    #[error("File {file} is not ready (status: {status})")]
    FileNotReady { file: String, status: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Config file not found.
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// Invalid config format.
    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    /// Invalid field value.
    #[error("Invalid value '{value}' for field '{field}'")]
    InvalidValue { field: String, value: String },
}

impl ExportError {
    /// True when the error only reports a cooperative cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExportError::Session(SessionError::Cancelled(_)))
    }
}

impl From<String> for ExportError {
    fn from(msg: String) -> Self {
        ExportError::Generic(msg)
    }
}

impl From<&str> for ExportError {
    fn from(msg: &str) -> Self {
        ExportError::Generic(msg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_wraps_into_export_error() {
        let err: ExportError = BackendError::CursorExpired("abc".into()).into();
        assert_eq!(
            err.to_string(),
            "Backend error: scroll cursor expired: abc"
        );
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError::new("pending", "ready");
        assert_eq!(err.to_string(), "invalid transition from pending to ready");
    }

    #[test]
    fn test_write_error_mentions_path() {
        let err = WriteError::Create {
            path: PathBuf::from("/tmp/x.csv"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/tmp/x.csv"));
    }

    #[test]
    fn test_is_cancellation() {
        let err: ExportError = SessionError::Cancelled("s1".into()).into();
        assert!(err.is_cancellation());
        let err: ExportError = SessionError::NotFound("s1".into()).into();
        assert!(!err.is_cancellation());
    }
}
