//! Error handling for export operations.
//!
//! This module provides:
//! - Typed error kinds for the search backend, chunk files, sessions and
//!   the chunk lifecycle
//! - Consistent JSON error formatting for HTTP handlers and the push channel
//!
//! # Example
//!
//! ```rust,no_run
//! use chunked_export::error::{BackendError, ErrorResponse, ExportError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(BackendError::Unavailable("connection refused".into()).into())
//! }
//!
//! fn handle_error(err: &ExportError) {
//!     let response = ErrorResponse::from_error(err);
//!     println!("{}", response.to_json_pretty().unwrap_or_default());
//! }
//! ```

pub mod kinds;
pub mod response;

// Re-export commonly used types
pub use kinds::{
    BackendError, ConfigError, ExecutionError, ExportError, ParseError, Result, SessionError,
    TransitionError, WriteError,
};
pub use response::{ErrorInfo, ErrorResponse};
