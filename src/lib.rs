//! Chunked Export Library
//!
//! Exports large search results as a set of bounded CSV files generated in
//! parallel, with live progress for connected clients and per-file
//! downloads. It can be embedded as a library or run through the
//! `chunked-export` binary.
//!
//! # Modules
//!
//! - `backend`: search backend gateway (count and scroll cursors)
//! - `cli`: command-line interface and argument parsing
//! - `config`: configuration management
//! - `error`: error types and handling
//! - `export`: chunk planning, workers, progress and the export coordinator
//! - `query`: search parameters, query building and the filter parser
//! - `server`: HTTP and WebSocket front end
//! - `session`: search session registry with cooperative cancellation
//! - `transport`: progress channel protocol for one client connection
//!
//! # Example
//!
//! ```no_run
//! use chunked_export::{config::Config, server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     server::serve(config).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod query;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use backend::{OpenSearchClient, SearchBackend};
pub use config::Config;
pub use error::{ExportError, Result};
pub use export::{ExportCoordinator, ExportSettings, StartRequest};
pub use session::SessionRegistry;
pub use transport::TransportAdapter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
