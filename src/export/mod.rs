//! Chunked export of search results
//!
//! A large search result is split into fixed-size row windows ("chunks"),
//! each written to its own CSV file by a dedicated worker while clients
//! follow progress live and download files as they become ready.
//!
//! # Architecture
//!
//! 1. **planner**: splits a counted result set into chunk descriptors
//! 2. **worker**: streams one chunk window from a scroll cursor into a file
//! 3. **progress**: rate-limited fan-out of progress events to subscribers
//! 4. **coordinator**: owns sessions, spawns workers behind a bounded pool and
//!    drives pause, resume, cancel, the download handshake and cleanup
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunked_export::backend::OpenSearchClient;
//! use chunked_export::config::Config;
//! use chunked_export::export::{ExportCoordinator, ExportSettings, StartRequest};
//! use chunked_export::query::{Menu, SearchParams};
//!
//! # async fn run() -> chunked_export::Result<()> {
//! let config = Config::load(None)?;
//! let backend = Arc::new(OpenSearchClient::new(&config.backend)?);
//! let coordinator = ExportCoordinator::new(backend, ExportSettings::from_config(&config));
//!
//! let params = SearchParams::new(Menu::Traffic, "2024-01-01T00:00:00", "2024-01-02T00:00:00");
//! let session = coordinator.start_export(StartRequest::new("alice", params)).await?;
//! println!("{} chunks", session.chunks.len());
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod descriptor;
pub mod planner;
pub mod progress;
pub mod session;
pub mod stream;
pub mod table;
pub mod worker;
pub mod writer;

pub use coordinator::{ExportCoordinator, ExportSettings, StartRequest};
pub use descriptor::{ChunkDescriptor, ChunkFailure, ChunkStatus};
pub use progress::{ProgressBus, ProgressEvent, ProgressKey, ProgressScope, ProgressUpdate, Subscription};
pub use session::{DownloadId, ExportSession, OverallProgress, SessionStatus};
