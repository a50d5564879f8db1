//! Search backend gateway
//!
//! Thin wrapper over a search engine's count and scroll-cursor APIs. The
//! gateway keeps no state beyond its connection settings: cursor ids are
//! handed to the caller, who owns them until `close_cursor`.
//!
//! - `opensearch`: HTTP client for OpenSearch / Elasticsearch compatible clusters
//! - `paginate`: page-oriented search over a scroll cursor, guarded by a search session

pub mod opensearch;
pub mod paginate;

#[cfg(test)]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::BackendError;

pub use opensearch::OpenSearchClient;
pub use paginate::{SearchPage, scroll_page};

/// A single search hit, as the `_source` object of the document.
pub type Row = Map<String, Value>;

/// Result type of gateway calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend-issued scroll cursor token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorId(pub String);

impl CursorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CursorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Scroll ids are long base64 blobs; keep log lines readable.
        let short: String = self.0.chars().take(16).collect();
        if short.len() < self.0.len() {
            write!(f, "{short}…")
        } else {
            write!(f, "{short}")
        }
    }
}

/// One page of rows pulled from a cursor.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Row>,
    /// The backend has no rows past this batch.
    pub exhausted: bool,
}

impl Batch {
    pub fn exhausted() -> Self {
        Self {
            rows: Vec::new(),
            exhausted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Opaque search request handed to the gateway.
///
/// `offset` positions a cursor inside the ordered result set; `limit`
/// caps how many rows the caller intends to read from that position.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: Value,
    pub sort: Value,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: Value) -> Self {
        Self {
            query,
            sort: json!([{ "@timestamp": { "order": "desc" } }]),
            offset: 0,
            limit: None,
        }
    }

    /// Copy of this query restricted to `[offset, offset + limit)`.
    pub fn window(&self, offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
            ..self.clone()
        }
    }

    /// Body of a `_search` request returning `size` hits per page.
    pub fn search_body(&self, size: usize) -> Value {
        json!({
            "query": self.query,
            "sort": self.sort,
            "size": size,
        })
    }

    /// Body of a `_count` request.
    pub fn count_body(&self) -> Value {
        json!({ "query": self.query })
    }
}

/// Gateway to a search backend supporting counts and scroll cursors.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Number of rows matching the query.
    async fn count(&self, query: &SearchQuery) -> BackendResult<u64>;

    /// Open a cursor positioned at `query.offset` and return its first batch.
    async fn open_cursor(
        &self,
        query: &SearchQuery,
        batch_size: usize,
        ttl: Duration,
    ) -> BackendResult<(CursorId, Batch)>;

    /// Fetch the next batch, renewing the cursor TTL.
    ///
    /// Fails with [`BackendError::CursorExpired`] once the backend has
    /// dropped the cursor; that failure is not retryable.
    async fn advance_cursor(&self, cursor: &CursorId, ttl: Duration) -> BackendResult<Batch>;

    /// Release the cursor. Failures are logged, never returned.
    async fn close_cursor(&self, cursor: &CursorId);
}
