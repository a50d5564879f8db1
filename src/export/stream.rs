//! Row streams feeding chunk workers
//!
//! A [`RowStream`] hands out the rows of one chunk window batch by batch
//! without holding more than one batch in memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{CursorId, Row, SearchBackend, SearchQuery};
use crate::error::{BackendError, Result};

/// Batched access to the rows of one chunk.
#[async_trait]
pub trait RowStream: Send {
    /// Next batch of rows, or `None` once the window is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<Row>>>;

    /// Release backend resources. Never fails.
    async fn close(&mut self);
}

enum CursorState {
    Unopened,
    Open(CursorId),
    Done,
}

/// Scroll-cursor stream over `[offset, offset + limit)` of a query.
///
/// The cursor is opened lazily by the first `next_batch` and each later
/// call renews its TTL. Batches are cut so that no row past the window is
/// ever returned.
pub struct ScrollStream {
    backend: Arc<dyn SearchBackend>,
    window: SearchQuery,
    batch_size: usize,
    ttl: Duration,
    state: CursorState,
    remaining: u64,
    fetched: u64,
    exhausted: bool,
}

impl ScrollStream {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        query: &SearchQuery,
        offset: u64,
        limit: u64,
        batch_size: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            window: query.window(offset, limit),
            batch_size,
            ttl,
            state: CursorState::Unopened,
            remaining: limit,
            fetched: 0,
            exhausted: false,
        }
    }

    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    async fn pull(&mut self) -> Result<Vec<Row>> {
        let batch = match &self.state {
            CursorState::Unopened => {
                // Positioning skips in pages of this size, so it must not
                // shrink with the window; `next_batch` trims the tail.
                let size = self.batch_size.max(1);
                let (cursor, batch) = self.backend.open_cursor(&self.window, size, self.ttl).await?;
                debug!(cursor = %cursor, offset = self.window.offset, "opened scroll cursor");
                self.state = CursorState::Open(cursor);
                batch
            }
            CursorState::Open(cursor) => match self.backend.advance_cursor(cursor, self.ttl).await {
                Ok(batch) => batch,
                Err(e @ BackendError::CursorExpired(_)) => {
                    // The backend already dropped it; nothing left to close.
                    self.state = CursorState::Done;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            },
            CursorState::Done => return Ok(Vec::new()),
        };

        self.exhausted = batch.exhausted;
        Ok(batch.rows)
    }
}

#[async_trait]
impl RowStream for ScrollStream {
    async fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        if self.remaining == 0 || self.exhausted || matches!(self.state, CursorState::Done) {
            self.close().await;
            return Ok(None);
        }

        let mut rows = self.pull().await?;
        rows.truncate(self.remaining as usize);
        if rows.is_empty() {
            debug!(fetched = self.fetched, "scroll stream exhausted");
            self.close().await;
            return Ok(None);
        }

        self.remaining -= rows.len() as u64;
        self.fetched += rows.len() as u64;
        Ok(Some(rows))
    }

    async fn close(&mut self) {
        if let CursorState::Open(cursor) = std::mem::replace(&mut self.state, CursorState::Done) {
            self.backend.close_cursor(&cursor).await;
            info!(cursor = %cursor, rows = self.fetched, "closed scroll cursor");
        }
    }
}

impl Drop for ScrollStream {
    fn drop(&mut self) {
        if let CursorState::Open(cursor) = &self.state {
            debug!(cursor = %cursor, "scroll stream dropped without close; cursor left to expire");
        }
    }
}
