//! In-memory [`SearchBackend`] for tests
//!
//! Serves a fixed list of rows and can be told to fail counts, expire the
//! cursor of a given window, report a wrong count or slow every call down.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Batch, BackendResult, CursorId, Row, SearchBackend, SearchQuery};
use crate::error::BackendError;

struct OpenCursor {
    position: usize,
    batch_size: usize,
    expire: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    rows: Vec<Row>,
    count_override: Option<u64>,
    fail_count: bool,
    expire_offsets: HashSet<u64>,
    delay: Duration,
    cursors: Mutex<HashMap<String, OpenCursor>>,
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Row `i` of the generated data set.
pub fn sample_row(i: usize) -> Row {
    let value = json!({
        "@timestamp": format!("2024-01-01T00:00:{:02}Z", i % 60),
        "srcIp": format!("10.0.{}.{}", i / 256, i % 256),
        "seq": i,
        "message": "raw log line",
    });
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

impl MemoryBackend {
    pub fn with_rows(count: usize) -> Self {
        Self {
            rows: (0..count).map(sample_row).collect(),
            ..Default::default()
        }
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// Report `count` instead of the real number of rows.
    pub fn count_override(mut self, count: u64) -> Self {
        self.count_override = Some(count);
        self
    }

    pub fn failing_count(mut self) -> Self {
        self.fail_count = true;
        self
    }

    /// Cursors opened at `offset` expire on their first advance.
    pub fn expire_cursor_at(mut self, offset: u64) -> Self {
        self.expire_offsets.insert(offset);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    pub fn opened_cursors(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn slice(&self, position: usize, batch_size: usize) -> Batch {
        let end = (position + batch_size).min(self.rows.len());
        let rows = self.rows.get(position..end).map(<[Row]>::to_vec).unwrap_or_default();
        Batch {
            exhausted: end >= self.rows.len(),
            rows,
        }
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn count(&self, _query: &SearchQuery) -> BackendResult<u64> {
        self.pause().await;
        if self.fail_count {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        Ok(self.count_override.unwrap_or(self.rows.len() as u64))
    }

    async fn open_cursor(
        &self,
        query: &SearchQuery,
        batch_size: usize,
        _ttl: Duration,
    ) -> BackendResult<(CursorId, Batch)> {
        self.pause().await;
        let id = format!("cursor-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let position = query.offset as usize;
        let batch = self.slice(position, batch_size);

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().unwrap().insert(
            id.clone(),
            OpenCursor {
                position: position + batch.len(),
                batch_size,
                expire: self.expire_offsets.contains(&query.offset),
            },
        );
        Ok((CursorId(id), batch))
    }

    async fn advance_cursor(&self, cursor: &CursorId, _ttl: Duration) -> BackendResult<Batch> {
        self.pause().await;
        let mut cursors = self.cursors.lock().unwrap();
        let open = cursors
            .get_mut(cursor.as_str())
            .ok_or_else(|| BackendError::CursorExpired(cursor.to_string()))?;
        if open.expire {
            return Err(BackendError::CursorExpired(cursor.to_string()));
        }
        let batch = self.slice(open.position, open.batch_size);
        open.position += batch.len();
        Ok(batch)
    }

    async fn close_cursor(&self, cursor: &CursorId) {
        if self.cursors.lock().unwrap().remove(cursor.as_str()).is_some() {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
