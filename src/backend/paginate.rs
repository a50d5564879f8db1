//! Page-oriented search over a scroll cursor.
//!
//! Interactive searches can run long against large indices, so every
//! backend call is preceded by a check of the caller's search session.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::{Row, SearchBackend, SearchQuery};
use crate::error::{ExecutionError, Result};
use crate::session::SearchGuard;

/// One page of search hits plus the total match count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub hits: Vec<Row>,
    pub total: u64,
    pub page: u64,
    pub page_size: usize,
}

/// Fetch page `page` (1-based) of `query`, aborting once `guard` is cancelled.
///
/// The cursor is closed on every path.
pub async fn scroll_page(
    backend: &dyn SearchBackend,
    query: &SearchQuery,
    page: u64,
    page_size: usize,
    ttl: Duration,
    guard: &SearchGuard,
) -> Result<SearchPage> {
    if page == 0 || page_size == 0 {
        return Err(ExecutionError::InvalidParameters(
            "page and page size must be positive".into(),
        )
        .into());
    }

    guard.check().await?;
    let total = backend.count(query).await?;

    guard.check().await?;
    let offset = (page - 1) * page_size as u64;
    let window = query.window(offset, page_size as u64);
    let (cursor, batch) = backend.open_cursor(&window, page_size, ttl).await?;
    backend.close_cursor(&cursor).await;

    guard.check().await?;
    let mut hits = batch.rows;
    hits.truncate(page_size);
    debug!(
        search_id = guard.search_id(),
        page,
        hits = hits.len(),
        total,
        "search page fetched"
    );

    Ok(SearchPage {
        hits,
        total,
        page,
        page_size,
    })
}
