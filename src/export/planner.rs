//! Chunk planning
//!
//! Splits a counted result set into fixed-size row windows. Planning is pure:
//! the same inputs always give the same descriptors.

use chrono::{DateTime, Utc};

use super::descriptor::ChunkDescriptor;
use super::session::DownloadId;
use crate::error::{ExecutionError, Result};
use crate::query::Menu;

/// Timestamp format embedded in client file names.
pub const CLIENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Server-local file name of chunk `index` (0-based).
pub fn server_file_name(download_id: &DownloadId, index: usize) -> String {
    format!("{download_id}_{}.csv", index + 1)
}

/// File name offered to the client for chunk `index` (0-based) of `total`.
pub fn client_file_name(menu: Menu, captured_at: DateTime<Utc>, index: usize, total: usize) -> String {
    format!(
        "{menu}_{}_{}of{total}.csv",
        captured_at.format(CLIENT_TIMESTAMP_FORMAT),
        index + 1
    )
}

/// Plan the chunks of an export of `total_rows` rows.
///
/// A zero-row export still gets one empty chunk so the client receives a
/// file.
pub fn plan(
    total_rows: u64,
    chunk_size: u64,
    menu: Menu,
    download_id: &DownloadId,
    captured_at: DateTime<Utc>,
) -> Result<Vec<ChunkDescriptor>> {
    if chunk_size == 0 {
        return Err(ExecutionError::InvalidParameters("chunk size must be positive".into()).into());
    }

    let num_chunks = total_rows.div_ceil(chunk_size).max(1) as usize;

    Ok((0..num_chunks)
        .map(|i| {
            let start = i as u64 * chunk_size;
            let end = (start + chunk_size).min(total_rows);
            ChunkDescriptor::new(
                i,
                server_file_name(download_id, i),
                client_file_name(menu, captured_at, i, num_chunks),
                start,
                end.saturating_sub(start),
            )
        })
        .collect())
}
