//! Export sessions and their aggregate progress

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::descriptor::{ChunkDescriptor, ChunkStatus};
use crate::query::SearchParams;

const ID_PREFIX: &str = "download-";

/// Identifier of an export session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(String);

impl DownloadId {
    pub fn generate() -> Self {
        Self(format!("{ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Normalize a client supplied id to the `download-` form.
    pub fn from_client(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with(ID_PREFIX) {
            Self(raw.to_string())
        } else {
            Self(format!("{ID_PREFIX}{raw}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of an export session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Preparing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Preparing => "preparing",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate progress over all chunks of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallProgress {
    pub status: SessionStatus,
    /// Row-weighted progress, 0 to 100.
    pub progress: f64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub total_chunks: usize,
    pub ready_chunks: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    /// Sum of the speeds of generating chunks, rows per second.
    pub processing_speed: f64,
    /// Longest remaining estimate among generating chunks, seconds.
    pub estimated_time_remaining: Option<f64>,
}

/// An export of one search result into chunk files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSession {
    pub id: DownloadId,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Authoritative count from the backend.
    pub total_rows: u64,
    /// The client's estimate, if it sent one.
    pub expected_rows: Option<u64>,
    pub search_params: SearchParams,
    pub chunks: Vec<ChunkDescriptor>,
}

impl ExportSession {
    pub fn chunk(&self, index: usize) -> Option<&ChunkDescriptor> {
        self.chunks.get(index)
    }

    pub fn chunk_by_file(&self, name: &str) -> Option<&ChunkDescriptor> {
        self.chunks.iter().find(|c| c.matches_file(name))
    }

    /// Some chunk is still producing rows or being sent to a client.
    pub fn has_work_in_flight(&self) -> bool {
        self.chunks.iter().any(|c| {
            matches!(
                c.status,
                ChunkStatus::Pending | ChunkStatus::Generating | ChunkStatus::Downloading
            )
        })
    }

    /// Every chunk was downloaded or failed, and at least one was downloaded.
    pub fn fully_delivered(&self) -> bool {
        !self.chunks.is_empty()
            && self.chunks.iter().all(|c| c.status.is_terminal())
            && self.chunks.iter().any(|c| c.status == ChunkStatus::Completed)
    }

    /// Move to Completed or Failed once every chunk finished generating.
    ///
    /// Returns the new status when it changed.
    pub fn settle_status(&mut self) -> Option<SessionStatus> {
        if self.status.is_terminal() || !self.chunks.iter().all(|c| c.status.is_settled()) {
            return None;
        }
        self.status = if self.chunks.iter().any(|c| c.status.has_file()) {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        Some(self.status)
    }

    pub fn overall(&self) -> OverallProgress {
        let total_rows: u64 = self.chunks.iter().map(|c| c.total_rows).sum();
        let processed_rows: u64 = self.chunks.iter().map(|c| c.processed_rows).sum();
        let count = |f: fn(ChunkStatus) -> bool| self.chunks.iter().filter(|c| f(c.status)).count();
        let generating = self
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Generating);

        let progress = if total_rows > 0 {
            (processed_rows as f64 / total_rows as f64 * 100.0).min(100.0)
        } else if !self.chunks.is_empty() && self.chunks.iter().all(|c| c.status.has_file()) {
            100.0
        } else {
            0.0
        };

        OverallProgress {
            status: self.status,
            progress,
            processed_rows,
            total_rows,
            total_chunks: self.chunks.len(),
            ready_chunks: count(ChunkStatus::has_file),
            completed_chunks: count(|s| s == ChunkStatus::Completed),
            failed_chunks: count(|s| s == ChunkStatus::Failed),
            processing_speed: generating.clone().map(|c| c.processing_speed).sum(),
            estimated_time_remaining: generating
                .filter_map(|c| c.estimated_time_remaining)
                .reduce(f64::max),
        }
    }
}
