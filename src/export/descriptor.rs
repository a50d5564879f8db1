//! Chunk descriptors and the chunk lifecycle
//!
//! ```text
//! Pending -> Generating -> Ready -> Downloading -> Completed
//!    |           |           |  <------ |
//!    +-----------+-----------+----------+-------> Failed
//! ```
//!
//! An interrupted transfer hands a Downloading chunk back to Ready.
//!
//! Every status change goes through [`ChunkDescriptor::transition`], the
//! only place the lifecycle is enforced.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Lifecycle status of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Generating,
    Ready,
    Downloading,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Generating => "generating",
            ChunkStatus::Ready => "ready",
            ChunkStatus::Downloading => "downloading",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (Generating, Ready)
                | (Ready, Downloading)
                | (Downloading, Completed)
                | (Downloading, Ready)
                | (Pending | Generating | Ready | Downloading, Failed)
        )
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }

    /// Generation is over, successfully or not.
    pub fn is_settled(self) -> bool {
        !matches!(self, ChunkStatus::Pending | ChunkStatus::Generating)
    }

    /// A file was produced.
    pub fn has_file(self) -> bool {
        matches!(
            self,
            ChunkStatus::Ready | ChunkStatus::Downloading | ChunkStatus::Completed
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a chunk failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum ChunkFailure {
    Cancelled,
    Error(String),
}

impl ChunkFailure {
    pub fn message(&self) -> &str {
        match self {
            ChunkFailure::Cancelled => "cancelled",
            ChunkFailure::Error(msg) => msg,
        }
    }
}

/// One bounded slice of an export and its generated file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: usize,
    /// Server-local file name, unique per export.
    pub file_name: String,
    /// Name offered to the client.
    pub client_file_name: String,
    pub start_row: u64,
    pub row_count: u64,
    pub status: ChunkStatus,
    pub paused: bool,
    pub failure: Option<ChunkFailure>,
    pub progress: f64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub processing_speed: f64,
    pub estimated_time_remaining: Option<f64>,
    pub file_size: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ChunkDescriptor {
    pub fn new(
        index: usize,
        file_name: String,
        client_file_name: String,
        start_row: u64,
        row_count: u64,
    ) -> Self {
        Self {
            index,
            file_name,
            client_file_name,
            start_row,
            row_count,
            status: ChunkStatus::Pending,
            paused: false,
            failure: None,
            progress: 0.0,
            processed_rows: 0,
            total_rows: row_count,
            processing_speed: 0.0,
            estimated_time_remaining: None,
            file_size: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether `name` refers to this chunk's file.
    pub fn matches_file(&self, name: &str) -> bool {
        self.file_name == name || self.client_file_name == name
    }

    /// Apply a status change, rejecting anything the lifecycle forbids.
    pub fn transition(
        &mut self,
        next: ChunkStatus,
        failure: Option<ChunkFailure>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::new(self.status, next));
        }

        let now = Utc::now();
        match next {
            ChunkStatus::Generating => self.started_at = Some(now),
            ChunkStatus::Ready => {
                // Fewer rows than planned: the file holds what was streamed.
                self.total_rows = self.processed_rows;
                self.progress = 100.0;
                self.estimated_time_remaining = Some(0.0);
                self.paused = false;
                self.finished_at = Some(now);
            }
            ChunkStatus::Failed => {
                self.failure = Some(failure.unwrap_or(ChunkFailure::Error("failed".into())));
                self.paused = false;
                self.processing_speed = 0.0;
                self.estimated_time_remaining = None;
                self.finished_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Record streaming progress. Rows never exceed the planned total.
    pub fn record_progress(&mut self, processed_rows: u64, speed: f64, eta: Option<f64>) {
        self.processed_rows = processed_rows.min(self.total_rows).max(self.processed_rows);
        self.processing_speed = speed;
        if eta.is_some() {
            self.estimated_time_remaining = eta;
        }
        self.progress = if self.total_rows == 0 {
            0.0
        } else {
            (self.processed_rows as f64 / self.total_rows as f64 * 100.0).min(100.0)
        };
    }
}
