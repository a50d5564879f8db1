//! Chunk worker
//!
//! Drives one chunk from Pending to Ready (or Failed): waits for a pool
//! permit, streams its row window into a CSV file and reports progress.
//! Cancellation and pause are honoured at batch boundaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::descriptor::{ChunkFailure, ChunkStatus};
use super::progress::{ProgressBus, ProgressEvent, ProgressKey, RateMeter};
use super::session::DownloadId;
use super::stream::RowStream;
use super::table::{ChunkChange, SessionTable};
use super::writer::{ColumnSpec, CsvChunkWriter, remove_file_quietly};
use crate::error::{ExportError, Result, SessionError};

/// Everything a worker needs to produce one chunk file.
pub struct ChunkWorker {
    pub download_id: DownloadId,
    pub index: usize,
    pub row_count: u64,
    pub path: PathBuf,
    pub columns: ColumnSpec,
    pub stream: Box<dyn RowStream>,
    pub table: Arc<SessionTable>,
    pub bus: ProgressBus,
    pub pool: Arc<Semaphore>,
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
}

impl ChunkWorker {
    fn cancelled(&self) -> ExportError {
        SessionError::Cancelled(format!("{} chunk {}", self.download_id, self.index + 1)).into()
    }

    /// Run the chunk to a settled state. Returns the final status change.
    pub async fn run(mut self) -> Option<ChunkChange> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.pool.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return self.settle(ChunkStatus::Failed, Some(ChunkFailure::Cancelled));
        };

        // Already settled by a cancel that raced the permit.
        self.settle(ChunkStatus::Generating, None)?;
        debug!(download_id = %self.download_id, chunk = self.index + 1, rows = self.row_count, "generating chunk");

        let started = Instant::now();
        let outcome = self.generate().await;
        self.stream.close().await;

        match outcome {
            Ok(size) => {
                let _ = self.table.with_entry(&self.download_id, |e| {
                    if let Some(chunk) = e.session.chunks.get_mut(self.index) {
                        chunk.file_size = Some(size);
                    }
                });
                let change = self.settle(ChunkStatus::Ready, None);
                if let Some(change) = &change {
                    info!(
                        download_id = %self.download_id,
                        chunk = self.index + 1,
                        rows = change.chunk.processed_rows,
                        bytes = size,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "chunk ready"
                    );
                }
                change
            }
            Err(e) => {
                let failure = if e.is_cancellation() {
                    debug!(download_id = %self.download_id, chunk = self.index + 1, "chunk cancelled");
                    ChunkFailure::Cancelled
                } else {
                    warn!(download_id = %self.download_id, chunk = self.index + 1, error = %e, "chunk failed");
                    ChunkFailure::Error(e.to_string())
                };
                let change = self.settle(ChunkStatus::Failed, Some(failure));
                remove_file_quietly(&self.path).await;
                change
            }
        }
    }

    async fn generate(&mut self) -> Result<u64> {
        let mut writer = CsvChunkWriter::create(self.path.clone(), self.columns.clone()).await?;
        let mut meter = RateMeter::new(Instant::now());
        let mut processed = 0u64;

        loop {
            self.checkpoint().await?;
            let Some(rows) = self.stream.next_batch().await? else {
                break;
            };
            processed += writer.write_rows(&rows).await? as u64;

            let (speed, eta) = meter.observe(processed, self.row_count, Instant::now());
            self.tick(processed, speed, eta);
        }

        if processed < self.row_count {
            warn!(
                download_id = %self.download_id,
                chunk = self.index + 1,
                expected = self.row_count,
                written = processed,
                "backend returned fewer rows than planned"
            );
        }

        self.checkpoint().await?;
        Ok(writer.finish().await?)
    }

    /// Batch boundary: fail on cancel, wait while paused.
    async fn checkpoint(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            let paused = *self.pause.borrow_and_update();
            if !paused {
                return Ok(());
            }

            debug!(download_id = %self.download_id, chunk = self.index + 1, "chunk paused");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                changed = self.pause.changed() => {
                    if changed.is_err() {
                        return Err(self.cancelled());
                    }
                }
            }
        }
    }

    fn tick(&self, processed: u64, speed: f64, eta: Option<f64>) {
        let Some((chunk, overall)) =
            self.table
                .record_progress(&self.download_id, self.index, processed, speed, eta)
        else {
            return;
        };
        self.bus.publish(
            &ProgressKey::chunk(&self.download_id, self.index),
            ProgressEvent::Chunk { chunk, overall },
        );
    }

    /// Apply and publish a status change. Rejected changes are logged.
    fn settle(&self, next: ChunkStatus, failure: Option<ChunkFailure>) -> Option<ChunkChange> {
        match self
            .table
            .transition_chunk(&self.download_id, self.index, next, failure)
        {
            Ok(change) => {
                change.publish(&self.bus, &self.download_id);
                Some(change)
            }
            Err(e) => {
                debug!(
                    download_id = %self.download_id,
                    chunk = self.index + 1,
                    to = %next,
                    error = %e,
                    "chunk transition rejected"
                );
                None
            }
        }
    }
}
