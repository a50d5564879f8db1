//! Export coordinator
//!
//! Owns the lifecycle of export sessions: counts, plans and spawns chunk
//! workers on start, relays pause/resume/cancel, moves chunks through the
//! download handshake and removes sessions once they are no longer needed.
//!
//! The coordinator is cheap to clone; clones share the same sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::descriptor::{ChunkDescriptor, ChunkFailure, ChunkStatus};
use super::planner;
use super::progress::{ProgressBus, ProgressEvent, ProgressKey, Subscription};
use super::session::{DownloadId, ExportSession, OverallProgress, SessionStatus};
use super::stream::ScrollStream;
use super::table::{SessionEntry, SessionTable};
use super::worker::ChunkWorker;
use super::writer::{ColumnSpec, remove_file_quietly};
use crate::backend::SearchBackend;
use crate::config::Config;
use crate::error::{ExecutionError, ExportError, Result, SessionError, TransitionError};
use crate::query::{QueryOptions, SearchParams, build_query};

/// Tunables of the export pipeline.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub chunk_size: u64,
    pub download_dir: PathBuf,
    pub max_concurrent_chunks: usize,
    pub batch_size: usize,
    pub scroll_ttl: Duration,
    pub progress_interval: Duration,
    pub cleanup_delay: Duration,
    pub cancel_grace: Duration,
    pub columns: ColumnSpec,
    pub query: QueryOptions,
}

impl ExportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.export.chunk_size,
            download_dir: config.export.download_dir.clone(),
            max_concurrent_chunks: config.export.max_concurrent_chunks,
            batch_size: config.backend.batch_size,
            scroll_ttl: config.scroll_ttl(),
            progress_interval: config.progress_interval(),
            cleanup_delay: config.cleanup_delay(),
            cancel_grace: config.cancel_grace(),
            columns: ColumnSpec::new(
                config.export.columns.clone(),
                config.export.excluded_columns.clone(),
            ),
            query: QueryOptions::from(&config.backend),
        }
    }
}

/// A request to export a search result.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Client-chosen id; generated when absent.
    pub download_id: Option<String>,
    pub owner: String,
    pub params: SearchParams,
    /// The client's estimate of the row count.
    pub expected_rows: Option<u64>,
    pub chunk_size: Option<u64>,
}

impl StartRequest {
    pub fn new(owner: impl Into<String>, params: SearchParams) -> Self {
        Self {
            download_id: None,
            owner: owner.into(),
            params,
            expected_rows: None,
            chunk_size: None,
        }
    }
}

/// Coordinates export sessions and their chunk workers.
#[derive(Clone)]
pub struct ExportCoordinator {
    backend: Arc<dyn SearchBackend>,
    settings: Arc<ExportSettings>,
    table: Arc<SessionTable>,
    bus: ProgressBus,
    pool: Arc<Semaphore>,
}

impl ExportCoordinator {
    pub fn new(backend: Arc<dyn SearchBackend>, settings: ExportSettings) -> Self {
        let bus = ProgressBus::new(settings.progress_interval);
        let pool = Arc::new(Semaphore::new(settings.max_concurrent_chunks.max(1)));
        Self {
            backend,
            settings: Arc::new(settings),
            table: Arc::new(SessionTable::new()),
            bus,
            pool,
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    /// Count, plan and start generating an export.
    ///
    /// Returns as soon as the workers are spawned. Starting an id that
    /// already exists returns the existing session.
    pub async fn start_export(&self, request: StartRequest) -> Result<ExportSession> {
        request.params.validate()?;
        let chunk_size = request.chunk_size.unwrap_or(self.settings.chunk_size);
        if chunk_size == 0 {
            return Err(ExecutionError::InvalidParameters("chunk size must be positive".into()).into());
        }

        let download_id = request
            .download_id
            .as_deref()
            .map(DownloadId::from_client)
            .unwrap_or_else(DownloadId::generate);
        if let Some(existing) = self.existing(&download_id, &request.owner)? {
            return Ok(existing);
        }

        let query = build_query(&request.params, &self.settings.query)?;
        let total_rows = self.backend.count(&query).await?;
        if let Some(expected) = request.expected_rows {
            if expected != total_rows {
                debug!(download_id = %download_id, expected, actual = total_rows, "row estimate differs from count");
            }
        }

        let chunks = planner::plan(
            total_rows,
            chunk_size,
            request.params.menu,
            &download_id,
            Utc::now(),
        )?;
        tokio::fs::create_dir_all(&self.settings.download_dir).await?;

        let session = ExportSession {
            id: download_id.clone(),
            owner: request.owner,
            created_at: Utc::now(),
            status: SessionStatus::Preparing,
            total_rows,
            expected_rows: request.expected_rows,
            search_params: request.params,
            chunks,
        };

        let entry = SessionEntry::new(session.clone());
        let cancel = entry.cancel.clone();
        let pause = entry.pause.subscribe();
        self.bus.open(&download_id);
        if !self.table.insert(entry) {
            // Lost a race with a concurrent start of the same id.
            return self
                .existing(&download_id, &session.owner)?
                .ok_or_else(|| ExportError::Generic(format!("session {download_id} vanished")));
        }

        self.bus.publish_now(
            &ProgressKey::session(&download_id),
            ProgressEvent::Session {
                overall: session.overall(),
                message: None,
            },
        );

        let handles = session
            .chunks
            .iter()
            .map(|chunk| {
                let worker = ChunkWorker {
                    download_id: download_id.clone(),
                    index: chunk.index,
                    row_count: chunk.row_count,
                    path: self.settings.download_dir.join(&chunk.file_name),
                    columns: self.settings.columns.clone(),
                    stream: Box::new(ScrollStream::new(
                        self.backend.clone(),
                        &query,
                        chunk.start_row,
                        chunk.row_count,
                        self.settings.batch_size,
                        self.settings.scroll_ttl,
                    )),
                    table: self.table.clone(),
                    bus: self.bus.clone(),
                    pool: self.pool.clone(),
                    cancel: cancel.clone(),
                    pause: pause.clone(),
                };
                let coordinator = self.clone();
                tokio::spawn(async move {
                    let id = worker.download_id.clone();
                    if let Some(change) = worker.run().await {
                        if change.fully_delivered {
                            coordinator.schedule_delayed_cleanup(&id, coordinator.settings.cleanup_delay);
                        }
                    }
                })
            })
            .collect();
        self.table.with_entry(&download_id, |e| e.workers = handles)?;

        info!(
            download_id = %download_id,
            rows = total_rows,
            chunks = session.chunks.len(),
            chunk_size,
            "export started"
        );
        Ok(session)
    }

    fn existing(&self, id: &DownloadId, owner: &str) -> Result<Option<ExportSession>> {
        if !self.table.contains(id) {
            return Ok(None);
        }
        self.table
            .with_entry(id, |e| -> Result<Option<ExportSession>> {
                e.check_owner(owner)?;
                e.touch();
                Ok(Some(e.session.clone()))
            })
            .unwrap_or(Ok(None))
    }

    /// Snapshot of a session, checked against its owner.
    pub fn session(&self, id: &DownloadId, owner: &str) -> Result<ExportSession> {
        self.table.with_entry(id, |e| -> Result<ExportSession> {
            e.check_owner(owner)?;
            Ok(e.session.clone())
        })?
    }

    pub fn overall_progress(&self, id: &DownloadId) -> Result<OverallProgress> {
        self.table.with_entry(id, |e| e.session.overall())
    }

    pub fn contains(&self, id: &DownloadId) -> bool {
        self.table.contains(id)
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Subscribe to a session's progress; counts as activity.
    pub fn subscribe(&self, id: &DownloadId) -> Option<Subscription> {
        self.table.with_entry(id, SessionEntry::touch).ok()?;
        self.bus.subscribe(id)
    }

    /// Stop pulling batches until [`resume`](Self::resume).
    pub fn pause(&self, id: &DownloadId, owner: &str) -> Result<OverallProgress> {
        self.set_paused(id, owner, true)
    }

    pub fn resume(&self, id: &DownloadId, owner: &str) -> Result<OverallProgress> {
        self.set_paused(id, owner, false)
    }

    fn set_paused(&self, id: &DownloadId, owner: &str, paused: bool) -> Result<OverallProgress> {
        let target = if paused {
            SessionStatus::Paused
        } else {
            SessionStatus::Active
        };

        type Outcome = std::result::Result<OverallProgress, TransitionError>;
        let changed = self.table.with_entry(id, |e| -> Result<Outcome> {
            e.check_owner(owner)?;
            e.touch();
            let current = e.session.status;
            let allowed = match current {
                SessionStatus::Preparing | SessionStatus::Active => paused,
                SessionStatus::Paused => !paused,
                _ => false,
            };
            if !allowed {
                return Ok(Err(TransitionError::new(current, target)));
            }

            // A session that never started generating goes back to preparing.
            let generating = e
                .session
                .chunks
                .iter()
                .any(|c| c.status != ChunkStatus::Pending);
            e.session.status = if paused || generating {
                target
            } else {
                SessionStatus::Preparing
            };
            for chunk in &mut e.session.chunks {
                if chunk.status == ChunkStatus::Generating {
                    chunk.paused = paused;
                }
            }
            e.pause.send_replace(paused);
            Ok(Ok(e.session.overall()))
        })??;

        match changed {
            Ok(overall) => {
                info!(download_id = %id, status = %overall.status, "export {}", if paused { "paused" } else { "resumed" });
                self.bus.publish_now(
                    &ProgressKey::session(id),
                    ProgressEvent::Session {
                        overall: overall.clone(),
                        message: None,
                    },
                );
                Ok(overall)
            }
            Err(e) => {
                warn!(download_id = %id, error = %e, "ignoring {} request", if paused { "pause" } else { "resume" });
                self.overall_progress(id)
            }
        }
    }

    /// Cancel every worker, wait for them to settle and remove the session.
    ///
    /// Returns the session as it stood when the workers stopped.
    pub async fn cancel(&self, id: &DownloadId, owner: &str) -> Result<ExportSession> {
        let mut handles = self.table.with_entry(id, |e| -> Result<Vec<_>> {
            e.check_owner(owner)?;
            if !e.session.status.is_terminal() {
                e.session.status = SessionStatus::Cancelled;
            }
            e.cancel.cancel();
            e.pause.send_replace(false);
            Ok(std::mem::take(&mut e.workers))
        })??;
        info!(download_id = %id, workers = handles.len(), "cancelling export");

        let settle = async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.settings.cancel_grace, settle).await.is_err() {
            warn!(download_id = %id, "workers did not stop in time; aborting");
            for handle in &handles {
                handle.abort();
            }
        }

        // Chunks not settled by their worker (aborted, or Ready and never
        // downloaded) end as cancelled.
        let open: Vec<usize> = self
            .table
            .snapshot(id)
            .map(|s| {
                s.chunks
                    .iter()
                    .filter(|c| !c.status.is_terminal())
                    .map(|c| c.index)
                    .collect()
            })
            .unwrap_or_default();
        for index in open {
            if let Ok(change) =
                self.table
                    .transition_chunk(id, index, ChunkStatus::Failed, Some(ChunkFailure::Cancelled))
            {
                change.publish(&self.bus, id);
            }
        }

        let session = self.table.snapshot(id);
        if let Some(session) = &session {
            self.bus.publish_now(
                &ProgressKey::session(id),
                ProgressEvent::Session {
                    overall: session.overall(),
                    message: Some("cancelled".into()),
                },
            );
        }
        self.cleanup(id).await;
        session.ok_or_else(|| SessionError::NotFound(id.to_string()).into())
    }

    /// Remove a session and its files. Safe to call repeatedly.
    ///
    /// Returns whether a session was removed.
    pub async fn cleanup(&self, id: &DownloadId) -> bool {
        let Some(entry) = self.table.remove(id) else {
            debug!(download_id = %id, "cleanup of unknown session");
            return false;
        };

        entry.cancel.cancel();
        for handle in &entry.workers {
            handle.abort();
        }
        for chunk in &entry.session.chunks {
            remove_file_quietly(&self.settings.download_dir.join(&chunk.file_name)).await;
        }
        self.bus.close(id);
        info!(download_id = %id, chunks = entry.session.chunks.len(), "export cleaned up");
        true
    }

    /// Remove the session after `delay` unless it sees activity first.
    pub fn schedule_delayed_cleanup(&self, id: &DownloadId, delay: Duration) {
        let Ok(generation) = self.table.with_entry(id, |e| {
            e.cleanup_generation += 1;
            e.cleanup_generation
        }) else {
            return;
        };
        debug!(download_id = %id, delay_secs = delay.as_secs(), "scheduled cleanup");

        let coordinator = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = coordinator.table.with_entry(&id, |e| e.cleanup_generation);
            if current.ok() == Some(generation) {
                coordinator.cleanup(&id).await;
            } else {
                debug!(download_id = %id, "delayed cleanup superseded");
            }
        });
    }

    /// Mark a chunk file as being downloaded and return its path.
    ///
    /// `file` is the server or client file name. Downloading an already
    /// completed file again is allowed.
    pub fn begin_download(
        &self,
        id: &DownloadId,
        file: &str,
        owner: &str,
    ) -> Result<(PathBuf, ChunkDescriptor)> {
        let chunk = self.table.with_entry(id, |e| -> Result<ChunkDescriptor> {
            e.check_owner(owner)?;
            e.touch();
            let chunk = e
                .session
                .chunk_by_file(file)
                .ok_or_else(|| ExecutionError::UnknownFile(file.to_string()))?;
            if !chunk.status.has_file() {
                return Err(ExecutionError::FileNotReady {
                    file: file.to_string(),
                    status: chunk.status.to_string(),
                }
                .into());
            }
            let chunk = chunk.clone();
            *e.transfers.entry(chunk.index).or_default() += 1;
            Ok(chunk)
        })??;

        let chunk = if chunk.status == ChunkStatus::Ready {
            let change = self
                .table
                .transition_chunk(id, chunk.index, ChunkStatus::Downloading, None)?;
            change.publish(&self.bus, id);
            change.chunk
        } else {
            chunk
        };

        debug!(download_id = %id, file = %chunk.file_name, "download started");
        Ok((self.settings.download_dir.join(&chunk.file_name), chunk))
    }

    /// Acknowledge that a chunk file reached the client.
    pub fn finish_download(&self, id: &DownloadId, file: &str, owner: &str) -> Result<ChunkDescriptor> {
        let chunk = self.table.with_entry(id, |e| -> Result<ChunkDescriptor> {
            e.check_owner(owner)?;
            let chunk = e
                .session
                .chunk_by_file(file)
                .cloned()
                .ok_or_else(|| ExecutionError::UnknownFile(file.to_string()))?;
            e.end_transfer(chunk.index);
            Ok(chunk)
        })??;
        if chunk.status == ChunkStatus::Completed {
            return Ok(chunk);
        }

        let change = self
            .table
            .transition_chunk(id, chunk.index, ChunkStatus::Completed, None)?;
        change.publish(&self.bus, id);
        info!(download_id = %id, file = %change.chunk.client_file_name, "download completed");

        if change.fully_delivered {
            self.schedule_delayed_cleanup(id, self.settings.cleanup_delay);
        }
        Ok(change.chunk)
    }

    /// Give up on a transfer that ended before the file was delivered.
    ///
    /// The last open transfer of a Downloading chunk hands it back to Ready
    /// so it can be fetched again.
    pub fn abort_download(&self, id: &DownloadId, file: &str, owner: &str) -> Result<ChunkDescriptor> {
        let (chunk, open) = self.table.with_entry(id, |e| -> Result<(ChunkDescriptor, usize)> {
            e.check_owner(owner)?;
            let chunk = e
                .session
                .chunk_by_file(file)
                .cloned()
                .ok_or_else(|| ExecutionError::UnknownFile(file.to_string()))?;
            let open = e.end_transfer(chunk.index);
            Ok((chunk, open))
        })??;
        if open > 0 || chunk.status != ChunkStatus::Downloading {
            return Ok(chunk);
        }

        let change = self
            .table
            .transition_chunk(id, chunk.index, ChunkStatus::Ready, None)?;
        change.publish(&self.bus, id);
        info!(download_id = %id, file = %change.chunk.client_file_name, "download interrupted");
        Ok(change.chunk)
    }

    /// Register a live connection watching the session.
    pub fn attach(&self, id: &DownloadId) -> bool {
        self.table
            .with_entry(id, |e| {
                e.connections += 1;
                e.touch();
            })
            .is_ok()
    }

    /// Drop a connection. Returns the remaining connections and whether
    /// the session still has work in flight.
    pub fn detach(&self, id: &DownloadId) -> Option<(usize, bool)> {
        self.table
            .with_entry(id, |e| {
                e.connections = e.connections.saturating_sub(1);
                e.last_activity = Instant::now();
                (e.connections, e.session.has_work_in_flight())
            })
            .ok()
    }

    /// Attached connections and whether work is in flight.
    pub fn connection_state(&self, id: &DownloadId) -> Option<(usize, bool)> {
        self.table
            .with_entry(id, |e| (e.connections, e.session.has_work_in_flight()))
            .ok()
    }

    /// Remove sessions idle for longer than `max_idle`.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(max_idle) else {
            return 0;
        };
        let mut removed = 0;
        for id in self.table.idle_since(cutoff) {
            if self.cleanup(&id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept idle export sessions");
        }
        removed
    }

    /// Cancel and remove every session.
    pub async fn shutdown(&self) {
        for id in self.table.ids() {
            if let Some(entry) = self.table.snapshot(&id) {
                let _ = self.cancel(&id, &entry.owner).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::BackendError;
    use crate::query::Menu;
    use tokio_test::{assert_err, assert_ok};

    fn settings(dir: &std::path::Path, chunk_size: u64) -> ExportSettings {
        ExportSettings {
            chunk_size,
            download_dir: dir.to_path_buf(),
            max_concurrent_chunks: 2,
            batch_size: 10,
            scroll_ttl: Duration::from_secs(60),
            progress_interval: Duration::from_millis(50),
            cleanup_delay: Duration::from_millis(50),
            cancel_grace: Duration::from_secs(2),
            columns: ColumnSpec::new(None, vec!["message".into()]),
            query: QueryOptions::default(),
        }
    }

    fn request(id: &str) -> StartRequest {
        StartRequest {
            download_id: Some(id.into()),
            ..StartRequest::new(
                "alice",
                SearchParams::new(Menu::Traffic, "2024-01-01T00:00:00", "2024-01-02T00:00:00"),
            )
        }
    }

    async fn wait_settled(coordinator: &ExportCoordinator, id: &DownloadId) -> ExportSession {
        for _ in 0..400 {
            let session = coordinator.session(id, "alice").unwrap();
            if session.chunks.iter().all(|c| c.status.is_settled()) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never settled");
    }

    #[tokio::test]
    async fn test_export_generates_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(120));
        let coordinator = ExportCoordinator::new(backend.clone(), settings(dir.path(), 50));

        let session = coordinator.start_export(request("full")).await.unwrap();
        assert_eq!(session.id.as_str(), "download-full");
        assert_eq!(session.total_rows, 120);
        let sizes: Vec<u64> = session.chunks.iter().map(|c| c.row_count).collect();
        assert_eq!(sizes, vec![50, 50, 20]);

        let done = wait_settled(&coordinator, &session.id).await;
        assert_eq!(done.status, SessionStatus::Completed);
        for chunk in &done.chunks {
            assert_eq!(chunk.status, ChunkStatus::Ready);
            let content = std::fs::read_to_string(dir.path().join(&chunk.file_name)).unwrap();
            assert_eq!(content.lines().count() as u64, chunk.row_count + 1);
        }
        assert_eq!(backend.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(30));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let first = coordinator.start_export(request("same")).await.unwrap();
        let second = coordinator.start_export(request("download-same")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(coordinator.session_count(), 1);

        let mut other = request("same");
        other.owner = "mallory".into();
        let err = coordinator.start_export(other).await.unwrap_err();
        assert!(matches!(err, ExportError::Session(SessionError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_count_failure_creates_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(10).failing_count());
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let err = coordinator.start_export(request("down")).await.unwrap_err();
        assert!(matches!(err, ExportError::Backend(BackendError::Unavailable(_))));
        assert_eq!(coordinator.session_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_rows_completes_with_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(0));
        let coordinator = ExportCoordinator::new(backend.clone(), settings(dir.path(), 10));

        let session = coordinator.start_export(request("empty")).await.unwrap();
        assert_eq!(session.chunks.len(), 1);
        let done = wait_settled(&coordinator, &session.id).await;
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.chunks[0].status, ChunkStatus::Ready);
        assert_eq!(backend.opened_cursors(), 0);
    }

    #[tokio::test]
    async fn test_partial_success_when_one_cursor_expires() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(90).expire_cursor_at(30));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 30));

        let session = coordinator.start_export(request("partial")).await.unwrap();
        let done = wait_settled(&coordinator, &session.id).await;

        let statuses: Vec<ChunkStatus> = done.chunks.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![ChunkStatus::Ready, ChunkStatus::Failed, ChunkStatus::Ready]
        );
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(!dir.path().join(&done.chunks[1].file_name).exists());
        assert!(dir.path().join(&done.chunks[2].file_name).exists());
    }

    #[tokio::test]
    async fn test_cancel_converges_and_stops_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(400).with_delay(Duration::from_millis(20)));
        let coordinator = ExportCoordinator::new(backend.clone(), settings(dir.path(), 100));

        let session = coordinator.start_export(request("cancel")).await.unwrap();
        let mut sub = coordinator.subscribe(&session.id).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let cancelled = coordinator.cancel(&session.id, "alice").await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        for chunk in &cancelled.chunks {
            assert_eq!(chunk.status, ChunkStatus::Failed);
            assert_eq!(chunk.failure, Some(ChunkFailure::Cancelled));
        }
        assert!(!coordinator.contains(&session.id));
        assert_eq!(backend.open_cursors(), 0);

        // Drain what was sent before the topic closed; nothing follows.
        while sub.recv().await.is_some() {}
        assert!(sub.try_recv().is_none());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cancel_checks_owner() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(10));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));
        let session = coordinator.start_export(request("owned")).await.unwrap();

        assert_err!(coordinator.cancel(&session.id, "mallory").await);
        assert!(coordinator.contains(&session.id));
        assert_err!(
            coordinator
                .cancel(&DownloadId::from_client("nope"), "alice")
                .await
        );
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(20));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let session = coordinator.start_export(request("twice")).await.unwrap();
        wait_settled(&coordinator, &session.id).await;

        assert!(coordinator.cleanup(&session.id).await);
        assert!(!coordinator.cleanup(&session.id).await);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(200).with_delay(Duration::from_millis(10)));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 100));

        let session = coordinator.start_export(request("pause")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let overall = assert_ok!(coordinator.pause(&session.id, "alice"));
        assert_eq!(overall.status, SessionStatus::Paused);

        // Pausing twice is reported as a no-op.
        let again = coordinator.pause(&session.id, "alice").unwrap();
        assert_eq!(again.status, SessionStatus::Paused);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let frozen = coordinator.overall_progress(&session.id).unwrap().processed_rows;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            coordinator.overall_progress(&session.id).unwrap().processed_rows,
            frozen
        );

        let resumed = coordinator.resume(&session.id, "alice").unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        let done = wait_settled(&coordinator, &session.id).await;
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.overall().processed_rows, 200);
    }

    #[tokio::test]
    async fn test_download_handshake_arms_delayed_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(15));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let session = coordinator.start_export(request("dl")).await.unwrap();
        let done = wait_settled(&coordinator, &session.id).await;

        let pending = coordinator.begin_download(&session.id, "nope.csv", "alice");
        assert!(matches!(
            pending,
            Err(ExportError::Execution(ExecutionError::UnknownFile(_)))
        ));

        assert_eq!(done.chunks.len(), 2);
        let (path, descriptor) = coordinator
            .begin_download(&session.id, &done.chunks[0].client_file_name, "alice")
            .unwrap();
        assert!(path.exists());
        assert_eq!(descriptor.status, ChunkStatus::Downloading);
        coordinator
            .finish_download(&session.id, &done.chunks[0].file_name, "alice")
            .unwrap();

        // Re-downloading a completed file is allowed.
        let (_, again) = coordinator
            .begin_download(&session.id, &done.chunks[0].file_name, "alice")
            .unwrap();
        assert_eq!(again.status, ChunkStatus::Completed);

        coordinator
            .begin_download(&session.id, &done.chunks[1].file_name, "alice")
            .unwrap();
        coordinator
            .finish_download(&session.id, &done.chunks[1].file_name, "alice")
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!coordinator.contains(&session.id));
    }

    #[tokio::test]
    async fn test_aborted_transfer_returns_chunk_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(5));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let session = coordinator.start_export(request("abort")).await.unwrap();
        let done = wait_settled(&coordinator, &session.id).await;
        let file = &done.chunks[0].file_name;

        // Two concurrent transfers: the first abort leaves the other running.
        coordinator.begin_download(&session.id, file, "alice").unwrap();
        coordinator.begin_download(&session.id, file, "alice").unwrap();
        let chunk = coordinator.abort_download(&session.id, file, "alice").unwrap();
        assert_eq!(chunk.status, ChunkStatus::Downloading);

        let chunk = coordinator.abort_download(&session.id, file, "alice").unwrap();
        assert_eq!(chunk.status, ChunkStatus::Ready);
        assert_err!(coordinator.finish_download(&session.id, file, "alice"));

        // The file can be fetched again and completes normally.
        coordinator.begin_download(&session.id, file, "alice").unwrap();
        let chunk = assert_ok!(coordinator.finish_download(&session.id, file, "alice"));
        assert_eq!(chunk.status, ChunkStatus::Completed);

        // Aborting a completed file changes nothing.
        let chunk = coordinator.abort_download(&session.id, file, "alice").unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);
    }

    #[tokio::test]
    async fn test_activity_invalidates_delayed_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(5));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let session = coordinator.start_export(request("keep")).await.unwrap();
        wait_settled(&coordinator, &session.id).await;

        coordinator.schedule_delayed_cleanup(&session.id, Duration::from_millis(40));
        let _sub = coordinator.subscribe(&session.id).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.contains(&session.id));
    }

    #[tokio::test]
    async fn test_sweep_idle_skips_attached_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::with_rows(5));
        let coordinator = ExportCoordinator::new(backend, settings(dir.path(), 10));

        let a = coordinator.start_export(request("idle-a")).await.unwrap();
        let b = coordinator.start_export(request("idle-b")).await.unwrap();
        wait_settled(&coordinator, &a.id).await;
        wait_settled(&coordinator, &b.id).await;
        assert!(coordinator.attach(&b.id));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.sweep_idle(Duration::from_millis(10)).await, 1);
        assert!(!coordinator.contains(&a.id));
        assert!(coordinator.contains(&b.id));

        assert_eq!(coordinator.detach(&b.id), Some((0, false)));
    }
}
