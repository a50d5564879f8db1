//! In-memory table of live export sessions
//!
//! Every mutation of a session or one of its chunks goes through this
//! table. The lock is never held across an `.await`; readers get clones.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::descriptor::{ChunkDescriptor, ChunkFailure, ChunkStatus};
use super::progress::{ProgressBus, ProgressEvent, ProgressKey};
use super::session::{DownloadId, ExportSession, OverallProgress, SessionStatus};
use crate::error::{ExecutionError, Result, SessionError};

/// A session plus the handles controlling its workers.
pub struct SessionEntry {
    pub session: ExportSession,
    pub cancel: CancellationToken,
    pub pause: watch::Sender<bool>,
    pub workers: Vec<JoinHandle<()>>,
    /// Bumped on every activity; a delayed cleanup only fires when the
    /// generation it was armed with is still current.
    pub cleanup_generation: u64,
    pub connections: usize,
    /// Open file transfers per chunk index.
    pub transfers: HashMap<usize, usize>,
    pub last_activity: Instant,
}

impl SessionEntry {
    pub fn new(session: ExportSession) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            session,
            cancel: CancellationToken::new(),
            pause,
            workers: Vec::new(),
            cleanup_generation: 0,
            connections: 0,
            transfers: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.cleanup_generation += 1;
    }

    /// Close one transfer of chunk `index`. Returns how many stay open.
    pub fn end_transfer(&mut self, index: usize) -> usize {
        let open = self.transfers.entry(index).or_default();
        *open = open.saturating_sub(1);
        let left = *open;
        if left == 0 {
            self.transfers.remove(&index);
        }
        left
    }

    pub fn check_owner(&self, owner: &str) -> Result<()> {
        if self.session.owner == owner {
            Ok(())
        } else {
            Err(SessionError::Unauthorized(self.session.id.to_string()).into())
        }
    }
}

/// Outcome of a chunk status change.
#[derive(Debug, Clone)]
pub struct ChunkChange {
    pub chunk: ChunkDescriptor,
    pub overall: OverallProgress,
    /// New session status, when the change settled the session.
    pub settled: Option<SessionStatus>,
    /// Every chunk is Completed or Failed and at least one is Completed.
    pub fully_delivered: bool,
}

impl ChunkChange {
    /// Deliver the change to subscribers, bypassing rate limits.
    pub fn publish(&self, bus: &ProgressBus, download_id: &DownloadId) {
        let key = ProgressKey::chunk(download_id, self.chunk.index);
        let event = if self.chunk.status == ChunkStatus::Ready {
            ProgressEvent::FileReady {
                chunk: self.chunk.clone(),
                overall: self.overall.clone(),
            }
        } else {
            ProgressEvent::Chunk {
                chunk: self.chunk.clone(),
                overall: self.overall.clone(),
            }
        };
        bus.publish_now(&key, event);

        if let Some(status) = self.settled {
            let message = (status == SessionStatus::Failed).then(|| "every chunk failed".to_string());
            bus.publish_now(
                &ProgressKey::session(download_id),
                ProgressEvent::Session {
                    overall: self.overall.clone(),
                    message,
                },
            );
        }
    }
}

fn not_found(id: &DownloadId) -> SessionError {
    SessionError::NotFound(id.to_string())
}

#[derive(Default)]
pub struct SessionTable {
    entries: RwLock<HashMap<DownloadId, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DownloadId, SessionEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DownloadId, SessionEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new session. Returns false when the id is taken.
    pub fn insert(&self, entry: SessionEntry) -> bool {
        let mut entries = self.write();
        if entries.contains_key(&entry.session.id) {
            return false;
        }
        entries.insert(entry.session.id.clone(), entry);
        true
    }

    pub fn contains(&self, id: &DownloadId) -> bool {
        self.read().contains_key(id)
    }

    pub fn snapshot(&self, id: &DownloadId) -> Option<ExportSession> {
        self.read().get(id).map(|e| e.session.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `f` on the entry of `id` under the write lock.
    pub fn with_entry<R>(&self, id: &DownloadId, f: impl FnOnce(&mut SessionEntry) -> R) -> Result<R> {
        let mut entries = self.write();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(f(entry))
    }

    pub fn remove(&self, id: &DownloadId) -> Option<SessionEntry> {
        self.write().remove(id)
    }

    pub fn ids(&self) -> Vec<DownloadId> {
        self.read().keys().cloned().collect()
    }

    /// Sessions without activity since `cutoff` and no attached connection.
    pub fn idle_since(&self, cutoff: Instant) -> Vec<DownloadId> {
        self.read()
            .values()
            .filter(|e| e.connections == 0 && e.last_activity < cutoff)
            .map(|e| e.session.id.clone())
            .collect()
    }

    /// Apply a validated status change to one chunk.
    pub fn transition_chunk(
        &self,
        id: &DownloadId,
        index: usize,
        next: ChunkStatus,
        failure: Option<ChunkFailure>,
    ) -> Result<ChunkChange> {
        self.with_entry(id, |entry| -> Result<ChunkChange> {
            let session = &mut entry.session;
            let paused = session.status == SessionStatus::Paused;
            let chunk = session
                .chunks
                .get_mut(index)
                .ok_or_else(|| ExecutionError::UnknownFile(format!("{id} chunk {}", index + 1)))?;

            chunk.transition(next, failure)?;
            if next == ChunkStatus::Generating {
                chunk.paused = paused;
            }
            let chunk = chunk.clone();

            if next == ChunkStatus::Generating && session.status == SessionStatus::Preparing {
                session.status = SessionStatus::Active;
            }
            let settled = session.settle_status();

            Ok(ChunkChange {
                chunk,
                overall: session.overall(),
                settled,
                fully_delivered: session.fully_delivered(),
            })
        })?
    }

    /// Record streaming progress of a generating chunk.
    ///
    /// Returns nothing when the chunk stopped generating or the session was
    /// cancelled, so late ticks are never published.
    pub fn record_progress(
        &self,
        id: &DownloadId,
        index: usize,
        processed: u64,
        speed: f64,
        eta: Option<f64>,
    ) -> Option<(ChunkDescriptor, OverallProgress)> {
        let mut entries = self.write();
        let session = &mut entries.get_mut(id)?.session;
        if session.status == SessionStatus::Cancelled {
            return None;
        }
        let chunk = session.chunks.get_mut(index)?;
        if chunk.status != ChunkStatus::Generating {
            return None;
        }
        chunk.record_progress(processed, speed, eta);
        let chunk = chunk.clone();
        Some((chunk, session.overall()))
    }
}
