//! Progress tracking for export operations
//!
//! [`ProgressBus`] fans progress events of a session out to any number of
//! subscribers. Row ticks are rate limited per key (session or chunk);
//! status changes are always delivered. A subscriber that joins late first
//! receives the latest event of every key, so it never starts blank.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::descriptor::ChunkDescriptor;
use super::session::{DownloadId, OverallProgress};

/// What a progress event is about within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProgressScope {
    Session,
    Chunk(usize),
}

/// Rate limiting key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub download_id: DownloadId,
    pub scope: ProgressScope,
}

impl ProgressKey {
    pub fn session(download_id: &DownloadId) -> Self {
        Self {
            download_id: download_id.clone(),
            scope: ProgressScope::Session,
        }
    }

    pub fn chunk(download_id: &DownloadId, index: usize) -> Self {
        Self {
            download_id: download_id.clone(),
            scope: ProgressScope::Chunk(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A chunk advanced or changed status.
    Chunk {
        chunk: ChunkDescriptor,
        overall: OverallProgress,
    },
    /// A chunk file can be downloaded.
    FileReady {
        chunk: ChunkDescriptor,
        overall: OverallProgress,
    },
    /// The session changed status.
    Session {
        overall: OverallProgress,
        message: Option<String>,
    },
}

impl ProgressEvent {
    /// Terminal events bypass rate limiting.
    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressEvent::Chunk { chunk, .. } => chunk.status.is_settled(),
            ProgressEvent::FileReady { .. } => true,
            ProgressEvent::Session { overall, .. } => overall.status.is_terminal(),
        }
    }

    pub fn overall(&self) -> &OverallProgress {
        match self {
            ProgressEvent::Chunk { overall, .. }
            | ProgressEvent::FileReady { overall, .. }
            | ProgressEvent::Session { overall, .. } => overall,
        }
    }
}

/// Event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub download_id: DownloadId,
    pub scope: ProgressScope,
    pub event: ProgressEvent,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<u64, mpsc::UnboundedSender<ProgressUpdate>>,
    latest: BTreeMap<ProgressScope, ProgressEvent>,
    last_emit: HashMap<ProgressScope, Instant>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<DownloadId, Topic>,
    next_subscriber: u64,
}

/// Per-session publish/subscribe channel for progress events.
#[derive(Clone)]
pub struct ProgressBus {
    state: Arc<Mutex<BusState>>,
    interval: Duration,
}

impl ProgressBus {
    /// Create a bus emitting at most one non-terminal event per key per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the topic of a session. Events for unknown sessions are dropped.
    pub fn open(&self, download_id: &DownloadId) {
        self.lock().topics.entry(download_id.clone()).or_default();
    }

    /// Drop the topic, ending every subscription of the session.
    pub fn close(&self, download_id: &DownloadId) {
        if let Some(topic) = self.lock().topics.remove(download_id) {
            debug!(
                download_id = %download_id,
                subscribers = topic.subscribers.len(),
                "closed progress topic"
            );
        }
    }

    /// Publish a rate-limited event. Returns whether it was delivered.
    pub fn publish(&self, key: &ProgressKey, event: ProgressEvent) -> bool {
        self.deliver(key, event, false)
    }

    /// Publish an event regardless of rate limits.
    pub fn publish_now(&self, key: &ProgressKey, event: ProgressEvent) -> bool {
        self.deliver(key, event, true)
    }

    fn deliver(&self, key: &ProgressKey, event: ProgressEvent, force: bool) -> bool {
        let mut state = self.lock();
        let Some(topic) = state.topics.get_mut(&key.download_id) else {
            trace!(download_id = %key.download_id, "dropping event for closed topic");
            return false;
        };

        let terminal = event.is_terminal();
        if !force && !terminal {
            // Nothing follows a terminal event of the same key.
            if topic.latest.get(&key.scope).is_some_and(ProgressEvent::is_terminal) {
                return false;
            }
        }
        topic.latest.insert(key.scope, event.clone());

        let now = Instant::now();
        if !force && !terminal {
            if let Some(last) = topic.last_emit.get(&key.scope) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }
        topic.last_emit.insert(key.scope, now);

        let update = ProgressUpdate {
            download_id: key.download_id.clone(),
            scope: key.scope,
            event,
        };
        topic
            .subscribers
            .retain(|_, tx| tx.send(update.clone()).is_ok());
        true
    }

    /// Subscribe to a session. `None` when the session has no topic.
    ///
    /// The latest event of every key is queued before anything new.
    pub fn subscribe(&self, download_id: &DownloadId) -> Option<Subscription> {
        let mut state = self.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        let topic = state.topics.get_mut(download_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for (scope, event) in &topic.latest {
            let _ = tx.send(ProgressUpdate {
                download_id: download_id.clone(),
                scope: *scope,
                event: event.clone(),
            });
        }
        topic.subscribers.insert(id, tx);

        Some(Subscription {
            download_id: download_id.clone(),
            id,
            rx,
            bus: Arc::downgrade(&self.state),
            active: true,
        })
    }

    pub fn subscriber_count(&self, download_id: &DownloadId) -> usize {
        self.lock()
            .topics
            .get(download_id)
            .map_or(0, |t| t.subscribers.len())
    }

    /// Latest event of `key`, if any.
    pub fn latest(&self, key: &ProgressKey) -> Option<ProgressEvent> {
        self.lock()
            .topics
            .get(&key.download_id)
            .and_then(|t| t.latest.get(&key.scope).cloned())
    }
}

/// Receiving end of a session's progress events.
pub struct Subscription {
    download_id: DownloadId,
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    bus: Weak<Mutex<BusState>>,
    active: bool,
}

impl Subscription {
    pub fn download_id(&self) -> &DownloadId {
        &self.download_id
    }

    /// Next event; `None` once unsubscribed or the topic closed.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressUpdate> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving events. Safe to call repeatedly and after the bus
    /// dropped the topic.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(state) = self.bus.upgrade() {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(topic) = state.topics.get_mut(&self.download_id) {
                topic.subscribers.remove(&self.id);
            }
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Instantaneous speed and remaining time of a row stream.
///
/// Speed is measured between consecutive observations; when no rows moved
/// the previous estimate is carried forward.
#[derive(Debug, Clone)]
pub struct RateMeter {
    last_rows: u64,
    last_at: Instant,
    speed: f64,
    eta: Option<f64>,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            last_rows: 0,
            last_at: now,
            speed: 0.0,
            eta: None,
        }
    }

    /// Record that `rows` of `total` are done at `now`.
    /// Returns rows per second and seconds remaining.
    pub fn observe(&mut self, rows: u64, total: u64, now: Instant) -> (f64, Option<f64>) {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed > 0.0 && rows > self.last_rows {
            self.speed = (rows - self.last_rows) as f64 / elapsed;
            self.last_rows = rows;
            self.last_at = now;
        }
        if self.speed > 0.0 {
            self.eta = Some(total.saturating_sub(rows) as f64 / self.speed);
        }
        (self.speed, self.eta)
    }
}
