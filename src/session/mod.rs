//! Search session registry
//!
//! Tracks long-running searches so a user has at most one active search at
//! a time and can cancel it from another request. Cancellation is
//! cooperative: the in-process [`CancellationToken`] fires immediately, and
//! searches running elsewhere notice the persisted status through
//! [`SearchGuard::check`], which polls the store at a bounded rate.

mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ExecutionError, Result, SessionError};
use crate::query::SearchParams;

pub use store::{MemorySessionStore, SessionStore};

/// Reason recorded on sessions replaced by a newer search of the same user.
pub const SUPERSEDED_REASON: &str = "superseded by a new search";

/// Persisted status of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchSessionStatus {
    Active,
    Cancelled,
    Completed,
    Error,
}

/// Persisted search session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSessionRecord {
    pub id: String,
    pub user_id: String,
    pub search_id: String,
    pub status: SearchSessionStatus,
    pub search_params: SearchParams,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub cancel_reason: Option<String>,
}

impl SearchSessionRecord {
    fn set_status(&mut self, status: SearchSessionStatus, reason: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.cancel_reason = reason;
        self.updated_at = now;
        self.last_activity_at = now;
    }
}

/// Where a search request came from.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub error: usize,
}

/// Registry of search sessions over a [`SessionStore`].
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    poll_interval: Duration,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            tokens: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory(poll_interval: Duration) -> Self {
        Self::new(Arc::new(MemorySessionStore::new()), poll_interval)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, id: &str) {
        if let Some(token) = self.tokens().remove(id) {
            token.cancel();
        }
    }

    /// Start a search session, cancelling the user's other active sessions.
    pub async fn create(
        &self,
        user_id: &str,
        search_id: &str,
        params: SearchParams,
        client: ClientInfo,
    ) -> Result<SearchGuard> {
        for mut previous in self.store.find_active_by_user(user_id).await? {
            previous.set_status(
                SearchSessionStatus::Cancelled,
                Some(SUPERSEDED_REASON.to_string()),
            );
            self.store.update(&previous).await?;
            self.fire(&previous.id);
            info!(
                user = user_id,
                search_id = %previous.search_id,
                "cancelled superseded search session"
            );
        }

        let now = Utc::now();
        let record = SearchSessionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            search_id: search_id.to_string(),
            status: SearchSessionStatus::Active,
            search_params: params,
            client_ip: client.ip,
            user_agent: client.user_agent,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
            cancel_reason: None,
        };
        self.store.insert(record.clone()).await?;

        let token = CancellationToken::new();
        self.tokens().insert(record.id.clone(), token.clone());
        debug!(user = user_id, search_id, "created search session");

        Ok(SearchGuard {
            session_id: record.id,
            search_id: record.search_id,
            store: self.store.clone(),
            token,
            poll_interval: self.poll_interval,
            last_poll: Mutex::new(Some(Instant::now())),
        })
    }

    async fn owned(&self, search_id: &str, user_id: &str) -> Result<SearchSessionRecord> {
        let record = self
            .store
            .find_by_search_id(search_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(search_id.to_string()))?;
        if record.user_id != user_id {
            return Err(SessionError::Unauthorized(search_id.to_string()).into());
        }
        Ok(record)
    }

    /// Cancel a search by its client correlation id.
    ///
    /// Cancelling a session that is no longer active returns it unchanged.
    pub async fn cancel(
        &self,
        search_id: &str,
        user_id: &str,
        reason: Option<&str>,
    ) -> Result<SearchSessionRecord> {
        let mut record = self.owned(search_id, user_id).await?;
        if record.status != SearchSessionStatus::Active {
            debug!(search_id, status = ?record.status, "search session already settled");
            return Ok(record);
        }

        record.set_status(SearchSessionStatus::Cancelled, reason.map(str::to_string));
        self.store.update(&record).await?;
        self.fire(&record.id);
        info!(search_id, user = user_id, "cancelled search session");
        Ok(record)
    }

    /// Status of a search owned by `user_id`.
    pub async fn status(&self, search_id: &str, user_id: &str) -> Result<SearchSessionRecord> {
        self.owned(search_id, user_id).await
    }

    pub async fn complete(&self, id: &str) -> Result<()> {
        self.settle(id, SearchSessionStatus::Completed, None).await
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<()> {
        self.settle(id, SearchSessionStatus::Error, Some(message.to_string()))
            .await
    }

    async fn settle(
        &self,
        id: &str,
        status: SearchSessionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        self.tokens().remove(id);
        let Some(mut record) = self.store.find(id).await? else {
            return Err(SessionError::NotFound(id.to_string()).into());
        };
        // A cancellation that raced the search wins.
        if record.status != SearchSessionStatus::Active {
            return Ok(());
        }
        record.set_status(status, reason);
        self.store.update(&record).await
    }

    /// Refresh the activity timestamp of an active session.
    pub async fn touch(&self, id: &str) -> Result<()> {
        let Some(mut record) = self.store.find(id).await? else {
            return Err(SessionError::NotFound(id.to_string()).into());
        };
        let now = Utc::now();
        record.last_activity_at = now;
        record.updated_at = now;
        self.store.update(&record).await
    }

    /// Delete settled sessions and active ones idle for `max_age_minutes`.
    pub async fn cleanup_inactive(&self, max_age_minutes: u64) -> Result<usize> {
        let cutoff = i64::try_from(max_age_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                ExecutionError::InvalidParameters(format!(
                    "maxAgeMinutes out of range: {max_age_minutes}"
                ))
            })?;
        let removed = self.store.delete_inactive(cutoff).await?;
        {
            let mut tokens = self.tokens();
            for id in &removed {
                if let Some(token) = tokens.remove(id) {
                    token.cancel();
                }
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed inactive search sessions");
        }
        Ok(removed.len())
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let mut stats = SessionStats::default();
        for record in self.store.all().await? {
            match record.status {
                SearchSessionStatus::Active => stats.active += 1,
                SearchSessionStatus::Cancelled => stats.cancelled += 1,
                SearchSessionStatus::Completed => stats.completed += 1,
                SearchSessionStatus::Error => stats.error += 1,
            }
        }
        Ok(stats)
    }
}

/// Cancellation handle held by a running search.
pub struct SearchGuard {
    session_id: String,
    search_id: String,
    store: Arc<dyn SessionStore>,
    token: CancellationToken,
    poll_interval: Duration,
    last_poll: Mutex<Option<Instant>>,
}

impl SearchGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn search_id(&self) -> &str {
        &self.search_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn poll_due(&self) -> bool {
        let mut last = self.last_poll.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.poll_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Fail with [`SessionError::Cancelled`] once the search was cancelled.
    pub async fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(SessionError::Cancelled(self.search_id.clone()).into());
        }

        if self.poll_due() {
            let active = self
                .store
                .find(&self.session_id)
                .await?
                .is_some_and(|r| r.status == SearchSessionStatus::Active);
            if !active {
                self.token.cancel();
                return Err(SessionError::Cancelled(self.search_id.clone()).into());
            }
        }

        Ok(())
    }
}
