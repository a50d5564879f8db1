use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{SearchSessionRecord, SearchSessionStatus};
use crate::error::{Result, SessionError};

/// Persistence of search session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: SearchSessionRecord) -> Result<()>;

    async fn update(&self, record: &SearchSessionRecord) -> Result<()>;

    async fn find(&self, id: &str) -> Result<Option<SearchSessionRecord>>;

    /// Most recent record created for `search_id`.
    async fn find_by_search_id(&self, search_id: &str) -> Result<Option<SearchSessionRecord>>;

    async fn find_active_by_user(&self, user_id: &str) -> Result<Vec<SearchSessionRecord>>;

    /// Delete settled records and active records idle since before `cutoff`.
    /// Returns the ids removed.
    async fn delete_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    async fn all(&self) -> Result<Vec<SearchSessionRecord>>;
}

/// Process-local [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SearchSessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: SearchSessionRecord) -> Result<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, record: &SearchSessionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(SessionError::NotFound(record.id.clone()).into()),
        }
    }

    async fn find(&self, id: &str) -> Result<Option<SearchSessionRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_search_id(&self, search_id: &str) -> Result<Option<SearchSessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.search_id == search_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn find_active_by_user(&self, user_id: &str) -> Result<Vec<SearchSessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id && r.status == SearchSessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn delete_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut records = self.records.write().await;
        let stale: Vec<String> = records
            .values()
            .filter(|r| r.status != SearchSessionStatus::Active || r.last_activity_at < cutoff)
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            records.remove(id);
        }
        Ok(stale)
    }

    async fn all(&self) -> Result<Vec<SearchSessionRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
