//! In-memory state store
//!
//! The default store and the fallback behind [`super::ResilientStore`].
//! Entries carry their own expiry; reads treat expired entries as absent
//! and a sweep removes them eagerly.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{OwnerId, SessionId, SessionState, StoreError};

use super::{MetadataPatch, SessionSummary, StateStore};

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// DashMap-backed store. Sessions are kept as serialized JSON alongside a
/// summary row for cheap listing.
pub struct MemoryStore {
    sessions: DashMap<SessionId, (Entry, SessionSummary)>,
    kv: DashMap<String, Entry>,
    default_ttl: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            kv: DashMap::new(),
            default_ttl: None,
        }
    }

    /// Apply a default TTL to every record saved without an explicit one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    fn entry(&self, bytes: Vec<u8>, ttl: Option<Duration>) -> Entry {
        Entry {
            bytes,
            expires_at: ttl.or(self.default_ttl).map(|t| Instant::now() + t),
        }
    }

    /// Drop expired records. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.sessions.len() + self.kv.len();
        self.sessions.retain(|_, record| !record.0.expired());
        self.kv.retain(|_, entry| !entry.expired());
        before - (self.sessions.len() + self.kv.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let summary = SessionSummary::from(state);
        self.sessions
            .insert(state.session_id, (self.entry(bytes, None), summary));
        Ok(())
    }

    async fn load(&self, id: SessionId) -> Result<SessionState, StoreError> {
        let Some(record) = self.sessions.get(&id) else {
            return Err(StoreError::NotFound(id));
        };
        let (entry, _) = record.value();
        if entry.expired() {
            drop(record);
            self.sessions.remove(&id);
            return Err(StoreError::NotFound(id));
        }
        serde_json::from_slice(&entry.bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn save_metadata(&self, id: SessionId, patch: MetadataPatch) -> Result<(), StoreError> {
        let mut state = self.load(id).await?;
        if let Some(phase) = patch.phase {
            state.phase = phase;
        }
        if let Some(reason) = patch.kill_reason {
            state.kill_reason = Some(reason);
        }
        if let Some(text) = patch.synthesis_text {
            state.synthesis_text = Some(text);
        }
        state.updated_at = chrono::Utc::now();
        self.save(&state).await
    }

    async fn list_active(&self) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|r| !r.value().0.expired() && !r.value().1.phase.is_terminal())
            .map(|r| r.value().1.clone())
            .collect())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .filter(|r| !r.value().0.expired() && &r.value().1.owner_id == owner)
            .map(|r| r.value().1.clone())
            .collect())
    }

    async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        self.sessions.remove(&id);
        let prefix = format!("checkpoint:{}:", id);
        self.kv.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.kv.insert(key.to_string(), self.entry(value, ttl));
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(entry) = self.kv.get(key) else {
            return Ok(None);
        };
        if entry.expired() {
            drop(entry);
            self.kv.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.bytes.clone()))
    }
}
