//! Durable keyed store for session state and checkpoints
//!
//! One record per session under `session:{id}`, checkpoints under
//! `checkpoint:{session_id}:{phase_key}` with a `latest` pointer, and a
//! raw KV surface that the embedding cache and researcher cache share.
//! All records honor a configurable TTL.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, SessionId, SessionPhase, SessionState, StoreError};

pub mod file;
pub mod memory;
pub mod resilient;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use resilient::ResilientStore;

/// Lightweight listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub phase: SessionPhase,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id,
            owner_id: state.owner_id.clone(),
            phase: state.phase,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Partial metadata update applied without rewriting the whole record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SessionPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_text: Option<String>,
}

/// Key–value store keyed by session id with a secondary owner index.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist the full session record under `session:{id}`.
    async fn save(&self, state: &SessionState) -> Result<(), StoreError>;

    /// Load the session record.
    async fn load(&self, id: SessionId) -> Result<SessionState, StoreError>;

    /// Apply a partial metadata update to an existing record.
    async fn save_metadata(&self, id: SessionId, patch: MetadataPatch) -> Result<(), StoreError>;

    /// All sessions in a non-terminal phase.
    async fn list_active(&self) -> Result<Vec<SessionSummary>, StoreError>;

    /// All sessions owned by `owner`.
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>, StoreError>;

    /// Remove the session record and its checkpoints.
    async fn delete(&self, id: SessionId) -> Result<(), StoreError>;

    /// Raw KV write with optional TTL (embedding cache, research cache,
    /// checkpoints).
    async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Raw KV read; `None` when absent or expired.
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Checkpoint helpers layered over the raw KV surface.
///
/// A checkpoint is written after every graph node transition; resume reads
/// the latest one and continues from the stored phase with no data loss.
pub struct Checkpoints;

impl Checkpoints {
    fn key(session_id: SessionId, phase_key: &str) -> String {
        format!("checkpoint:{}:{}", session_id, phase_key)
    }

    fn latest_key(session_id: SessionId) -> String {
        format!("checkpoint:{}:latest", session_id)
    }

    /// Write a checkpoint for `phase_key` and move the latest pointer.
    pub async fn write(
        store: &dyn StateStore,
        state: &SessionState,
        phase_key: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        store
            .put_raw(&Self::key(state.session_id, phase_key), bytes, ttl)
            .await?;
        store
            .put_raw(
                &Self::latest_key(state.session_id),
                phase_key.as_bytes().to_vec(),
                ttl,
            )
            .await
    }

    /// Read the latest checkpoint, if any.
    pub async fn read_latest(
        store: &dyn StateStore,
        session_id: SessionId,
    ) -> Result<Option<SessionState>, StoreError> {
        let Some(pointer) = store.get_raw(&Self::latest_key(session_id)).await? else {
            return Ok(None);
        };
        let phase_key = String::from_utf8_lossy(&pointer).to_string();
        let Some(bytes) = store.get_raw(&Self::key(session_id, &phase_key)).await? else {
            return Ok(None);
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(state))
    }
}
