//! File-backed state store
//!
//! One JSON file per session under `sessions/`, raw KV entries under
//! `kv/`. Writes are atomic (tempfile + rename) so a crash mid-write
//! never leaves a partially written checkpoint. This is the store the CLI
//! uses so resume works across process restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, SessionId, SessionState, StoreError};

use super::{MetadataPatch, SessionSummary, StateStore};

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    expires_at: Option<DateTime<Utc>>,
    state: SessionState,
}

#[derive(Serialize, Deserialize)]
struct RawRecord {
    expires_at: Option<DateTime<Utc>>,
    /// Hex-encoded payload; keeps the envelope valid UTF-8 JSON.
    data: String,
}

/// JSON-file-per-record store rooted at a directory.
pub struct FileStore {
    root: PathBuf,
    default_ttl: Option<Duration>,
}

impl FileStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["sessions", "kv"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(Self {
            root,
            default_ttl: None,
        })
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.root.join("sessions").join(format!("{}.json", id))
    }

    fn kv_path(&self, key: &str) -> PathBuf {
        // Keys contain ':'; keep filenames portable.
        let safe = key.replace([':', '/', '\\'], "__");
        self.root.join("kv").join(format!("{}.json", safe))
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.or(self.default_ttl)
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|d| Utc::now() + d)
    }

    async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            use std::io::Write;
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let mut tmp =
                tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.write_all(&bytes).map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.flush().map_err(|e| StoreError::Io(e.to_string()))?;
            tmp.persist(&path)
                .map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(format!("write task panicked: {}", e)))?
    }

    async fn read_record(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let path = self.session_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        let record: SessionRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if record.expires_at.is_some_and(|at| Utc::now() >= at) {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let dir = self.root.join("sessions");
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let Ok(id) = stem.parse::<SessionId>() else {
                continue;
            };
            if let Some(record) = self.read_record(id).await? {
                out.push(SessionSummary::from(&record.state));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        let record = SessionRecord {
            expires_at: self.expiry(None),
            state: state.clone(),
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.session_path(state.session_id), bytes).await
    }

    async fn load(&self, id: SessionId) -> Result<SessionState, StoreError> {
        match self.read_record(id).await? {
            Some(record) => Ok(record.state),
            None => Err(StoreError::NotFound(id)),
        }
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
        state.updated_at = Utc::now();
        self.save(&state).await
    }

    async fn list_active(&self) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self
            .summaries()
            .await?
            .into_iter()
            .filter(|s| !s.phase.is_terminal())
            .collect())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self
            .summaries()
            .await?
            .into_iter()
            .filter(|s| &s.owner_id == owner)
            .collect())
    }

    async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        let _ = tokio::fs::remove_file(self.session_path(id)).await;
        // Checkpoints for this session live under kv/ with the id embedded.
        let prefix = format!("checkpoint__{}", id);
        let dir = self.root.join("kv");
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&prefix)
                {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }

    async fn put_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let record = RawRecord {
            expires_at: self.expiry(ttl),
            data: hex::encode(&value),
        };
        let bytes =
            serde_json::to_vec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.kv_path(key), bytes).await
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.kv_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        let record: RawRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if record.expires_at.is_some_and(|at| Utc::now() >= at) {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        hex::decode(&record.data)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
