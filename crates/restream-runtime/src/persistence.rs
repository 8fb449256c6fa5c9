//! Best-effort session snapshots on top of a key/value store.
//!
//! Keys follow `<namespace>:<sessionId>:<field>` with the fields
//! `timeline`, `elapsedSeconds`, `completed`, and `completedAtSeconds`.
//! A snapshot exists iff its `timeline` key exists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use restream_protocol::{
    AgentEvent, EngineError, EngineResult, KeyValueStorePort, SessionId, SessionState, Timeline,
};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument};

pub const DEFAULT_NAMESPACE: &str = "restream";

const TIMELINE: &str = "timeline";
const ELAPSED_SECONDS: &str = "elapsedSeconds";
const COMPLETED: &str = "completed";
const COMPLETED_AT_SECONDS: &str = "completedAtSeconds";

#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStorePort>,
    namespace: String,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStorePort>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn key(&self, session_id: &SessionId, field: &str) -> String {
        format!("{}:{}:{field}", self.namespace, session_id.as_str())
    }

    /// Overwrite the session's snapshot wholesale.
    #[instrument(
        skip(self, state),
        fields(session_id = %session_id, events = state.timeline.len(), elapsed = state.elapsed_seconds)
    )]
    pub async fn save(&self, session_id: &SessionId, state: &SessionState) -> EngineResult<()> {
        let timeline = serde_json::to_string(&state.timeline)?;
        self.store
            .put(&self.key(session_id, TIMELINE), timeline)
            .await?;
        self.store
            .put(
                &self.key(session_id, ELAPSED_SECONDS),
                state.elapsed_seconds.to_string(),
            )
            .await?;
        self.store
            .put(&self.key(session_id, COMPLETED), state.completed.to_string())
            .await?;
        self.store
            .put(
                &self.key(session_id, COMPLETED_AT_SECONDS),
                serde_json::to_string(&state.completed_at_seconds)?,
            )
            .await?;
        debug!("snapshot saved");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn load(&self, session_id: &SessionId) -> EngineResult<Option<SessionState>> {
        let Some(raw_timeline) = self.store.get(&self.key(session_id, TIMELINE)).await? else {
            debug!("no snapshot");
            return Ok(None);
        };
        let events: Vec<AgentEvent> = parse(TIMELINE, &raw_timeline)?;
        let timeline = Timeline::from_events(events)
            .map_err(|error| EngineError::InvalidSnapshot(error.to_string()))?;

        let elapsed_seconds: Option<u64> = self.field(session_id, ELAPSED_SECONDS).await?;
        let completed: Option<bool> = self.field(session_id, COMPLETED).await?;
        let completed_at_seconds: Option<Option<u64>> =
            self.field(session_id, COMPLETED_AT_SECONDS).await?;

        debug!(events = timeline.len(), "snapshot loaded");
        Ok(Some(SessionState {
            session_id: session_id.clone(),
            timeline,
            elapsed_seconds: elapsed_seconds.unwrap_or_default(),
            completed: completed.unwrap_or_default(),
            completed_at_seconds: completed_at_seconds.flatten(),
        }))
    }

    /// Drop the snapshot entirely.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn evict(&self, session_id: &SessionId) -> EngineResult<()> {
        for field in [TIMELINE, ELAPSED_SECONDS, COMPLETED, COMPLETED_AT_SECONDS] {
            self.store.remove(&self.key(session_id, field)).await?;
        }
        debug!("snapshot evicted");
        Ok(())
    }

    async fn field<T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        field: &str,
    ) -> EngineResult<Option<T>> {
        match self.store.get(&self.key(session_id, field)).await? {
            Some(raw) => parse(field, &raw).map(Some),
            None => Ok(None),
        }
    }
}

fn parse<T: DeserializeOwned>(field: &str, raw: &str) -> EngineResult<T> {
    serde_json::from_str(raw)
        .map_err(|error| EngineError::InvalidSnapshot(format!("{field}: {error}")))
}

/// Process-local store; snapshots survive remounts but not restarts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStorePort for InMemoryKvStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> EngineResult<()> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> EngineResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under `root`, named by the SHA-256 of the key.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(format!("{}.value", hex::encode(digest)))
    }

    async fn read(path: &Path) -> Result<Option<String>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading store entry {path:?}"))?;
        Ok(Some(raw))
    }

    async fn write(path: &Path, value: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create store dir {parent:?}"))?;
        }
        fs::write(path, value)
            .await
            .with_context(|| format!("failed writing store entry {path:?}"))?;
        Ok(())
    }

    async fn delete(path: &Path) -> Result<()> {
        if fs::try_exists(path).await.unwrap_or(false) {
            fs::remove_file(path)
                .await
                .with_context(|| format!("failed removing store entry {path:?}"))?;
        }
        Ok(())
    }
}

fn io_error(error: anyhow::Error) -> EngineError {
    EngineError::Io(format!("{error:#}"))
}

#[async_trait]
impl KeyValueStorePort for FileKvStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Self::read(&self.path_for(key)).await.map_err(io_error)
    }

    async fn put(&self, key: &str, value: String) -> EngineResult<()> {
        Self::write(&self.path_for(key), &value)
            .await
            .map_err(io_error)
    }

    async fn remove(&self, key: &str) -> EngineResult<()> {
        Self::delete(&self.path_for(key)).await.map_err(io_error)
    }
}
