//! Durable poller state.
//!
//! The state document lives under a single key in a `StateStore`. Reads are
//! forgiving (missing or corrupt documents mean a fresh start); writes merge
//! with whatever is stored so an overlapping invocation can never move a
//! cursor backward.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use f1_common::PollerState;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by state backends.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store unreadable ({key}): {message}")]
    Unreadable { key: String, message: String },

    #[error("state store unwritable ({key}): {message}")]
    Unwritable { key: String, message: String },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Single-key document store holding the poller state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Identifier of the stored document (parameter name, file path, ...).
    fn key(&self) -> &str;

    /// Returns the stored document, or `None` if nothing is stored yet.
    async fn read(&self) -> Result<Option<String>, StateStoreError>;

    /// Replaces the stored document.
    async fn write(&self, document: &str) -> Result<(), StateStoreError>;
}

/// Suffix counter for temp files, unique per write within the process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// State store backed by a JSON file. Writes go through a temp file and a
/// rename so readers never observe a half-written document.
pub struct FileStateStore {
    path: PathBuf,
    key: String,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let key = path.display().to_string();
        Self { path, key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read(&self) -> Result<Option<String>, StateStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateStoreError::Unreadable {
                key: self.key.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn write(&self, document: &str) -> Result<(), StateStoreError> {
        let unwritable = |e: std::io::Error| StateStoreError::Unwritable {
            key: self.key.clone(),
            message: e.to_string(),
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(unwritable)?;
        }

        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .path
            .with_extension(format!("tmp.{}.{}", std::process::id(), seq));
        tokio::fs::write(&tmp, document).await.map_err(unwritable)?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(unwritable(e));
        }
        Ok(())
    }
}

/// In-process state store.
#[derive(Default)]
pub struct MemoryStateStore {
    document: Mutex<Option<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: &str) -> Self {
        Self {
            document: Mutex::new(Some(document.to_string())),
        }
    }

    /// Current stored document.
    pub fn document(&self) -> Option<String> {
        self.document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn key(&self) -> &str {
        "memory"
    }

    async fn read(&self) -> Result<Option<String>, StateStoreError> {
        Ok(self.document())
    }

    async fn write(&self, document: &str) -> Result<(), StateStoreError> {
        *self
            .document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(document.to_string());
        Ok(())
    }
}

/// Loads and persists `PollerState` through a `StateStore`.
///
/// Saves through the same `CursorStore` are serialized, so the
/// read-merge-write of one can never interleave with another's.
pub struct CursorStore {
    store: Arc<dyn StateStore>,
    save_lock: tokio::sync::Mutex<()>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        self.store.key()
    }

    /// Loads the stored state. Never fails: an absent, unreadable or
    /// unparsable document yields the empty state.
    pub async fn load(&self) -> PollerState {
        self.read_stored().await.unwrap_or_default()
    }

    /// Persists `state` merged with the currently stored document.
    ///
    /// Returns the document actually written.
    pub async fn save(&self, state: &PollerState) -> Result<PollerState, StateStoreError> {
        let _guard = self.save_lock.lock().await;
        let merged = match self.read_stored().await {
            Some(stored) => state.merged_with(&stored),
            None => state.clone(),
        };

        let document = merged.to_json()?;
        self.store.write(&document).await?;
        debug!(
            "Persisted state to {} (session={:?}, invocation={}, cursors={})",
            self.store.key(),
            merged.session_key,
            merged.invocation_count,
            merged.cursors.len()
        );
        Ok(merged)
    }

    async fn read_stored(&self) -> Option<PollerState> {
        let document = match self.store.read().await {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!("No stored state at {}, starting fresh", self.store.key());
                return None;
            }
            Err(e) => {
                warn!("{}; starting from empty state", e);
                return None;
            }
        };

        match PollerState::from_json(&document) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(
                    "Stored state at {} is not valid ({}); starting from empty state",
                    self.store.key(),
                    e
                );
                None
            }
        }
    }
}
