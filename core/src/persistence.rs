//! Conversation history persistence
//!
//! The history is stored as one opaque JSON document. `FileHistoryStore`
//! writes a sibling temp file and renames it over the target so a crash never
//! leaves a half-written history behind.

use crate::context::types::ConversationHistory;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Load/save seam for conversation history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    async fn load(&self) -> Result<Option<ConversationHistory>, HistoryError>;

    async fn save(&self, history: &ConversationHistory) -> Result<(), HistoryError>;
}

/// JSON file on disk
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "history.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn load(&self) -> Result<Option<ConversationHistory>, HistoryError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let history = ConversationHistory::from_json(&text)?;
        info!(
            target: "history",
            path = %self.path.display(),
            messages = history.messages.len(),
            "Loaded conversation history"
        );
        Ok(Some(history))
    }

    async fn save(&self, history: &ConversationHistory) -> Result<(), HistoryError> {
        let json = history.to_json()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            target: "history",
            path = %self.path.display(),
            messages = history.messages.len(),
            "Saved conversation history"
        );
        Ok(())
    }
}

/// In-process store, handy for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryHistoryStore {
    slot: Mutex<Option<String>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().map(|s| s.is_none()).unwrap_or(true)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Option<ConversationHistory>, HistoryError> {
        let stored = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        stored
            .map(|json| ConversationHistory::from_json(&json))
            .transpose()
            .map_err(HistoryError::from)
    }

    async fn save(&self, history: &ConversationHistory) -> Result<(), HistoryError> {
        let json = history.to_json()?;
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        Ok(())
    }
}
