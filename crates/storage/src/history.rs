use std::sync::Arc;

use super::error::StorageResult;
use super::kv::KeyValueStore;
use super::types::{HISTORY_KEY, Turn, decode_turns, encode_turns};

/// Canonical transcript persisted as a single record under one key.
#[derive(Clone)]
pub struct HistoryStore {
    backend: Arc<dyn KeyValueStore>,
    key: String,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(backend, HISTORY_KEY)
    }

    pub fn with_key(backend: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loads the transcript. Missing, unreadable, or corrupt records all read as empty.
    pub async fn load(&self) -> Vec<Turn> {
        match self.try_load().await {
            Ok(turns) => turns,
            Err(error) => {
                tracing::warn!(
                    key = %self.key,
                    error = %error,
                    "chat history unavailable; starting with empty history"
                );
                Vec::new()
            }
        }
    }

    pub async fn append(&self, turns: &[Turn]) -> StorageResult<()> {
        if turns.is_empty() {
            return Ok(());
        }

        let mut history = match self.try_load().await {
            Ok(history) => history,
            Err(error @ super::StorageError::DecodeHistory { .. })
            | Err(error @ super::StorageError::UnknownRole { .. }) => {
                tracing::warn!(
                    key = %self.key,
                    error = %error,
                    "replacing corrupt chat history record"
                );
                Vec::new()
            }
            Err(error) => return Err(error),
        };

        history.extend_from_slice(turns);
        let payload = encode_turns(&history)?;
        self.backend.set(&self.key, payload).await?;

        tracing::debug!(
            key = %self.key,
            appended = turns.len(),
            total = history.len(),
            "appended turns to chat history"
        );
        Ok(())
    }

    pub async fn clear(&self) -> StorageResult<()> {
        self.backend.remove(&self.key).await?;
        tracing::info!(key = %self.key, "cleared chat history");
        Ok(())
    }

    async fn try_load(&self) -> StorageResult<Vec<Turn>> {
        match self.backend.get(&self.key).await? {
            Some(payload) => decode_turns(&payload),
            None => Ok(Vec::new()),
        }
    }
}
