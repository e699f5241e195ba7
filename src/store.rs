//! Persistence for in-flight monitor state, keyed by run ID.
//!
//! A store only has to offer at-least-once writes with read-after-write
//! consistency: a lost write costs one redundant re-poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::state::MonitorState;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, run_id: &str, state: &MonitorState) -> Result<(), StoreError>;
    async fn load(&self, run_id: &str) -> Result<Option<MonitorState>, StoreError>;
    async fn remove(&self, run_id: &str) -> Result<(), StoreError>;
    /// Run IDs with persisted state, sorted. Documents that cannot be read
    /// are left out rather than failing the listing.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// One JSON document per run inside a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(run_id)))
    }
}

/// Maps a run ID onto a file-name-safe stem.
fn file_stem(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, run_id: &str, state: &MonitorState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, state.to_json()?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id, attempt = state.attempt, path = %path.display(), "persisted monitor state");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<MonitorState>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(run_id)).await {
            Ok(raw) => Ok(Some(MonitorState::from_json(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, run_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // The run ID lives inside the document; file names may be sanitized.
        let mut run_ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => MonitorState::from_json(&raw),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(state) => run_ids.push(state.run_id),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable monitor state"),
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }
}

/// In-process store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, MonitorState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, run_id: &str, state: &MonitorState) -> Result<(), StoreError> {
        self.states
            .lock()
            .await
            .insert(run_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<MonitorState>, StoreError> {
        Ok(self.states.lock().await.get(run_id).cloned())
    }

    async fn remove(&self, run_id: &str) -> Result<(), StoreError> {
        self.states.lock().await.remove(run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut run_ids: Vec<String> = self.states.lock().await.keys().cloned().collect();
        run_ids.sort();
        Ok(run_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_replaces_path_separators() {
        assert_eq!(file_stem("eval/42:run"), "eval_42_run");
        assert_eq!(file_stem("run-abc_1.2"), "run-abc_1.2");
    }
}
