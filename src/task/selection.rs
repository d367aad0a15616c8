// ABOUTME: Per-agent "current task" selection, behind a pluggable store trait
// ABOUTME: with in-memory and JSON-file implementations.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

/// File name used by [`FileSelectionStore`] inside the task root.
pub const SELECTION_FILE_NAME: &str = ".current-tasks.json";

/// Remembers which task each agent is working on.
#[async_trait]
pub trait SelectionStore: Send + Sync {
    /// The selected task id for `agent`, if any.
    async fn get(&self, agent: &str) -> anyhow::Result<Option<String>>;

    /// Select `task_id` for `agent`, replacing any previous selection.
    async fn set(&self, agent: &str, task_id: &str) -> anyhow::Result<()>;

    /// Drop `agent`'s selection. Returns the id that was selected.
    async fn clear(&self, agent: &str) -> anyhow::Result<Option<String>>;
}

/// In-memory selection store. Lost when the process exits.
#[derive(Default)]
pub struct MemorySelectionStore {
    selections: RwLock<HashMap<String, String>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionStore for MemorySelectionStore {
    async fn get(&self, agent: &str) -> anyhow::Result<Option<String>> {
        Ok(self.selections.read().await.get(agent).cloned())
    }

    async fn set(&self, agent: &str, task_id: &str) -> anyhow::Result<()> {
        self.selections
            .write()
            .await
            .insert(agent.to_string(), task_id.to_string());
        Ok(())
    }

    async fn clear(&self, agent: &str) -> anyhow::Result<Option<String>> {
        Ok(self.selections.write().await.remove(agent))
    }
}

/// Selection store persisted as a JSON object `{agent: taskId}`, so separate
/// CLI invocations share the same selections.
pub struct FileSelectionStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    async fn load(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, selections: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, serde_json::to_vec_pretty(selections)?)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))
    }
}

#[async_trait]
impl SelectionStore for FileSelectionStore {
    async fn get(&self, agent: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.remove(agent))
    }

    async fn set(&self, agent: &str, task_id: &str) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut selections = self.load().await?;
        selections.insert(agent.to_string(), task_id.to_string());
        self.save(&selections).await
    }

    async fn clear(&self, agent: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.guard.lock().await;
        let mut selections = self.load().await?;
        let previous = selections.remove(agent);
        if previous.is_some() {
            self.save(&selections).await?;
        }
        Ok(previous)
    }
}
