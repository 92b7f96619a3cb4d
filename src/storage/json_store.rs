use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

use crate::engine::types::*;
use crate::storage::{Snapshot, StateStore};

const DEPLOYMENTS: &str = "deployments";
const DEFINITIONS: &str = "definitions";
const INSTANCES: &str = "instances";
const TASKS: &str = "tasks";
const VERSIONS_FILE: &str = "versions.json";
const COMMENTS_FILE: &str = "comments.jsonl";
const HISTORY_FILE: &str = "history.jsonl";

/// File-based JSON state store.
///
/// Layout under the base directory: one JSON file per deployment,
/// definition, instance and task in a sub-directory each, the version
/// counters in `versions.json`, and comments and history as append-only
/// JSON-lines files.
pub struct JsonStateStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonStateStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, dir: &str, id: &str) -> PathBuf {
        self.base_dir.join(dir).join(format!("{}.json", file_stem(id)))
    }

    async fn write_record<T: Serialize>(&self, dir: &str, id: &str, value: &T) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.record_path(dir, id);
        write_atomic(&path, value).await
    }

    async fn remove_record(&self, dir: &str, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.record_path(dir, id);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let _lock = self.lock.write().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.base_dir.join(file);

        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    async fn read_records<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let dir_path = self.base_dir.join(dir);
        if !dir_path.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<T>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    async fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.base_dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut records = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "Skipping unreadable line"),
            }
        }
        Ok(records)
    }

    async fn read_versions(&self) -> Result<HashMap<String, u32>> {
        let path = self.base_dir.join(VERSIONS_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.write_record(DEPLOYMENTS, &deployment.id, deployment).await
    }

    async fn delete_deployment(&self, id: &str) -> Result<()> {
        self.remove_record(DEPLOYMENTS, id).await
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        self.write_record(DEFINITIONS, &definition.id, definition).await
    }

    async fn delete_definition(&self, id: &str) -> Result<()> {
        self.remove_record(DEFINITIONS, id).await
    }

    async fn save_version(&self, key: &str, version: u32) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.base_dir.join(VERSIONS_FILE);
        let mut versions: HashMap<String, u32> = if path.exists() {
            let data = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&data)?
        } else {
            HashMap::new()
        };
        let entry = versions.entry(key.to_string()).or_insert(0);
        *entry = (*entry).max(version);
        write_atomic(&path, &versions).await
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        self.write_record(INSTANCES, &instance.id, instance).await
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.write_record(TASKS, &task.id, task).await
    }

    async fn append_comment(&self, comment: &Comment) -> Result<()> {
        self.append_line(COMMENTS_FILE, comment).await
    }

    async fn append_history(&self, event: &HistoryEvent) -> Result<()> {
        self.append_line(HISTORY_FILE, event).await
    }

    async fn list_history(&self) -> Result<Vec<HistoryEvent>> {
        let _lock = self.lock.read().await;
        self.read_lines(HISTORY_FILE).await
    }

    async fn load(&self) -> Result<Snapshot> {
        let _lock = self.lock.read().await;
        Ok(Snapshot {
            deployments: self.read_records(DEPLOYMENTS).await?,
            definitions: self.read_records(DEFINITIONS).await?,
            versions: self.read_versions().await?,
            instances: self.read_records(INSTANCES).await?,
            tasks: self.read_records(TASKS).await?,
            comments: self.read_lines(COMMENTS_FILE).await?,
        })
    }
}

/// Write via a temp file and rename so readers never see a partial record.
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Map an id to a portable file name (definition ids contain ':').
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
