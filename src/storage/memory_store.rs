use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::*;
use crate::storage::{Snapshot, StateStore};

#[derive(Default)]
struct Inner {
    deployments: HashMap<String, Deployment>,
    definitions: HashMap<String, ProcessDefinition>,
    versions: HashMap<String, u32>,
    instances: HashMap<String, ProcessInstance>,
    tasks: HashMap<String, Task>,
    comments: Vec<Comment>,
    history: Vec<HistoryEvent>,
}

/// In-memory state store.
/// Holds state only for the lifetime of the store instance.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.inner()
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, id: &str) -> Result<()> {
        self.inner().deployments.remove(id);
        Ok(())
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        self.inner()
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn delete_definition(&self, id: &str) -> Result<()> {
        self.inner().definitions.remove(id);
        Ok(())
    }

    async fn save_version(&self, key: &str, version: u32) -> Result<()> {
        let mut inner = self.inner();
        let entry = inner.versions.entry(key.to_string()).or_insert(0);
        *entry = (*entry).max(version);
        Ok(())
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        self.inner()
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.inner().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn append_comment(&self, comment: &Comment) -> Result<()> {
        self.inner().comments.push(comment.clone());
        Ok(())
    }

    async fn append_history(&self, event: &HistoryEvent) -> Result<()> {
        self.inner().history.push(event.clone());
        Ok(())
    }

    async fn list_history(&self) -> Result<Vec<HistoryEvent>> {
        Ok(self.inner().history.clone())
    }

    async fn load(&self) -> Result<Snapshot> {
        let inner = self.inner();
        Ok(Snapshot {
            deployments: inner.deployments.values().cloned().collect(),
            definitions: inner.definitions.values().cloned().collect(),
            versions: inner.versions.clone(),
            instances: inner.instances.values().cloned().collect(),
            tasks: inner.tasks.values().cloned().collect(),
            comments: inner.comments.clone(),
        })
    }
}
