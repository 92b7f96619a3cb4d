pub mod json_store;
pub mod memory_store;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::*;

/// Everything an engine needs to resume, loaded once when it opens.
///
/// History is not part of the snapshot; it is queried from the store on
/// demand.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub deployments: Vec<Deployment>,
    pub definitions: Vec<ProcessDefinition>,
    /// Highest version ever assigned per definition key.
    pub versions: HashMap<String, u32>,
    pub instances: Vec<ProcessInstance>,
    pub tasks: Vec<Task>,
    pub comments: Vec<Comment>,
}

/// Trait for engine state persistence.
///
/// Records are written through on every change; `save_*` methods replace
/// the stored record with the same id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn delete_deployment(&self, id: &str) -> Result<()>;

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;

    async fn delete_definition(&self, id: &str) -> Result<()>;

    /// Persist the version counter for a definition key.
    async fn save_version(&self, key: &str, version: u32) -> Result<()>;

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;

    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn append_comment(&self, comment: &Comment) -> Result<()>;

    async fn append_history(&self, event: &HistoryEvent) -> Result<()>;

    /// All history events in append order.
    async fn list_history(&self) -> Result<Vec<HistoryEvent>>;

    /// Load all runtime records.
    async fn load(&self) -> Result<Snapshot>;
}
