pub mod deployment;
pub mod error;
pub mod executor;
pub mod guard;
pub mod history;
pub mod listeners;
pub mod metrics;
pub mod repository;
pub mod tasks;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub use error::{EngineError, Result};
pub use history::HistoryFilter;
pub use listeners::{ExecutionListener, ListenerEvent, ListenerRegistry};
pub use metrics::{EngineMetrics, MetricsSnapshot};

use crate::services::ServiceRegistry;
use crate::storage::StateStore;
use history::HistoryRecorder;
use repository::DefinitionRepository;
use tasks::TaskTable;
use types::{InstanceStatus, ProcessDefinition, ProcessInstance};

/// Default ceiling on nodes entered during one auto-advance run.
pub const DEFAULT_MAX_AUTO_STEPS: usize = 10_000;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_auto_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_auto_steps: DEFAULT_MAX_AUTO_STEPS,
        }
    }
}

/// Runtime slot for one process instance.
pub(crate) struct InstanceEntry {
    pub(crate) definition_id: String,
    /// `None` only for finished instances whose definition was removed.
    definition: Option<Arc<ProcessDefinition>>,
    pub(crate) state: Mutex<ProcessInstance>,
}

impl InstanceEntry {
    pub(crate) fn new(definition: Option<Arc<ProcessDefinition>>, instance: ProcessInstance) -> Self {
        Self {
            definition_id: instance.definition_id.clone(),
            definition,
            state: Mutex::new(instance),
        }
    }

    pub(crate) fn definition(&self) -> Result<&Arc<ProcessDefinition>> {
        self.definition.as_ref().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "definition '{}' is no longer deployed",
                self.definition_id
            ))
        })
    }
}

/// The engine context: definition store, running instances, task table,
/// history and the registries they call out to.
///
/// Built once per process and shared behind an `Arc`.
pub struct ProcessEngine {
    pub(crate) repository: DefinitionRepository,
    pub(crate) instances: RwLock<HashMap<String, Arc<InstanceEntry>>>,
    pub(crate) tasks: TaskTable,
    pub(crate) history: HistoryRecorder,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) services: ServiceRegistry,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) config: EngineConfig,
    pub(crate) metrics: Arc<EngineMetrics>,
}

/// Builder for [`ProcessEngine`].
pub struct EngineBuilder {
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    services: ServiceRegistry,
    listeners: ListenerRegistry,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_auto_steps(mut self, steps: usize) -> Self {
        self.config.max_auto_steps = steps;
        self
    }

    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = listeners;
        self
    }

    /// Load persisted state from the store and build the engine.
    pub async fn open(self) -> Result<ProcessEngine> {
        let snapshot = self.store.load().await?;
        let history = self.store.list_history().await?;
        let last_seq = history.iter().map(|e| e.seq).max().unwrap_or(0);

        let repository = DefinitionRepository::restore(
            snapshot.definitions,
            snapshot.versions,
            snapshot.deployments,
        );

        let mut instances = HashMap::new();
        {
            let repo = repository.read().await;
            for mut instance in snapshot.instances {
                let definition = repo.get(&instance.definition_id).ok();
                if definition.is_none() && instance.is_running() {
                    warn!(
                        instance_id = %instance.id,
                        definition_id = %instance.definition_id,
                        "Definition missing for running instance, marking terminated"
                    );
                    instance.status = InstanceStatus::Terminated;
                    instance.ended_at = Some(Utc::now());
                    instance.error = Some("definition missing at startup".to_string());
                    instance.tokens.clear();
                    self.store.save_instance(&instance).await?;
                }
                instances.insert(
                    instance.id.clone(),
                    Arc::new(InstanceEntry::new(definition, instance)),
                );
            }
        }

        let metrics = Arc::new(EngineMetrics::default());
        let engine = ProcessEngine {
            repository,
            instances: RwLock::new(instances),
            tasks: TaskTable::restore(snapshot.tasks, snapshot.comments),
            history: HistoryRecorder::new(self.store.clone(), last_seq, metrics.clone()),
            listeners: self.listeners,
            services: self.services,
            store: self.store,
            config: self.config,
            metrics,
        };

        info!(
            definitions = engine.repository.read().await.len(),
            instances = engine.instances.read().await.len(),
            history_seq = last_seq,
            "Process engine opened"
        );
        Ok(engine)
    }
}

impl ProcessEngine {
    /// Start building an engine over `store`, with the built-in services and listeners.
    pub fn builder(store: Arc<dyn StateStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            services: ServiceRegistry::with_builtins(),
            listeners: ListenerRegistry::with_builtins(),
        }
    }

    /// Open an engine with default settings.
    pub async fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        Self::builder(store).open().await
    }

    /// Listener registry; listeners may be added while the engine runs.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) async fn entry(&self, instance_id: &str) -> Result<Arc<InstanceEntry>> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("process instance", instance_id))
    }
}
