pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::Variables;

/// Trait that all service-step handlers implement.
#[async_trait]
pub trait ServiceTask: Send + Sync {
    /// Name referenced by a service step's `implementation`.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Run the step. The returned variables are merged into the instance.
    async fn execute(&self, fields: &BTreeMap<String, String>, vars: &Variables) -> Result<Variables>;
}

/// Registry of available service handlers.
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn ServiceTask>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Create a registry with all built-in services registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, service: Arc<dyn ServiceTask>) {
        self.services.insert(service.name().to_string(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceTask>> {
        self.services.get(name).cloned()
    }

    /// List all registered services with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .services
            .values()
            .map(|s| (s.name(), s.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
