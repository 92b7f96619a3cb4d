use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::metrics::EngineMetrics;
use crate::engine::types::{ListenerPhase, Node, Variables};

/// What a listener sees when it is notified.
#[derive(Debug)]
pub struct ListenerEvent<'a> {
    pub phase: ListenerPhase,
    pub instance_id: &'a str,
    pub definition_id: &'a str,
    pub node_id: &'a str,
    pub node_name: Option<&'a str>,
    pub variables: &'a Variables,
}

/// Callback invoked synchronously on node entry/exit.
///
/// Errors and panics are logged and counted; they never abort the transition.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()>;
}

impl<F> ExecutionListener for F
where
    F: Fn(&ListenerEvent<'_>) -> Result<()> + Send + Sync,
{
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()> {
        self(event)
    }
}

/// Logs every notification.
pub struct LoggingListener;

impl ExecutionListener for LoggingListener {
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()> {
        info!(
            phase = %event.phase,
            node = %event.node_id,
            node_name = event.node_name.unwrap_or(""),
            definition = %event.definition_id,
            instance = %event.instance_id,
            "Execution listener"
        );
        Ok(())
    }
}

/// Registered listeners.
///
/// Two kinds of registration: named listeners, referenced from a node's
/// declared hooks in the definition, and listeners attached directly to a
/// `(node id, phase)` pair. Declared hooks fire first, then attached ones,
/// each in registration order.
pub struct ListenerRegistry {
    named: RwLock<HashMap<String, Arc<dyn ExecutionListener>>>,
    attached: RwLock<HashMap<(String, ListenerPhase), Vec<Arc<dyn ExecutionListener>>>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            named: RwLock::new(HashMap::new()),
            attached: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in `log` listener.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("log", Arc::new(LoggingListener));
        registry
    }

    /// Register a listener that definitions can reference by name.
    pub fn register(&self, name: &str, listener: Arc<dyn ExecutionListener>) {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), listener);
    }

    /// Attach a listener to a node id and phase, for every definition.
    pub fn attach(&self, node_id: &str, phase: ListenerPhase, listener: Arc<dyn ExecutionListener>) {
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((node_id.to_string(), phase))
            .or_default()
            .push(listener);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .named
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Notify every listener for this node and phase.
    pub(crate) fn fire(
        &self,
        node: &Node,
        phase: ListenerPhase,
        instance_id: &str,
        definition_id: &str,
        variables: &Variables,
        metrics: &EngineMetrics,
    ) {
        let mut listeners: Vec<(String, Arc<dyn ExecutionListener>)> = Vec::new();
        {
            let named = self.named.read().unwrap_or_else(PoisonError::into_inner);
            for hook in node.listeners.iter().filter(|h| h.phase == phase) {
                match named.get(&hook.listener) {
                    Some(l) => listeners.push((hook.listener.clone(), l.clone())),
                    None => {
                        warn!(node = %node.id, listener = %hook.listener, "Listener not registered");
                        metrics.listener_failure();
                    }
                }
            }
        }
        {
            let attached = self.attached.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = attached.get(&(node.id.clone(), phase)) {
                listeners.extend(list.iter().map(|l| ("<attached>".to_string(), l.clone())));
            }
        }

        if listeners.is_empty() {
            return;
        }

        let event = ListenerEvent {
            phase,
            instance_id,
            definition_id,
            node_id: &node.id,
            node_name: node.name.as_deref(),
            variables,
        };

        for (name, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.notify(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(node = %node.id, listener = %name, phase = %phase, error = %format!("{:#}", e), "Listener failed");
                    metrics.listener_failure();
                }
                Err(_) => {
                    warn!(node = %node.id, listener = %name, phase = %phase, "Listener panicked");
                    metrics.listener_failure();
                }
            }
        }
    }
}
