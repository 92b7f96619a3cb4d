use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::bpmn::interpolate::interpolate_vars;
use crate::engine::types::{Variable, Variables};
use crate::services::{ServiceRegistry, ServiceTask};

/// Register all built-in services into the registry.
pub fn register_all(registry: &mut ServiceRegistry) {
    registry.register(Arc::new(LogService));
    registry.register(Arc::new(SetVariablesService));
}

/// Logs the `message` field.
pub struct LogService;

#[async_trait]
impl ServiceTask for LogService {
    fn name(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Log an interpolated message"
    }

    async fn execute(&self, fields: &BTreeMap<String, String>, vars: &Variables) -> Result<Variables> {
        let message = fields
            .get("message")
            .map(|m| interpolate_vars(m, vars))
            .unwrap_or_default();
        let level = fields.get("level").map(String::as_str).unwrap_or("info");

        match level {
            "debug" => tracing::debug!(message = %message, "[process]"),
            "warn" => tracing::warn!(message = %message, "[process]"),
            "error" => tracing::error!(message = %message, "[process]"),
            _ => info!(message = %message, "[process]"),
        }

        Ok(Variables::new())
    }
}

/// Sets one variable per field. A field that is exactly `${name}` copies
/// that variable with its type; anything else becomes an interpolated string.
pub struct SetVariablesService;

#[async_trait]
impl ServiceTask for SetVariablesService {
    fn name(&self) -> &str {
        "set_variables"
    }

    fn description(&self) -> &str {
        "Set instance variables from the step's fields"
    }

    async fn execute(&self, fields: &BTreeMap<String, String>, vars: &Variables) -> Result<Variables> {
        let mut output = Variables::new();
        for (key, template) in fields {
            let value = match whole_reference(template).and_then(|name| vars.get(name)) {
                Some(v) => v.clone(),
                None => Variable::String(interpolate_vars(template, vars)),
            };
            output.insert(key.clone(), value);
        }
        Ok(output)
    }
}

/// `"${name}"` → `Some("name")` when the template is a single reference.
fn whole_reference(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner.trim())
}
