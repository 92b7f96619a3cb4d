use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bpmn;
use crate::engine::ProcessEngine;
use crate::engine::error::{EngineError, Result};
use crate::engine::repository::{RepositoryState, validate};
use crate::engine::types::{Deployment, ProcessDefinition, ProcessGraph};

impl ProcessEngine {
    /// Validate and store a graph as the next version of its key.
    pub async fn deploy(&self, graph: ProcessGraph) -> Result<String> {
        validate(&graph)?;
        let mut repo = self.repository.write().await;
        let defs = self.register(&mut repo, vec![graph], None).await?;
        Ok(defs[0].id.clone())
    }

    /// Unpack a package and deploy every process in it as one unit.
    pub async fn deploy_package(&self, bytes: &[u8], name: &str) -> Result<Deployment> {
        let package = bpmn::read_package(bytes)?;
        for graph in &package.graphs {
            validate(graph)?;
        }

        let deployment_id = Uuid::new_v4().to_string();
        let name = if name.trim().is_empty() {
            package
                .resources
                .first()
                .cloned()
                .unwrap_or_else(|| "deployment".to_string())
        } else {
            name.trim().to_string()
        };

        let mut repo = self.repository.write().await;
        let defs = self
            .register(&mut repo, package.graphs, Some(&deployment_id))
            .await?;

        let deployment = Deployment {
            id: deployment_id,
            name,
            deployed_at: Utc::now(),
            resources: package.resources,
            definition_ids: defs.iter().map(|d| d.id.clone()).collect(),
        };
        if let Err(e) = self.store.save_deployment(&deployment).await {
            for def in &defs {
                repo.remove(&def.id);
                let _ = self.store.delete_definition(&def.id).await;
            }
            return Err(e.into());
        }
        repo.insert_deployment(deployment.clone());

        info!(
            deployment_id = %deployment.id,
            name = %deployment.name,
            definitions = deployment.definition_ids.len(),
            "Deployment created"
        );
        Ok(deployment)
    }

    /// Persist validated graphs as new definitions. All or nothing.
    async fn register(
        &self,
        repo: &mut RepositoryState,
        graphs: Vec<ProcessGraph>,
        deployment_id: Option<&str>,
    ) -> Result<Vec<Arc<ProcessDefinition>>> {
        let mut defs: Vec<Arc<ProcessDefinition>> = Vec::with_capacity(graphs.len());
        for graph in graphs {
            let version = repo.reserve_version(&graph.key);
            let def = Arc::new(ProcessDefinition {
                id: format!("{}:{}:{}", graph.key, version, Uuid::new_v4()),
                key: graph.key,
                name: graph.name,
                version,
                deployment_id: deployment_id.map(str::to_string),
                nodes: graph.nodes,
                transitions: graph.transitions,
                deployed_at: Utc::now(),
            });

            let saved = match self.store.save_version(&def.key, version).await {
                Ok(()) => self.store.save_definition(&def).await,
                Err(e) => Err(e),
            };
            if let Err(e) = saved {
                for stored in &defs {
                    if let Err(cleanup) = self.store.delete_definition(&stored.id).await {
                        warn!(definition_id = %stored.id, error = %cleanup, "Failed to roll back definition");
                    }
                }
                return Err(e.into());
            }
            defs.push(def);
        }

        for def in &defs {
            repo.insert(def.clone());
            info!(definition_id = %def.id, key = %def.key, version = def.version, "Definition deployed");
        }
        Ok(defs)
    }

    pub async fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.repository.read().await.get(id)
    }

    pub async fn latest_definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.repository.read().await.latest(key)
    }

    /// All definitions, ordered by key then version.
    pub async fn definitions(&self) -> Vec<Arc<ProcessDefinition>> {
        self.repository.read().await.list()
    }

    pub async fn deployments(&self) -> Vec<Deployment> {
        self.repository.read().await.deployments()
    }

    pub async fn deployment(&self, id: &str) -> Result<Deployment> {
        self.repository.read().await.deployment(id)
    }

    /// Remove a definition. Running instances block the delete unless
    /// `force` is set, in which case they are terminated first.
    pub async fn delete_definition(&self, id: &str, force: bool) -> Result<()> {
        let mut repo = self.repository.write().await;
        let def = repo.get(id)?;
        self.retire(&[def.id.clone()], force).await?;

        self.store.delete_definition(&def.id).await?;
        repo.remove(&def.id);

        if let Some(dep_id) = def.deployment_id.as_deref()
            && let Some(dep) = repo.deployment_mut(dep_id)
        {
            dep.definition_ids.retain(|d| d != &def.id);
            let dep = dep.clone();
            self.store.save_deployment(&dep).await?;
        }
        info!(definition_id = %id, force = force, "Definition deleted");
        Ok(())
    }

    /// Remove a deployment and all its definitions, with the same policy
    /// as [`ProcessEngine::delete_definition`].
    pub async fn delete_deployment(&self, id: &str, cascade: bool) -> Result<Deployment> {
        let mut repo = self.repository.write().await;
        let deployment = repo.deployment(id)?;
        self.retire(&deployment.definition_ids, cascade).await?;

        for def_id in &deployment.definition_ids {
            self.store.delete_definition(def_id).await?;
            repo.remove(def_id);
        }
        self.store.delete_deployment(id).await?;
        repo.remove_deployment(id);

        info!(
            deployment_id = %id,
            definitions = deployment.definition_ids.len(),
            cascade = cascade,
            "Deployment deleted"
        );
        Ok(deployment)
    }

    /// Check or terminate running instances of the given definitions.
    /// Caller holds the repository write guard.
    async fn retire(&self, definition_ids: &[String], force: bool) -> Result<()> {
        let entries: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|e| definition_ids.contains(&e.definition_id))
            .cloned()
            .collect();

        let mut running = Vec::new();
        for entry in &entries {
            if entry.state.lock().await.is_running() {
                running.push(entry.clone());
            }
        }
        if running.is_empty() {
            return Ok(());
        }
        if !force {
            return Err(EngineError::Conflict(format!(
                "{} running instance(s) reference the definition; delete with cascade to terminate them",
                running.len()
            )));
        }

        for entry in running {
            let mut inst = entry.state.lock().await;
            if !inst.is_running() {
                continue;
            }
            let cancelled = self
                .terminate_locked(&mut inst, "definition deleted")
                .await;
            self.persist(&inst, &cancelled).await?;
        }
        Ok(())
    }
}
