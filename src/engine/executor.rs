use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::error::{EngineError, Result};
use crate::engine::guard::Guard;
use crate::engine::types::*;
use crate::engine::{InstanceEntry, ProcessEngine};

/// One unit of work in an auto-advance run.
enum Step {
    /// A token arrives at a node.
    Enter(Token),
    /// A token leaves the node it is on.
    Leave(Token),
}

impl ProcessEngine {
    /// Start an instance of a definition and run it until every token is
    /// parked at a user task or consumed.
    pub async fn start_instance(
        &self,
        definition_id: &str,
        variables: Variables,
        initiator: Option<&str>,
    ) -> Result<ProcessInstance> {
        let repo = self.repository.read().await;
        let definition = repo.get(definition_id)?;
        self.launch(repo, definition, variables, initiator).await
    }

    /// Start an instance of the latest version of `key`.
    pub async fn start_instance_by_key(
        &self,
        key: &str,
        variables: Variables,
        initiator: Option<&str>,
    ) -> Result<ProcessInstance> {
        let repo = self.repository.read().await;
        let definition = repo.latest(key)?;
        self.launch(repo, definition, variables, initiator).await
    }

    async fn launch(
        &self,
        repo: tokio::sync::RwLockReadGuard<'_, crate::engine::repository::RepositoryState>,
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        initiator: Option<&str>,
    ) -> Result<ProcessInstance> {
        let start = definition
            .start_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| EngineError::InvalidState(format!("definition '{}' has no start node", definition.id)))?;

        let instance = ProcessInstance::new(&definition, variables, initiator.map(str::to_string));
        let instance_id = instance.id.clone();
        let entry = Arc::new(InstanceEntry::new(Some(definition.clone()), instance));

        // Registered before the definition guard is released so a concurrent
        // delete sees the instance.
        let mut inst = entry.state.lock().await;
        self.instances
            .write()
            .await
            .insert(instance_id.clone(), entry.clone());
        drop(repo);

        if let Err(e) = self.store.save_instance(&inst).await {
            self.instances.write().await.remove(&instance_id);
            return Err(e.into());
        }

        self.metrics.instance_started();
        self.history
            .record(HistoryEvent::new(HistoryEventKind::Started, &instance_id).actor(initiator))
            .await;
        info!(
            instance_id = %instance_id,
            definition_id = %definition.id,
            initiator = initiator.unwrap_or(""),
            "Process instance started"
        );

        let token = Token {
            id: Uuid::new_v4().to_string(),
            node_id: start,
        };
        self.run(&definition, &mut inst, vec![Step::Enter(token)], Vec::new())
            .await?;
        Ok(inst.clone())
    }

    /// Snapshot of one instance.
    pub async fn instance(&self, instance_id: &str) -> Result<ProcessInstance> {
        let entry = self.entry(instance_id).await?;
        let inst = entry.state.lock().await;
        Ok(inst.clone())
    }

    /// Administratively terminate a running instance.
    pub async fn terminate_instance(&self, instance_id: &str, reason: &str) -> Result<ProcessInstance> {
        let entry = self.entry(instance_id).await?;
        let mut inst = entry.state.lock().await;
        if !inst.is_running() {
            return Err(EngineError::InvalidState(format!(
                "instance '{}' is already {}",
                instance_id, inst.status
            )));
        }
        let cancelled = self.terminate_locked(&mut inst, reason).await;
        self.persist(&inst, &cancelled).await?;
        Ok(inst.clone())
    }

    /// Move a completed task's token on. Caller holds the instance lock.
    pub(crate) async fn advance(
        &self,
        definition: &ProcessDefinition,
        inst: &mut ProcessInstance,
        task: &Task,
        variables: Variables,
        touched: Vec<Task>,
    ) -> Result<()> {
        inst.variables.extend(variables);
        let pos = inst
            .tokens
            .iter()
            .position(|t| t.id == task.token_id)
            .ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "no active token for task '{}' in instance '{}'",
                    task.id, inst.id
                ))
            })?;
        let token = inst.tokens.remove(pos);
        self.run(definition, inst, vec![Step::Leave(token)], touched).await
    }

    /// Drive the instance, then settle it: complete it when no tokens are
    /// left, terminate it on an execution error, and persist the result.
    async fn run(
        &self,
        definition: &ProcessDefinition,
        inst: &mut ProcessInstance,
        steps: Vec<Step>,
        mut touched: Vec<Task>,
    ) -> Result<()> {
        let outcome = self.drive(definition, inst, steps, &mut touched).await;

        match outcome {
            Ok(()) => {
                if inst.tokens.is_empty() && inst.is_running() {
                    inst.status = InstanceStatus::Completed;
                    inst.ended_at = Some(Utc::now());
                    self.history
                        .record(HistoryEvent::new(HistoryEventKind::Ended, &inst.id))
                        .await;
                    self.metrics.instance_completed();
                    info!(instance_id = %inst.id, "Process instance completed");
                }
                self.persist(inst, &touched).await
            }
            Err(e) => {
                touched.extend(self.terminate_locked(inst, &e.to_string()).await);
                if let Err(store_err) = self.persist(inst, &touched).await {
                    error!(instance_id = %inst.id, error = %store_err, "Failed to persist terminated instance");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        definition: &ProcessDefinition,
        inst: &mut ProcessInstance,
        steps: Vec<Step>,
        touched: &mut Vec<Task>,
    ) -> Result<()> {
        let mut queue: VecDeque<Step> = steps.into();
        let mut entered = 0usize;

        while let Some(step) = queue.pop_front() {
            let token = match step {
                Step::Leave(token) => token,
                Step::Enter(token) => {
                    entered += 1;
                    if entered > self.config.max_auto_steps {
                        return Err(EngineError::InvalidState(format!(
                            "instance '{}' exceeded {} automatic steps",
                            inst.id, self.config.max_auto_steps
                        )));
                    }
                    match self.enter(definition, inst, token, touched).await? {
                        Some(token) => token,
                        None => continue,
                    }
                }
            };

            let node = lookup(definition, &token.node_id)?;
            let targets = self.leave(definition, inst, node).await?;

            let mut token = Some(token);
            for target in targets {
                // The first branch keeps the arriving token's id.
                let id = token
                    .take()
                    .map(|t| t.id)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                queue.push_back(Step::Enter(Token { id, node_id: target }));
            }
        }
        Ok(())
    }

    /// Enter a node. Returns the token when it should leave immediately,
    /// `None` when it was parked or consumed.
    async fn enter(
        &self,
        definition: &ProcessDefinition,
        inst: &mut ProcessInstance,
        token: Token,
        touched: &mut Vec<Task>,
    ) -> Result<Option<Token>> {
        let node = lookup(definition, &token.node_id)?;
        self.fire(definition, inst, node, ListenerPhase::PreEntry);
        self.history
            .record(HistoryEvent::new(HistoryEventKind::ActivityEntered, &inst.id).node(&node.id))
            .await;
        debug!(instance_id = %inst.id, node = %node.id, kind = node.kind.label(), "Entered node");

        let next = match &node.kind {
            NodeKind::UserTask { .. } => {
                let task = self.create_task(definition, inst, node, &token).await;
                touched.push(task);
                inst.tokens.push(token);
                None
            }
            NodeKind::End => {
                self.fire(definition, inst, node, ListenerPhase::PostEntry);
                self.fire(definition, inst, node, ListenerPhase::PreExit);
                self.history
                    .record(HistoryEvent::new(HistoryEventKind::ActivityExited, &inst.id).node(&node.id))
                    .await;
                return Ok(None);
            }
            NodeKind::ServiceStep {
                implementation: Some(name),
                fields,
            } => {
                let service = self.services.get(name).ok_or_else(|| EngineError::ServiceStep {
                    node_id: node.id.clone(),
                    message: format!("no service registered under '{}'", name),
                })?;
                let output = service
                    .execute(fields, &inst.variables)
                    .await
                    .map_err(|e| EngineError::ServiceStep {
                        node_id: node.id.clone(),
                        message: format!("{:#}", e),
                    })?;
                inst.variables.extend(output);
                Some(token)
            }
            NodeKind::Start | NodeKind::ExclusiveGateway { .. } | NodeKind::ServiceStep { .. } => {
                Some(token)
            }
        };

        self.fire(definition, inst, node, ListenerPhase::PostEntry);
        Ok(next)
    }

    /// Exit a node and pick the targets the token moves to.
    async fn leave(
        &self,
        definition: &ProcessDefinition,
        inst: &ProcessInstance,
        node: &Node,
    ) -> Result<Vec<String>> {
        self.fire(definition, inst, node, ListenerPhase::PreExit);
        self.history
            .record(HistoryEvent::new(HistoryEventKind::ActivityExited, &inst.id).node(&node.id))
            .await;
        select_targets(definition, inst, node)
    }

    /// Cancel open tasks and mark the instance terminated. Caller holds the
    /// instance lock and persists the result.
    pub(crate) async fn terminate_locked(&self, inst: &mut ProcessInstance, reason: &str) -> Vec<Task> {
        inst.status = InstanceStatus::Terminated;
        inst.ended_at = Some(Utc::now());
        inst.error = Some(reason.to_string());
        inst.tokens.clear();

        let cancelled = self.tasks.cancel_for_instance(&inst.id).await;
        self.history
            .record(HistoryEvent::new(HistoryEventKind::Terminated, &inst.id).detail(reason))
            .await;
        self.metrics.instance_terminated();
        warn!(instance_id = %inst.id, reason = %reason, cancelled_tasks = cancelled.len(), "Process instance terminated");
        cancelled
    }

    /// Write the instance and the tasks touched alongside it.
    pub(crate) async fn persist(&self, inst: &ProcessInstance, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            // The table holds the latest copy; a task may be touched twice in one run.
            let current = self.tasks.get(&task.id).await.unwrap_or_else(|_| task.clone());
            self.store.save_task(&current).await?;
        }
        self.store.save_instance(inst).await?;
        Ok(())
    }

    fn fire(&self, definition: &ProcessDefinition, inst: &ProcessInstance, node: &Node, phase: ListenerPhase) {
        self.listeners.fire(
            node,
            phase,
            &inst.id,
            &definition.id,
            &inst.variables,
            &self.metrics,
        );
    }
}

fn lookup<'a>(definition: &'a ProcessDefinition, node_id: &str) -> Result<&'a Node> {
    definition.node(node_id).ok_or_else(|| {
        EngineError::InvalidState(format!(
            "node '{}' not found in definition '{}'",
            node_id, definition.id
        ))
    })
}

fn guard_matches(transition: &Transition, variables: &Variables) -> bool {
    let Some(source) = transition.guard.as_deref() else {
        return true;
    };
    match Guard::parse(source) {
        Ok(guard) => guard.evaluate(variables),
        Err(e) => {
            warn!(transition = %transition.id, error = %e, "Unparseable guard treated as false");
            false
        }
    }
}

/// Exclusive gateways take the first matching non-default transition,
/// falling back to the default. Every other node takes all matching
/// transitions.
fn select_targets(definition: &ProcessDefinition, inst: &ProcessInstance, node: &Node) -> Result<Vec<String>> {
    let no_match = || EngineError::NoMatchingTransition {
        instance_id: inst.id.clone(),
        node_id: node.id.clone(),
    };

    match &node.kind {
        NodeKind::End => Ok(Vec::new()),
        NodeKind::ExclusiveGateway { default } => {
            let chosen = definition
                .outgoing(&node.id)
                .filter(|t| default.as_deref() != Some(t.id.as_str()))
                .find(|t| guard_matches(t, &inst.variables))
                .or_else(|| {
                    let default = default.as_deref()?;
                    definition.outgoing(&node.id).find(|t| t.id == default)
                })
                .ok_or_else(no_match)?;
            debug!(instance_id = %inst.id, gateway = %node.id, transition = %chosen.id, "Gateway decision");
            Ok(vec![chosen.target.clone()])
        }
        _ => {
            let targets: Vec<String> = definition
                .outgoing(&node.id)
                .filter(|t| guard_matches(t, &inst.variables))
                .map(|t| t.target.clone())
                .collect();
            if targets.is_empty() {
                return Err(no_match());
            }
            Ok(targets)
        }
    }
}
