use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::bpmn::interpolate::{expand_users, interpolate_vars};
use crate::engine::error::{EngineError, Result};
use crate::engine::types::*;
use crate::engine::{InstanceEntry, ProcessEngine};

/// In-memory task and comment tables.
///
/// Mutations happen under the owning instance's lock; the table locks are
/// only held for the copy in or out.
#[derive(Default)]
pub struct TaskTable {
    tasks: RwLock<HashMap<String, Task>>,
    comments: RwLock<Vec<Comment>>,
}

impl TaskTable {
    pub fn restore(tasks: Vec<Task>, mut comments: Vec<Comment>) -> Self {
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
            comments: RwLock::new(comments),
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    async fn put(&self, task: Task) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    async fn select(&self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| pred(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Cancel every open task of an instance and return them.
    pub(crate) async fn cancel_for_instance(&self, instance_id: &str) -> Vec<Task> {
        let mut tasks = self.tasks.write().await;
        let mut cancelled = Vec::new();
        for task in tasks.values_mut() {
            if task.instance_id == instance_id && task.status.is_open() {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                cancelled.push(task.clone());
            }
        }
        cancelled
    }
}

fn ensure_open(task: &Task) -> Result<()> {
    if task.status.is_open() {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "task '{}' is {}",
            task.id, task.status
        )))
    }
}

impl ProcessEngine {
    /// Create the task for a token arriving at a user-task node.
    pub(crate) async fn create_task(
        &self,
        definition: &ProcessDefinition,
        inst: &ProcessInstance,
        node: &Node,
        token: &Token,
    ) -> Task {
        let (assignee, candidate_users) = match &node.kind {
            NodeKind::UserTask {
                assignee,
                candidate_users,
            } => (
                assignee
                    .as_deref()
                    .map(|expr| interpolate_vars(expr, &inst.variables).trim().to_string())
                    .filter(|a| !a.is_empty()),
                expand_users(candidate_users, &inst.variables),
            ),
            _ => (None, Vec::new()),
        };

        let task = Task {
            id: Uuid::new_v4().to_string(),
            instance_id: inst.id.clone(),
            definition_id: definition.id.clone(),
            node_id: node.id.clone(),
            token_id: token.id.clone(),
            name: node.name.clone(),
            assignee,
            candidate_users,
            status: TaskStatus::Created,
            owner: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.tasks.put(task.clone()).await;
        self.history
            .record(
                HistoryEvent::new(HistoryEventKind::TaskCreated, &inst.id)
                    .node(&node.id)
                    .task(&task.id)
                    .actor(task.assignee.as_deref()),
            )
            .await;
        info!(
            task_id = %task.id,
            instance_id = %inst.id,
            node = %node.id,
            assignee = task.assignee.as_deref().unwrap_or(""),
            candidates = task.candidate_users.len(),
            "Task created"
        );
        task
    }

    /// Instance entry owning a task. The task table is released before the
    /// caller takes the instance lock.
    async fn task_entry(&self, task_id: &str) -> Result<Arc<InstanceEntry>> {
        let instance_id = self.tasks.get(task_id).await?.instance_id;
        self.entry(&instance_id).await
    }

    async fn save_task(&self, task: Task) -> Result<Task> {
        self.tasks.put(task.clone()).await;
        self.store.save_task(&task).await?;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.tasks.get(task_id).await
    }

    /// All tasks, open and finished, oldest first.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.select(|_| true).await
    }

    pub async fn tasks_for_instance(&self, instance_id: &str) -> Vec<Task> {
        self.tasks.select(|t| t.instance_id == instance_id).await
    }

    /// Open tasks assigned to `user`.
    pub async fn tasks_by_assignee(&self, user: &str) -> Vec<Task> {
        self.tasks
            .select(|t| t.status.is_open() && t.assignee.as_deref() == Some(user))
            .await
    }

    /// Open, unassigned tasks `user` may claim.
    pub async fn tasks_by_candidate(&self, user: &str) -> Vec<Task> {
        self.tasks
            .select(|t| t.status.is_open() && t.assignee.is_none() && t.is_candidate(user))
            .await
    }

    /// Assign an unassigned task. Re-assigning the same user is a no-op.
    pub async fn assign(&self, task_id: &str, user: &str) -> Result<Task> {
        let entry = self.task_entry(task_id).await?;
        let _inst = entry.state.lock().await;
        let mut task = self.tasks.get(task_id).await?;
        ensure_open(&task)?;
        match task.assignee.as_deref() {
            Some(current) if current == user => return Ok(task),
            Some(current) => {
                return Err(EngineError::Conflict(format!(
                    "task '{}' is already assigned to '{}'",
                    task_id, current
                )));
            }
            None => {}
        }
        task.assignee = Some(user.to_string());
        let task = self.save_task(task).await?;
        info!(task_id = %task_id, assignee = %user, "Task assigned");
        Ok(task)
    }

    /// Claim an unassigned task as one of its candidates.
    pub async fn claim(&self, task_id: &str, user: &str) -> Result<Task> {
        let entry = self.task_entry(task_id).await?;
        let _inst = entry.state.lock().await;
        let mut task = self.tasks.get(task_id).await?;
        ensure_open(&task)?;
        if let Some(current) = &task.assignee {
            return Err(EngineError::Conflict(format!(
                "task '{}' is already assigned to '{}'",
                task_id, current
            )));
        }
        if !task.is_candidate(user) {
            return Err(EngineError::Conflict(format!(
                "'{}' is not a candidate for task '{}'",
                user, task_id
            )));
        }
        task.assignee = Some(user.to_string());
        task.status = TaskStatus::Claimed;
        let task = self.save_task(task).await?;
        info!(task_id = %task_id, user = %user, "Task claimed");
        Ok(task)
    }

    /// Hand a task to `to` on behalf of `from`, who becomes its owner.
    pub async fn delegate(&self, task_id: &str, from: &str, to: &str) -> Result<Task> {
        let entry = self.task_entry(task_id).await?;
        let _inst = entry.state.lock().await;
        let mut task = self.tasks.get(task_id).await?;
        ensure_open(&task)?;
        if task.status == TaskStatus::Delegated {
            return Err(EngineError::InvalidState(format!(
                "task '{}' is already delegated",
                task_id
            )));
        }
        if let Some(current) = &task.assignee
            && current != from
        {
            return Err(EngineError::Conflict(format!(
                "task '{}' is assigned to '{}', not '{}'",
                task_id, current, from
            )));
        }
        task.owner = Some(from.to_string());
        task.assignee = Some(to.to_string());
        task.status = TaskStatus::Delegated;
        let task = self.save_task(task).await?;
        info!(task_id = %task_id, owner = %from, delegate = %to, "Task delegated");
        Ok(task)
    }

    /// Hand a delegated task back to its owner, merging `variables`.
    pub async fn resolve_task(&self, task_id: &str, variables: Variables) -> Result<Task> {
        let entry = self.task_entry(task_id).await?;
        let mut inst = entry.state.lock().await;
        let task = self.resolve_locked(&mut inst, task_id, variables).await?;
        self.store.save_instance(&inst).await?;
        Ok(task)
    }

    /// Complete a task and advance its instance.
    pub async fn complete(&self, task_id: &str, variables: Variables) -> Result<ProcessInstance> {
        let entry = self.task_entry(task_id).await?;
        let mut inst = entry.state.lock().await;
        self.complete_locked(&entry, &mut inst, task_id, variables)
            .await?;
        Ok(inst.clone())
    }

    /// Resolve a delegated task, then complete it.
    pub async fn complete_delegated(&self, task_id: &str, variables: Variables) -> Result<ProcessInstance> {
        let entry = self.task_entry(task_id).await?;
        let mut inst = entry.state.lock().await;
        self.resolve_locked(&mut inst, task_id, variables).await?;
        self.complete_locked(&entry, &mut inst, task_id, Variables::new())
            .await?;
        Ok(inst.clone())
    }

    /// Transfer an open task to `user`, whoever holds it.
    pub async fn set_assignee(&self, task_id: &str, user: &str) -> Result<Task> {
        let entry = self.task_entry(task_id).await?;
        let _inst = entry.state.lock().await;
        let mut task = self.tasks.get(task_id).await?;
        ensure_open(&task)?;
        let previous = task.assignee.replace(user.to_string());
        let task = self.save_task(task).await?;
        info!(
            task_id = %task_id,
            from = previous.as_deref().unwrap_or(""),
            to = %user,
            "Task assignee changed"
        );
        Ok(task)
    }

    async fn resolve_locked(
        &self,
        inst: &mut ProcessInstance,
        task_id: &str,
        variables: Variables,
    ) -> Result<Task> {
        let mut task = self.tasks.get(task_id).await?;
        if task.status != TaskStatus::Delegated {
            return Err(EngineError::InvalidState(format!(
                "task '{}' is {}, not delegated",
                task_id, task.status
            )));
        }
        task.assignee = task.owner.take();
        task.status = TaskStatus::Resolved;
        inst.variables.extend(variables);
        let task = self.save_task(task).await?;
        info!(task_id = %task_id, assignee = task.assignee.as_deref().unwrap_or(""), "Task resolved");
        Ok(task)
    }

    async fn complete_locked(
        &self,
        entry: &InstanceEntry,
        inst: &mut ProcessInstance,
        task_id: &str,
        variables: Variables,
    ) -> Result<()> {
        let mut task = self.tasks.get(task_id).await?;
        match task.status {
            TaskStatus::Created | TaskStatus::Claimed | TaskStatus::Resolved => {}
            TaskStatus::Delegated => {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is delegated; resolve it before completing",
                    task_id
                )));
            }
            status => {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {}",
                    task_id, status
                )));
            }
        }
        if !inst.is_running() {
            return Err(EngineError::InvalidState(format!(
                "instance '{}' is {}",
                inst.id, inst.status
            )));
        }
        let definition = entry.definition()?.clone();

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        self.tasks.put(task.clone()).await;
        self.history
            .record(
                HistoryEvent::new(HistoryEventKind::TaskCompleted, &inst.id)
                    .node(&task.node_id)
                    .task(&task.id)
                    .actor(task.assignee.as_deref()),
            )
            .await;
        self.metrics.task_completed();
        info!(
            task_id = %task_id,
            instance_id = %inst.id,
            assignee = task.assignee.as_deref().unwrap_or(""),
            "Task completed"
        );

        self.advance(&definition, inst, &task, variables, vec![task.clone()])
            .await
    }

    /// Attach a comment to an open task.
    pub async fn add_comment(
        &self,
        task_id: &str,
        comment_type: Option<&str>,
        message: &str,
    ) -> Result<Comment> {
        if message.trim().is_empty() {
            return Err(EngineError::Validation(
                "comment message must not be empty".to_string(),
            ));
        }
        let entry = self.task_entry(task_id).await?;
        let _inst = entry.state.lock().await;
        let task = self.tasks.get(task_id).await?;
        ensure_open(&task)?;

        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            instance_id: task.instance_id.clone(),
            comment_type: comment_type.map(str::to_string),
            message: message.to_string(),
            created_at: Utc::now(),
        };
        self.store.append_comment(&comment).await?;
        self.tasks.comments.write().await.push(comment.clone());
        Ok(comment)
    }

    /// Comments on a task in creation order, optionally of one type.
    pub async fn comments(&self, task_id: &str, comment_type: Option<&str>) -> Result<Vec<Comment>> {
        self.tasks.get(task_id).await?;
        Ok(self
            .tasks
            .comments
            .read()
            .await
            .iter()
            .filter(|c| c.task_id == task_id)
            .filter(|c| comment_type.is_none_or(|t| c.comment_type.as_deref() == Some(t)))
            .cloned()
            .collect())
    }
}
