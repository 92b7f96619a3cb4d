use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, Result};

/// Instance variables: string keys mapped to typed values.
pub type Variables = HashMap<String, Variable>;

/// A single process variable.
///
/// Serialized untagged, so the JSON form is the plain value. Strings in
/// RFC 3339 form read back as timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Bool(bool),
    Number(serde_json::Number),
    Timestamp(DateTime<Utc>),
    String(String),
    Structured(serde_json::Value),
}

impl Variable {
    /// Convert a boundary JSON value. `null` is rejected.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Err(EngineError::Validation(
                "null is not a valid variable value".to_string(),
            )),
            serde_json::Value::Bool(b) => Ok(Variable::Bool(b)),
            serde_json::Value::Number(n) => Ok(Variable::Number(n)),
            serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
                Ok(ts) => Ok(Variable::Timestamp(ts.with_timezone(&Utc))),
                Err(_) => Ok(Variable::String(s)),
            },
            other => Ok(Variable::Structured(other)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Variable::Bool(b) => serde_json::Value::Bool(*b),
            Variable::Number(n) => serde_json::Value::Number(n.clone()),
            Variable::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Variable::String(s) => serde_json::Value::String(s.clone()),
            Variable::Structured(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variable::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Render the value as text, the way it appears in interpolated expressions.
    pub fn to_text(&self) -> String {
        match self {
            Variable::Bool(b) => b.to_string(),
            Variable::Number(n) => n.to_string(),
            Variable::Timestamp(ts) => ts.to_rfc3339(),
            Variable::String(s) => s.clone(),
            Variable::Structured(serde_json::Value::String(s)) => s.clone(),
            Variable::Structured(v) => v.to_string(),
        }
    }
}

impl From<bool> for Variable {
    fn from(v: bool) -> Self {
        Variable::Bool(v)
    }
}

impl From<i64> for Variable {
    fn from(v: i64) -> Self {
        Variable::Number(v.into())
    }
}

impl From<i32> for Variable {
    fn from(v: i32) -> Self {
        Variable::Number(v.into())
    }
}

impl From<f64> for Variable {
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(Variable::Number)
            .unwrap_or_else(|| Variable::String(v.to_string()))
    }
}

impl From<&str> for Variable {
    fn from(v: &str) -> Self {
        Variable::String(v.to_string())
    }
}

impl From<String> for Variable {
    fn from(v: String) -> Self {
        Variable::String(v)
    }
}

impl From<DateTime<Utc>> for Variable {
    fn from(v: DateTime<Utc>) -> Self {
        Variable::Timestamp(v)
    }
}

/// Validate and convert a JSON object received at the API boundary.
pub fn variables_from_json(map: serde_json::Map<String, serde_json::Value>) -> Result<Variables> {
    let mut vars = Variables::with_capacity(map.len());
    for (key, value) in map {
        if key.trim().is_empty() {
            return Err(EngineError::Validation(
                "variable names must not be empty".to_string(),
            ));
        }
        let var = Variable::from_json(value)
            .map_err(|e| EngineError::Validation(format!("variable '{}': {}", key, e)))?;
        vars.insert(key, var);
    }
    Ok(vars)
}

/// Build a variable map from `(name, value)` pairs.
pub fn vars<K, V, I>(pairs: I) -> Variables
where
    K: Into<String>,
    V: Into<Variable>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// --- Definitions ---

/// When a listener fires relative to a node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPhase {
    PreEntry,
    PostEntry,
    PreExit,
}

impl std::fmt::Display for ListenerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerPhase::PreEntry => write!(f, "pre_entry"),
            ListenerPhase::PostEntry => write!(f, "post_entry"),
            ListenerPhase::PreExit => write!(f, "pre_exit"),
        }
    }
}

/// A named listener declared on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerHook {
    pub phase: ListenerPhase,
    pub listener: String,
}

/// Node behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    UserTask {
        /// Assignee expression, e.g. `${username}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        /// Candidate expressions; each may expand to a comma-separated list.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidate_users: Vec<String>,
    },
    ExclusiveGateway {
        /// Transition taken when no other outgoing guard matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    ServiceStep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        implementation: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, String>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::UserTask { .. } => "user_task",
            NodeKind::ExclusiveGateway { .. } => "exclusive_gateway",
            NodeKind::ServiceStep { .. } => "service_step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerHook>,
}

impl Node {
    pub fn new(id: &str, kind: NodeKind) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            listeners: Vec::new(),
        }
    }

    pub fn start(id: &str) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: &str) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn user_task(id: &str, name: &str) -> Self {
        Self::new(
            id,
            NodeKind::UserTask {
                assignee: None,
                candidate_users: Vec::new(),
            },
        )
        .named(name)
    }

    pub fn gateway(id: &str) -> Self {
        Self::new(id, NodeKind::ExclusiveGateway { default: None })
    }

    pub fn service(id: &str, implementation: &str) -> Self {
        Self::new(
            id,
            NodeKind::ServiceStep {
                implementation: Some(implementation.to_string()),
                fields: BTreeMap::new(),
            },
        )
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_assignee(mut self, expr: &str) -> Self {
        if let NodeKind::UserTask { assignee, .. } = &mut self.kind {
            *assignee = Some(expr.to_string());
        }
        self
    }

    pub fn with_candidates<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let NodeKind::UserTask {
            candidate_users, ..
        } = &mut self.kind
        {
            candidate_users.extend(users.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_default(mut self, transition_id: &str) -> Self {
        if let NodeKind::ExclusiveGateway { default } = &mut self.kind {
            *default = Some(transition_id.to_string());
        }
        self
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        if let NodeKind::ServiceStep { fields, .. } = &mut self.kind {
            fields.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn with_listener(mut self, phase: ListenerPhase, listener: &str) -> Self {
        self.listeners.push(ListenerHook {
            phase,
            listener: listener.to_string(),
        });
        self
    }

    pub fn is_user_task(&self) -> bool {
        matches!(self.kind, NodeKind::UserTask { .. })
    }

    /// Name for display: the node name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

impl Transition {
    pub fn new(id: &str, source: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            name: None,
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: &str) -> Self {
        self.guard = Some(guard.to_string());
        self
    }
}

/// An undeployed process graph, the input to `deploy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub key: String,
    pub name: String,
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
}

impl ProcessGraph {
    pub fn new(key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            nodes: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an unguarded transition with a generated id.
    pub fn transition(self, source: &str, target: &str) -> Self {
        let id = format!("flow_{}", self.transitions.len() + 1);
        self.flow(Transition::new(&id, source, target))
    }

    /// Add a guarded transition with a generated id.
    pub fn guarded(self, source: &str, target: &str, guard: &str) -> Self {
        let id = format!("flow_{}", self.transitions.len() + 1);
        self.flow(Transition::new(&id, source, target).with_guard(guard))
    }

    pub fn flow(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }
}

/// A deployed, immutable process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub key: String,
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
    pub deployed_at: DateTime<Utc>,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Outgoing transitions of a node in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.source == node_id)
    }

    /// The graph this definition was deployed from.
    pub fn graph(&self) -> ProcessGraph {
        ProcessGraph {
            key: self.key.clone(),
            name: self.name.clone(),
            nodes: self.nodes.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

/// One uploaded package and the definitions it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub deployed_at: DateTime<Utc>,
    pub resources: Vec<String>,
    pub definition_ids: Vec<String>,
}

// --- Runtime ---

/// Status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Completed,
    Terminated,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Marker of an execution position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_key: String,
    pub definition_version: u32,
    /// Tokens parked at user tasks.
    pub tokens: Vec<Token>,
    pub variables: Variables,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessInstance {
    pub fn new(definition: &ProcessDefinition, variables: Variables, initiator: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_key: definition.key.clone(),
            definition_version: definition.version,
            tokens: Vec::new(),
            variables,
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            initiator,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn active_node_ids(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.node_id.as_str()).collect()
    }
}

/// Status of a human task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Claimed,
    Delegated,
    Resolved,
    Completed,
    /// The owning instance was terminated.
    Cancelled,
}

impl TaskStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Claimed => write!(f, "claimed"),
            TaskStatus::Delegated => write!(f, "delegated"),
            TaskStatus::Resolved => write!(f, "resolved"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instance_id: String,
    pub definition_id: String,
    pub node_id: String,
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    pub status: TaskStatus,
    /// Original assignee while the task is delegated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_candidate(&self, user: &str) -> bool {
        self.candidate_users.iter().any(|c| c == user)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub instance_id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub comment_type: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    Started,
    ActivityEntered,
    ActivityExited,
    TaskCreated,
    TaskCompleted,
    Ended,
    Terminated,
}

impl std::fmt::Display for HistoryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HistoryEventKind::Started => "started",
            HistoryEventKind::ActivityEntered => "activity_entered",
            HistoryEventKind::ActivityExited => "activity_exited",
            HistoryEventKind::TaskCreated => "task_created",
            HistoryEventKind::TaskCompleted => "task_completed",
            HistoryEventKind::Ended => "ended",
            HistoryEventKind::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HistoryEventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "started" => Ok(HistoryEventKind::Started),
            "activity_entered" => Ok(HistoryEventKind::ActivityEntered),
            "activity_exited" => Ok(HistoryEventKind::ActivityExited),
            "task_created" => Ok(HistoryEventKind::TaskCreated),
            "task_completed" => Ok(HistoryEventKind::TaskCompleted),
            "ended" => Ok(HistoryEventKind::Ended),
            "terminated" => Ok(HistoryEventKind::Terminated),
            _ => Err(format!(
                "Invalid event kind '{}'. Use: started, activity_entered, activity_exited, \
                 task_created, task_completed, ended, terminated",
                s
            )),
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: u64,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub kind: HistoryEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEvent {
    /// A new event; `seq` and `timestamp` are assigned by the recorder.
    pub fn new(kind: HistoryEventKind, instance_id: &str) -> Self {
        Self {
            seq: 0,
            instance_id: instance_id.to_string(),
            node_id: None,
            task_id: None,
            kind,
            timestamp: Utc::now(),
            actor: None,
            detail: None,
        }
    }

    pub fn node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A node visit folded from entered/exited history events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub instance_id: String,
    pub node_id: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_conversion_types_values() {
        let json = serde_json::json!({
            "approved": true,
            "days": 3,
            "reason": "holiday",
            "from": "2024-07-15T09:00:00Z",
            "meta": { "team": "ops" }
        });
        let serde_json::Value::Object(map) = json else {
            unreachable!()
        };
        let vars = variables_from_json(map).unwrap();

        assert_eq!(vars["approved"], Variable::Bool(true));
        assert_eq!(vars["days"].as_f64(), Some(3.0));
        assert_eq!(vars["reason"], Variable::String("holiday".into()));
        assert!(matches!(vars["from"], Variable::Timestamp(_)));
        assert!(matches!(vars["meta"], Variable::Structured(_)));
    }

    #[test]
    fn boundary_conversion_rejects_null() {
        let mut map = serde_json::Map::new();
        map.insert("x".into(), serde_json::Value::Null);
        let err = variables_from_json(map).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn variable_json_form_is_plain() {
        let v: Variables = vars([("n", Variable::from(7)), ("s", Variable::from("x"))]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["n"], serde_json::json!(7));
        assert_eq!(json["s"], serde_json::json!("x"));

        let back: Variables = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn node_serializes_kind_inline() {
        let node = Node::user_task("approve", "Approve").with_assignee("${username}");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "user_task");
        assert_eq!(json["assignee"], "${username}");

        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn event_kind_parses_display_form() {
        for kind in [
            HistoryEventKind::Started,
            HistoryEventKind::ActivityEntered,
            HistoryEventKind::TaskCompleted,
            HistoryEventKind::Terminated,
        ] {
            assert_eq!(kind.to_string().parse::<HistoryEventKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<HistoryEventKind>().is_err());
    }
}
