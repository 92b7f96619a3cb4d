use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::error::{EngineError, Result};
use crate::engine::guard::Guard;
use crate::engine::types::{Deployment, NodeKind, ProcessDefinition, ProcessGraph, Transition};

/// Versioned definitions and the deployments that produced them.
pub struct DefinitionRepository {
    inner: RwLock<RepositoryState>,
}

#[derive(Default)]
pub struct RepositoryState {
    definitions: HashMap<String, Arc<ProcessDefinition>>,
    /// Highest version ever handed out per key, including deleted ones.
    versions: HashMap<String, u32>,
    deployments: HashMap<String, Deployment>,
}

impl Default for DefinitionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RepositoryState::default()),
        }
    }

    pub fn restore(
        definitions: Vec<ProcessDefinition>,
        mut versions: HashMap<String, u32>,
        deployments: Vec<Deployment>,
    ) -> Self {
        for def in &definitions {
            let v = versions.entry(def.key.clone()).or_insert(0);
            *v = (*v).max(def.version);
        }
        Self {
            inner: RwLock::new(RepositoryState {
                definitions: definitions
                    .into_iter()
                    .map(|d| (d.id.clone(), Arc::new(d)))
                    .collect(),
                versions,
                deployments: deployments.into_iter().map(|d| (d.id.clone(), d)).collect(),
            }),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, RepositoryState> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, RepositoryState> {
        self.inner.write().await
    }
}

impl RepositoryState {
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn get(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("process definition", id))
    }

    /// Highest deployed version for `key`.
    pub fn latest(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| EngineError::not_found("process definition key", key))
    }

    /// All definitions ordered by key, then version.
    pub fn list(&self) -> Vec<Arc<ProcessDefinition>> {
        let mut defs: Vec<_> = self.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        defs
    }

    /// Hand out the next version for `key`. Versions are never reused.
    pub(crate) fn reserve_version(&mut self, key: &str) -> u32 {
        let v = self.versions.entry(key.to_string()).or_insert(0);
        *v += 1;
        *v
    }

    pub(crate) fn insert(&mut self, definition: Arc<ProcessDefinition>) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.remove(id)
    }

    pub fn deployment(&self, id: &str) -> Result<Deployment> {
        self.deployments
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("deployment", id))
    }

    /// Deployments, oldest first.
    pub fn deployments(&self) -> Vec<Deployment> {
        let mut deps: Vec<_> = self.deployments.values().cloned().collect();
        deps.sort_by(|a, b| a.deployed_at.cmp(&b.deployed_at).then(a.id.cmp(&b.id)));
        deps
    }

    pub(crate) fn insert_deployment(&mut self, deployment: Deployment) {
        self.deployments.insert(deployment.id.clone(), deployment);
    }

    pub(crate) fn remove_deployment(&mut self, id: &str) -> Option<Deployment> {
        self.deployments.remove(id)
    }

    pub(crate) fn deployment_mut(&mut self, id: &str) -> Option<&mut Deployment> {
        self.deployments.get_mut(id)
    }
}

/// Check a graph's structure before it is stored.
pub fn validate(graph: &ProcessGraph) -> Result<()> {
    let invalid = |msg: String| -> Result<()> {
        Err(EngineError::Validation(format!("process '{}': {}", graph.key, msg)))
    };

    if graph.key.trim().is_empty() {
        return Err(EngineError::Validation("process key must not be empty".to_string()));
    }
    if graph.nodes.is_empty() {
        return invalid("no nodes".to_string());
    }

    let mut kinds: HashMap<&str, &NodeKind> = HashMap::new();
    for node in &graph.nodes {
        if node.id.trim().is_empty() {
            return invalid("node with empty id".to_string());
        }
        if kinds.insert(node.id.as_str(), &node.kind).is_some() {
            return invalid(format!("duplicate node id '{}'", node.id));
        }
    }

    let mut flow_ids = HashSet::new();
    for t in &graph.transitions {
        if !flow_ids.insert(t.id.as_str()) {
            return invalid(format!("duplicate transition id '{}'", t.id));
        }
        for end in [&t.source, &t.target] {
            if !kinds.contains_key(end.as_str()) {
                return invalid(format!("transition '{}' references unknown node '{}'", t.id, end));
            }
        }
        if matches!(kinds[t.target.as_str()], NodeKind::Start) {
            return invalid(format!("transition '{}' enters start node '{}'", t.id, t.target));
        }
        if matches!(kinds[t.source.as_str()], NodeKind::End) {
            return invalid(format!("transition '{}' leaves end node '{}'", t.id, t.source));
        }
        if let Some(guard) = &t.guard
            && let Err(e) = Guard::parse(guard)
        {
            return invalid(format!("transition '{}' has an invalid guard: {}", t.id, e));
        }
    }

    let starts: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .map(|n| n.id.as_str())
        .collect();
    if starts.len() != 1 {
        return invalid(format!("expected exactly one start node, found {}", starts.len()));
    }

    for node in &graph.nodes {
        if let NodeKind::ExclusiveGateway { default: Some(default) } = &node.kind
            && !graph
                .transitions
                .iter()
                .any(|t| &t.id == default && t.source == node.id)
        {
            return invalid(format!(
                "default transition '{}' of gateway '{}' is not one of its outgoing transitions",
                default, node.id
            ));
        }
    }

    let forward = reachable(graph, starts.iter().copied(), |t| (&t.source, &t.target));
    if let Some(task) = graph
        .nodes
        .iter()
        .find(|n| n.is_user_task() && !forward.contains(n.id.as_str()))
    {
        return invalid(format!("user task '{}' is not reachable from the start node", task.id));
    }

    let ends = graph
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::End))
        .map(|n| n.id.as_str());
    let backward = reachable(graph, ends, |t| (&t.target, &t.source));
    if let Some(node) = graph.nodes.iter().find(|n| !backward.contains(n.id.as_str())) {
        return invalid(format!("node '{}' has no path to an end node", node.id));
    }

    Ok(())
}

/// Breadth-first walk over transitions; `edge` picks (from, to).
fn reachable<'a, I, F>(graph: &'a ProcessGraph, roots: I, edge: F) -> HashSet<&'a str>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&'a Transition) -> (&'a String, &'a String),
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for root in roots {
        if seen.insert(root) {
            queue.push_back(root);
        }
    }
    while let Some(current) = queue.pop_front() {
        for t in &graph.transitions {
            let (from, to) = edge(t);
            if from == current && seen.insert(to.as_str()) {
                queue.push_back(to.as_str());
            }
        }
    }
    seen
}
