//! Integration tests for the execution engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;

use ironbpm::engine::types::*;
use ironbpm::engine::{EngineError, ExecutionListener, ListenerEvent, ListenerRegistry, ProcessEngine};
use ironbpm::services::{ServiceRegistry, ServiceTask};
use ironbpm::storage::memory_store::MemoryStateStore;

async fn engine() -> ProcessEngine {
    ProcessEngine::open(Arc::new(MemoryStateStore::new()))
        .await
        .unwrap()
}

fn sequential() -> ProcessGraph {
    ProcessGraph::new("two_step", "Two step approval")
        .node(Node::start("start"))
        .node(Node::user_task("first", "First approval").with_assignee("${username}"))
        .node(Node::user_task("second", "Second approval").with_assignee("boss"))
        .node(Node::end("end"))
        .transition("start", "first")
        .transition("first", "second")
        .transition("second", "end")
}

fn leave() -> ProcessGraph {
    ProcessGraph::new("leave", "Leave")
        .node(Node::start("start"))
        .node(Node::user_task("apply", "Apply").with_assignee("${username}"))
        .node(Node::gateway("gw"))
        .node(Node::user_task("low", "Team lead").with_assignee("lead"))
        .node(Node::user_task("high", "Director").with_assignee("director"))
        .node(Node::end("end"))
        .transition("start", "apply")
        .transition("apply", "gw")
        .guarded("gw", "low", "${day < 10}")
        .guarded("gw", "high", "${day >= 10}")
        .transition("low", "end")
        .transition("high", "end")
}

fn pass_through(id: &str) -> Node {
    Node::new(
        id,
        NodeKind::ServiceStep {
            implementation: None,
            fields: BTreeMap::new(),
        },
    )
}

async fn only_task(engine: &ProcessEngine, instance_id: &str) -> Task {
    let open: Vec<Task> = engine
        .tasks_for_instance(instance_id)
        .await
        .into_iter()
        .filter(|t| t.status.is_open())
        .collect();
    assert_eq!(open.len(), 1, "expected exactly one open task: {:?}", open);
    open.into_iter().next().unwrap()
}

// --- Sequential approval ---

#[tokio::test]
async fn sequential_approval_runs_to_completion() {
    let engine = engine().await;
    let id = engine.deploy(sequential()).await.unwrap();

    let inst = engine
        .start_instance(&id, vars([("username", "alice")]), Some("alice"))
        .await
        .unwrap();
    assert_eq!(inst.status, InstanceStatus::Running);
    assert_eq!(inst.active_node_ids(), vec!["first"]);
    assert_eq!(inst.initiator.as_deref(), Some("alice"));

    let first = only_task(&engine, &inst.id).await;
    assert_eq!(first.node_id, "first");
    assert_eq!(first.assignee.as_deref(), Some("alice"));

    let inst = engine
        .complete(&first.id, vars([("comment", "fine")]))
        .await
        .unwrap();
    assert_eq!(inst.active_node_ids(), vec!["second"]);

    let second = only_task(&engine, &inst.id).await;
    assert_eq!(second.assignee.as_deref(), Some("boss"));

    let inst = engine.complete(&second.id, Variables::new()).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
    assert!(inst.tokens.is_empty());
    assert!(inst.ended_at.is_some());
    assert_eq!(inst.variables["comment"], Variable::from("fine"));

    let metrics = engine.metrics();
    assert_eq!(metrics.instances_started, 1);
    assert_eq!(metrics.instances_completed, 1);
    assert_eq!(metrics.tasks_completed, 2);
}

#[tokio::test]
async fn start_by_key_uses_latest_version() {
    let engine = engine().await;
    engine.deploy(sequential()).await.unwrap();
    let v2 = engine.deploy(sequential()).await.unwrap();

    let inst = engine
        .start_instance_by_key("two_step", vars([("username", "a")]), None)
        .await
        .unwrap();
    assert_eq!(inst.definition_id, v2);
    assert_eq!(inst.definition_version, 2);
}

#[tokio::test]
async fn start_without_user_tasks_completes_immediately() {
    let engine = engine().await;
    let graph = ProcessGraph::new("auto", "Auto")
        .node(Node::start("s"))
        .node(Node::service("stamp", "set_variables").with_field("result", "done by ${who}"))
        .node(Node::end("e"))
        .transition("s", "stamp")
        .transition("stamp", "e");
    let id = engine.deploy(graph).await.unwrap();

    let inst = engine
        .start_instance(&id, vars([("who", "robot")]), None)
        .await
        .unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
    assert_eq!(inst.variables["result"], Variable::from("done by robot"));
}

// --- Exclusive gateway ---

#[tokio::test]
async fn gateway_routes_short_leave_to_lead() {
    let engine = engine().await;
    let id = engine.deploy(leave()).await.unwrap();
    let inst = engine
        .start_instance(&id, vars([("username", "emp")]), None)
        .await
        .unwrap();

    let apply = only_task(&engine, &inst.id).await;
    engine.complete(&apply.id, vars([("day", 8)])).await.unwrap();

    let next = only_task(&engine, &inst.id).await;
    assert_eq!(next.node_id, "low");
    assert_eq!(next.assignee.as_deref(), Some("lead"));
}

#[tokio::test]
async fn gateway_routes_long_leave_to_director() {
    let engine = engine().await;
    let id = engine.deploy(leave()).await.unwrap();
    let inst = engine
        .start_instance(&id, vars([("username", "emp")]), None)
        .await
        .unwrap();

    let apply = only_task(&engine, &inst.id).await;
    engine.complete(&apply.id, vars([("day", 12)])).await.unwrap();

    let next = only_task(&engine, &inst.id).await;
    assert_eq!(next.node_id, "high");
}

#[tokio::test]
async fn gateway_without_match_terminates_instance() {
    let engine = engine().await;
    let id = engine.deploy(leave()).await.unwrap();
    let inst = engine
        .start_instance(&id, vars([("username", "emp")]), None)
        .await
        .unwrap();

    let apply = only_task(&engine, &inst.id).await;
    let err = engine
        .complete(&apply.id, Variables::new())
        .await
        .unwrap_err();
    match err {
        EngineError::NoMatchingTransition {
            instance_id,
            node_id,
        } => {
            assert_eq!(instance_id, inst.id);
            assert_eq!(node_id, "gw");
        }
        other => panic!("expected NoMatchingTransition, got {:?}", other),
    }

    let inst = engine.instance(&inst.id).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Terminated);
    assert!(inst.error.as_deref().unwrap_or("").contains("gw"));
    assert!(
        engine
            .tasks_for_instance(&inst.id)
            .await
            .iter()
            .all(|t| !t.status.is_open())
    );
    assert_eq!(engine.metrics().instances_terminated, 1);
}

#[tokio::test]
async fn gateway_default_taken_when_nothing_matches() {
    let engine = engine().await;
    let graph = ProcessGraph::new("d", "Default")
        .node(Node::start("s"))
        .node(Node::gateway("gw").with_default("fallback"))
        .node(Node::user_task("special", "Special").with_assignee("x"))
        .node(Node::user_task("normal", "Normal").with_assignee("x"))
        .node(Node::end("e"))
        .transition("s", "gw")
        .flow(Transition::new("fallback", "gw", "normal"))
        .guarded("gw", "special", "${vip == true}")
        .transition("special", "e")
        .transition("normal", "e");
    let id = engine.deploy(graph).await.unwrap();

    let plain = engine.start_instance(&id, Variables::new(), None).await.unwrap();
    assert_eq!(plain.active_node_ids(), vec!["normal"]);

    let vip = engine
        .start_instance(&id, vars([("vip", true)]), None)
        .await
        .unwrap();
    assert_eq!(vip.active_node_ids(), vec!["special"]);
}

// --- Forks ---

#[tokio::test]
async fn unguarded_transitions_fork_tokens() {
    let engine = engine().await;
    let graph = ProcessGraph::new("fork", "Fork")
        .node(Node::start("s"))
        .node(Node::user_task("legal", "Legal").with_assignee("l"))
        .node(Node::user_task("finance", "Finance").with_assignee("f"))
        .node(Node::end("e"))
        .transition("s", "legal")
        .transition("s", "finance")
        .transition("legal", "e")
        .transition("finance", "e");
    let id = engine.deploy(graph).await.unwrap();

    let inst = engine.start_instance(&id, Variables::new(), None).await.unwrap();
    let mut active = inst.active_node_ids();
    active.sort();
    assert_eq!(active, vec!["finance", "legal"]);
    assert_ne!(inst.tokens[0].id, inst.tokens[1].id);

    let legal = engine.tasks_by_assignee("l").await.remove(0);
    let after_legal = engine.complete(&legal.id, Variables::new()).await.unwrap();
    assert_eq!(after_legal.status, InstanceStatus::Running);
    assert_eq!(after_legal.active_node_ids(), vec!["finance"]);

    let finance = engine.tasks_by_assignee("f").await.remove(0);
    let done = engine.complete(&finance.id, Variables::new()).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

// --- Service steps ---

struct FailingService;

#[async_trait]
impl ServiceTask for FailingService {
    fn name(&self) -> &str {
        "charge_card"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(
        &self,
        _fields: &BTreeMap<String, String>,
        _vars: &Variables,
    ) -> anyhow::Result<Variables> {
        bail!("card declined")
    }
}

#[tokio::test]
async fn failing_service_step_terminates_instance() {
    let mut services = ServiceRegistry::with_builtins();
    services.register(Arc::new(FailingService));
    let engine = ProcessEngine::builder(Arc::new(MemoryStateStore::new()))
        .services(services)
        .open()
        .await
        .unwrap();

    let graph = ProcessGraph::new("pay", "Pay")
        .node(Node::start("s"))
        .node(Node::service("charge", "charge_card"))
        .node(Node::end("e"))
        .transition("s", "charge")
        .transition("charge", "e");
    let id = engine.deploy(graph).await.unwrap();

    let err = engine
        .start_instance(&id, Variables::new(), None)
        .await
        .unwrap_err();
    match &err {
        EngineError::ServiceStep { node_id, message } => {
            assert_eq!(node_id, "charge");
            assert!(message.contains("card declined"));
        }
        other => panic!("expected ServiceStep, got {:?}", other),
    }

    let instances = engine.historic_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Terminated);
}

#[tokio::test]
async fn unknown_service_is_a_service_step_error() {
    let engine = engine().await;
    let graph = ProcessGraph::new("p", "P")
        .node(Node::start("s"))
        .node(Node::service("x", "does_not_exist"))
        .node(Node::end("e"))
        .transition("s", "x")
        .transition("x", "e");
    let id = engine.deploy(graph).await.unwrap();

    let err = engine
        .start_instance(&id, Variables::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SERVICE_STEP_FAILED");
}

#[tokio::test]
async fn runaway_loop_hits_step_ceiling() {
    let engine = ProcessEngine::builder(Arc::new(MemoryStateStore::new()))
        .max_auto_steps(50)
        .open()
        .await
        .unwrap();

    let graph = ProcessGraph::new("loop", "Loop")
        .node(Node::start("s"))
        .node(pass_through("a"))
        .node(pass_through("b"))
        .node(Node::end("e"))
        .transition("s", "a")
        .transition("a", "b")
        .transition("b", "a")
        .guarded("b", "e", "${done == true}");
    let id = engine.deploy(graph).await.unwrap();

    let err = engine
        .start_instance(&id, Variables::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert!(err.to_string().contains("50"));
    assert_eq!(
        engine.historic_instances().await[0].status,
        InstanceStatus::Terminated
    );
}

// --- Listeners ---

/// Records `node:phase` for every notification.
struct Trace(Arc<Mutex<Vec<String>>>);

impl ExecutionListener for Trace {
    fn notify(&self, event: &ListenerEvent<'_>) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap()
            .push(format!("{}:{}", event.node_id, event.phase));
        Ok(())
    }
}

/// Records the `approved` variable it sees.
struct ApprovalWatcher(Arc<Mutex<Vec<String>>>);

impl ExecutionListener for ApprovalWatcher {
    fn notify(&self, event: &ListenerEvent<'_>) -> anyhow::Result<()> {
        let approved = event.variables.get("approved").cloned();
        self.0
            .lock()
            .unwrap()
            .push(format!("attached:{:?}", approved));
        Ok(())
    }
}

struct Broken;

impl ExecutionListener for Broken {
    fn notify(&self, _event: &ListenerEvent<'_>) -> anyhow::Result<()> {
        bail!("listener exploded")
    }
}

struct Panicky;

impl ExecutionListener for Panicky {
    fn notify(&self, _event: &ListenerEvent<'_>) -> anyhow::Result<()> {
        panic!("listener panicked")
    }
}

#[tokio::test]
async fn listeners_fire_in_phase_order() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let listeners = ListenerRegistry::with_builtins();
    listeners.register("trace", Arc::new(Trace(seen.clone())));
    listeners.attach(
        "approve",
        ListenerPhase::PreExit,
        Arc::new(ApprovalWatcher(seen.clone())),
    );

    let engine = ProcessEngine::builder(Arc::new(MemoryStateStore::new()))
        .listeners(listeners)
        .open()
        .await
        .unwrap();

    let graph = ProcessGraph::new("l", "Listeners")
        .node(Node::start("start"))
        .node(
            Node::user_task("approve", "Approve")
                .with_assignee("x")
                .with_listener(ListenerPhase::PreEntry, "trace")
                .with_listener(ListenerPhase::PostEntry, "trace")
                .with_listener(ListenerPhase::PreExit, "trace"),
        )
        .node(Node::end("end"))
        .transition("start", "approve")
        .transition("approve", "end");
    let id = engine.deploy(graph).await.unwrap();

    let inst = engine.start_instance(&id, Variables::new(), None).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["approve:pre_entry", "approve:post_entry"]
    );

    let task = only_task(&engine, &inst.id).await;
    engine
        .complete(&task.id, vars([("approved", true)]))
        .await
        .unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "approve:pre_entry",
            "approve:post_entry",
            "approve:pre_exit",
            "attached:Some(Bool(true))",
        ]
    );
}

#[tokio::test]
async fn failing_listeners_do_not_abort_execution() {
    let engine = engine().await;
    engine.listeners().register("broken", Arc::new(Broken));
    engine.listeners().register("panicky", Arc::new(Panicky));

    let graph = ProcessGraph::new("l", "Listeners")
        .node(
            Node::start("start")
                .with_listener(ListenerPhase::PreEntry, "broken")
                .with_listener(ListenerPhase::PreExit, "panicky")
                .with_listener(ListenerPhase::PreExit, "not_registered"),
        )
        .node(Node::end("end"))
        .transition("start", "end");
    let id = engine.deploy(graph).await.unwrap();

    let inst = engine.start_instance(&id, Variables::new(), None).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Completed);
    assert_eq!(engine.metrics().listener_failures, 3);
}

// --- Termination ---

#[tokio::test]
async fn terminate_instance_cancels_tasks() {
    let engine = engine().await;
    let id = engine.deploy(sequential()).await.unwrap();
    let inst = engine
        .start_instance(&id, vars([("username", "alice")]), None)
        .await
        .unwrap();
    let task = only_task(&engine, &inst.id).await;

    let terminated = engine
        .terminate_instance(&inst.id, "withdrawn")
        .await
        .unwrap();
    assert_eq!(terminated.status, InstanceStatus::Terminated);
    assert_eq!(terminated.error.as_deref(), Some("withdrawn"));
    assert!(terminated.tokens.is_empty());

    let task = engine.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    let err = engine.complete(&task.id, Variables::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = engine
        .terminate_instance(&inst.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let engine = engine().await;
    let err = engine.instance("missing").await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}
