//! Tests for deployment packages: BPMN XML parsing and zip archives.

use std::io::{Cursor, Write};
use std::sync::Arc;

use ironbpm::bpmn::{parse_definitions, read_package};
use ironbpm::engine::types::*;
use ironbpm::engine::{EngineError, ProcessEngine};
use ironbpm::storage::memory_store::MemoryStateStore;

const LEAVE_BPMN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL"
             xmlns:activiti="http://activiti.org/bpmn"
             xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
             xmlns:bpmndi="http://www.omg.org/spec/BPMN/20100524/DI"
             targetNamespace="leave">
  <process id="leave" name="Leave request" isExecutable="true">
    <documentation>Ask for days off</documentation>
    <startEvent id="start" name="Start"/>
    <userTask id="apply" name="Apply" activiti:assignee="${username}">
      <extensionElements>
        <activiti:executionListener event="start" delegateExpression="${auditListener}"/>
        <activiti:executionListener event="end" class="com.example.HrListener"/>
      </extensionElements>
    </userTask>
    <exclusiveGateway id="gw" name="How long?" default="f4"/>
    <userTask id="lead" name="Team lead" activiti:candidateUsers="alice, bob"/>
    <userTask id="hr" name="HR" activiti:assignee="carol"/>
    <serviceTask id="stamp" name="Stamp" activiti:class="set_variables">
      <extensionElements>
        <activiti:field name="status" stringValue="approved"/>
        <activiti:field name="note">
          <activiti:string><![CDATA[approved for ${username}]]></activiti:string>
        </activiti:field>
      </extensionElements>
    </serviceTask>
    <endEvent id="end"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="apply"/>
    <sequenceFlow id="f2" sourceRef="apply" targetRef="gw"/>
    <sequenceFlow id="f3" name="short" sourceRef="gw" targetRef="lead">
      <conditionExpression xsi:type="tFormalExpression"><![CDATA[${day < 10}]]></conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f4" name="long" sourceRef="gw" targetRef="hr">
      <conditionExpression xsi:type="tFormalExpression">${day &gt;= 10}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f5" sourceRef="lead" targetRef="stamp"/>
    <sequenceFlow id="f6" sourceRef="hr" targetRef="stamp"/>
    <sequenceFlow id="f7" sourceRef="stamp" targetRef="end"/>
  </process>
  <bpmndi:BPMNDiagram id="diagram">
    <bpmndi:BPMNPlane id="plane" bpmnElement="leave"/>
  </bpmndi:BPMNDiagram>
</definitions>
"#;

fn zip_package(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn engine() -> ProcessEngine {
    ProcessEngine::open(Arc::new(MemoryStateStore::new()))
        .await
        .unwrap()
}

// --- Parsing ---

#[test]
fn parses_nodes_flows_and_extensions() {
    let graphs = parse_definitions(LEAVE_BPMN.as_bytes(), "leave.bpmn").unwrap();
    assert_eq!(graphs.len(), 1);
    let g = &graphs[0];

    assert_eq!(g.key, "leave");
    assert_eq!(g.name, "Leave request");
    let ids: Vec<&str> = g.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["start", "apply", "gw", "lead", "hr", "stamp", "end"]);
    assert_eq!(g.transitions.len(), 7);

    let apply = &g.nodes[1];
    assert_eq!(apply.name.as_deref(), Some("Apply"));
    assert_eq!(
        apply.kind,
        NodeKind::UserTask {
            assignee: Some("${username}".to_string()),
            candidate_users: vec![],
        }
    );
    assert_eq!(
        apply.listeners,
        vec![
            ListenerHook {
                phase: ListenerPhase::PreEntry,
                listener: "auditListener".to_string(),
            },
            ListenerHook {
                phase: ListenerPhase::PreExit,
                listener: "com.example.HrListener".to_string(),
            },
        ]
    );

    assert_eq!(
        g.nodes[2].kind,
        NodeKind::ExclusiveGateway {
            default: Some("f4".to_string())
        }
    );

    match &g.nodes[5].kind {
        NodeKind::ServiceStep {
            implementation,
            fields,
        } => {
            assert_eq!(implementation.as_deref(), Some("set_variables"));
            assert_eq!(fields["status"], "approved");
            assert_eq!(fields["note"], "approved for ${username}");
        }
        other => panic!("unexpected kind {:?}", other),
    }
}

#[test]
fn reads_cdata_and_escaped_conditions() {
    let graphs = parse_definitions(LEAVE_BPMN.as_bytes(), "leave.bpmn").unwrap();
    let flows = &graphs[0].transitions;

    let f3 = flows.iter().find(|t| t.id == "f3").unwrap();
    assert_eq!(f3.guard.as_deref(), Some("${day < 10}"));
    assert_eq!(f3.name.as_deref(), Some("short"));

    let f4 = flows.iter().find(|t| t.id == "f4").unwrap();
    assert_eq!(f4.guard.as_deref(), Some("${day >= 10}"));

    let f1 = flows.iter().find(|t| t.id == "f1").unwrap();
    assert!(f1.guard.is_none());
}

#[test]
fn every_process_becomes_a_graph() {
    let xml = r#"<definitions>
        <process id="one"><startEvent id="s"/><endEvent id="e"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="e"/></process>
        <process id="two" name="Two"><startEvent id="s"/><endEvent id="e"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="e"/></process>
    </definitions>"#;
    let graphs = parse_definitions(xml.as_bytes(), "multi.bpmn").unwrap();
    let keys: Vec<&str> = graphs.iter().map(|g| g.key.as_str()).collect();
    assert_eq!(keys, vec!["one", "two"]);
    assert_eq!(graphs[0].name, "one");
}

#[test]
fn malformed_xml_is_a_package_error() {
    let xml = "<definitions><process id=\"p\"><startEvent id=\"s\"></process></definitions>";
    let err = read_package(xml.as_bytes()).unwrap_err();
    assert!(matches!(err, EngineError::PackageFormat(_)), "{:?}", err);
}

#[test]
fn unsupported_elements_are_rejected() {
    let xml = r#"<definitions><process id="p">
        <startEvent id="s"/><parallelGateway id="fork"/><endEvent id="e"/>
    </process></definitions>"#;
    let err = read_package(xml.as_bytes()).unwrap_err();
    assert!(err.to_string().contains("parallelGateway"));
}

#[test]
fn document_without_process_is_rejected() {
    let err = read_package(b"<definitions/>").unwrap_err();
    assert!(matches!(err, EngineError::PackageFormat(_)));
}

// --- Zip packages ---

#[test]
fn zip_keeps_non_process_entries_as_resources() {
    let bytes = zip_package(&[
        ("processes/leave.bpmn20.xml", LEAVE_BPMN.as_bytes()),
        ("processes/leave.png", &[0x89, b'P', b'N', b'G']),
    ]);
    let package = read_package(&bytes).unwrap();

    assert_eq!(
        package.resources,
        vec!["processes/leave.bpmn20.xml", "processes/leave.png"]
    );
    assert_eq!(package.graphs.len(), 1);
}

#[test]
fn zip_without_process_description_is_rejected() {
    let bytes = zip_package(&[("readme.txt", b"nothing here")]);
    let err = read_package(&bytes).unwrap_err();
    assert!(err.to_string().contains("no process definition"));
}

#[test]
fn corrupt_zip_is_rejected() {
    let err = read_package(b"PK\x03\x04garbage").unwrap_err();
    assert!(matches!(err, EngineError::PackageFormat(_)));
}

// --- Deployment service ---

#[tokio::test]
async fn deploy_package_registers_definitions() {
    let engine = engine().await;
    let bytes = zip_package(&[("leave.bpmn", LEAVE_BPMN.as_bytes())]);

    let deployment = engine.deploy_package(&bytes, "leave-v1").await.unwrap();
    assert_eq!(deployment.name, "leave-v1");
    assert_eq!(deployment.definition_ids.len(), 1);

    let def = engine.definition(&deployment.definition_ids[0]).await.unwrap();
    assert_eq!(def.key, "leave");
    assert_eq!(def.deployment_id.as_deref(), Some(deployment.id.as_str()));
    assert_eq!(engine.deployments().await.len(), 1);
}

#[tokio::test]
async fn invalid_process_in_package_stores_nothing() {
    let engine = engine().await;
    let broken = r#"<definitions>
        <process id="ok"><startEvent id="s"/><endEvent id="e"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="e"/></process>
        <process id="broken"><startEvent id="s"/><endEvent id="e"/>
            <sequenceFlow id="f" sourceRef="s" targetRef="missing"/></process>
    </definitions>"#;

    let err = engine
        .deploy_package(broken.as_bytes(), "bad")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.definitions().await.is_empty());
    assert!(engine.deployments().await.is_empty());
}

#[tokio::test]
async fn deployed_package_runs_end_to_end() {
    let engine = engine().await;
    engine
        .deploy_package(LEAVE_BPMN.as_bytes(), "leave")
        .await
        .unwrap();

    let inst = engine
        .start_instance_by_key("leave", vars([("username", "dave")]), Some("dave"))
        .await
        .unwrap();
    let apply = engine.tasks_by_assignee("dave").await;
    assert_eq!(apply.len(), 1);

    engine
        .complete(&apply[0].id, vars([("day", 3)]))
        .await
        .unwrap();

    let lead = engine.tasks_by_candidate("bob").await;
    assert_eq!(lead.len(), 1);
    assert_eq!(lead[0].candidate_users, vec!["alice", "bob"]);

    engine.claim(&lead[0].id, "bob").await.unwrap();
    let inst_after = engine.complete(&lead[0].id, Variables::new()).await.unwrap();

    assert_eq!(inst_after.id, inst.id);
    assert_eq!(inst_after.status, InstanceStatus::Completed);
    assert_eq!(inst_after.variables["status"], Variable::from("approved"));
    assert_eq!(inst_after.variables["note"], Variable::from("approved for dave"));
}

#[tokio::test]
async fn delete_deployment_removes_its_definitions() {
    let engine = engine().await;
    let deployment = engine
        .deploy_package(LEAVE_BPMN.as_bytes(), "leave")
        .await
        .unwrap();
    engine
        .start_instance_by_key("leave", vars([("username", "dave")]), None)
        .await
        .unwrap();

    let err = engine
        .delete_deployment(&deployment.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(engine.definitions().await.len(), 1);

    engine.delete_deployment(&deployment.id, true).await.unwrap();
    assert!(engine.definitions().await.is_empty());
    assert!(engine.deployments().await.is_empty());
    assert_eq!(engine.metrics().instances_terminated, 1);
}
