use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::types::{
    ActivityInstance, Comment, Deployment, HistoryEvent, HistoryEventKind, ProcessInstance, Task,
    Variable, Variables, variables_from_json,
};
use crate::engine::{HistoryFilter, MetricsSnapshot};

use super::AppState;
use super::errors::{ApiResponse, AppError};

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

// --- Request/Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployQuery {
    #[serde(default)]
    pub act_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDeploymentQuery {
    pub deployment_id: String,
    #[serde(default)]
    pub cascade: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionInfo {
    pub id: String,
    pub key: String,
    pub name: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub deployed_at: DateTime<Utc>,
    pub nodes: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessRequest {
    #[serde(default)]
    pub process_definition_id: Option<String>,
    #[serde(default)]
    pub process_key: Option<String>,
    #[serde(default)]
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub initiator: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceQuery {
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEventsQuery {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Deserialize)]
pub struct AssigneeQuery {
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Deserialize)]
pub struct CandidateQuery {
    #[serde(default)]
    pub candidate: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssigneeRequest {
    pub task_id: String,
    pub assignee: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCommentRequest {
    pub task_id: String,
    #[serde(default, rename = "type")]
    pub comment_type: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentQuery {
    pub task_id: String,
    #[serde(default, rename = "type")]
    pub comment_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTaskRequest {
    pub task_id: String,
    pub candidate: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTaskRequest {
    pub task_id: String,
    pub assignee: String,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    pub instance_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /act/deploy?actName=
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeployQuery>,
    body: Bytes,
) -> ApiResult<Deployment> {
    let name = params.act_name.unwrap_or_default();
    let deployment = state.engine.deploy_package(&body, &name).await?;
    Ok(ApiResponse::ok_with_message(deployment, "deployed"))
}

/// GET /act/queryDeploymentInfo
pub async fn query_deployment_info(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Deployment>> {
    Ok(ApiResponse::ok(state.engine.deployments().await))
}

/// GET /act/queryProcessInfo
pub async fn query_process_info(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DefinitionInfo>> {
    let infos = state
        .engine
        .definitions()
        .await
        .iter()
        .map(|d| DefinitionInfo {
            id: d.id.clone(),
            key: d.key.clone(),
            name: d.name.clone(),
            version: d.version,
            deployment_id: d.deployment_id.clone(),
            deployed_at: d.deployed_at,
            nodes: d.nodes.len(),
        })
        .collect();
    Ok(ApiResponse::ok(infos))
}

/// DELETE /act/deleteDeploymentById?deploymentId=&cascade=
pub async fn delete_deployment_by_id(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteDeploymentQuery>,
) -> ApiResult<Deployment> {
    let deployment = state
        .engine
        .delete_deployment(&params.deployment_id, params.cascade.unwrap_or(false))
        .await?;
    Ok(ApiResponse::ok_with_message(deployment, "deleted"))
}

/// POST /act/startProcess
pub async fn start_process(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartProcessRequest>,
) -> ApiResult<ProcessInstance> {
    let vars = to_variables(req.vars)?;
    let initiator = req.initiator.or_else(|| match vars.get("username") {
        Some(Variable::String(name)) => Some(name.clone()),
        _ => None,
    });

    let instance = match (req.process_definition_id, req.process_key) {
        (Some(id), _) => {
            state
                .engine
                .start_instance(&id, vars, initiator.as_deref())
                .await?
        }
        (None, Some(key)) => {
            state
                .engine
                .start_instance_by_key(&key, vars, initiator.as_deref())
                .await?
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "Either 'processDefinitionId' or 'processKey' is required".to_string(),
            ));
        }
    };
    Ok(ApiResponse::ok(instance))
}

/// POST /act/completeTask
pub async fn complete_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteTaskRequest>,
) -> ApiResult<ProcessInstance> {
    let vars = to_variables(req.vars)?;
    let instance = state.engine.complete(&req.task_id, vars).await?;
    Ok(ApiResponse::ok(instance))
}

/// POST /act/completeDelegateTask
pub async fn complete_delegate_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteTaskRequest>,
) -> ApiResult<ProcessInstance> {
    let vars = to_variables(req.vars)?;
    let instance = state.engine.complete_delegated(&req.task_id, vars).await?;
    Ok(ApiResponse::ok(instance))
}

/// GET /act/queryHistoryProcessInstance
pub async fn query_history_process_instance(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ProcessInstance>> {
    Ok(ApiResponse::ok(state.engine.historic_instances().await))
}

/// GET /act/queryHistoryTask
pub async fn query_history_task(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Task>> {
    Ok(ApiResponse::ok(state.engine.historic_tasks().await))
}

/// GET /act/queryActivityInstance?instanceId=
pub async fn query_activity_instance(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InstanceQuery>,
) -> ApiResult<Vec<ActivityInstance>> {
    let activities = state
        .engine
        .activity_instances(params.instance_id.as_deref())
        .await?;
    Ok(ApiResponse::ok(activities))
}

/// GET /act/queryHistoryEvents?instanceId=&taskId=&kind=
pub async fn query_history_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryEventsQuery>,
) -> ApiResult<Vec<HistoryEvent>> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<HistoryEventKind>)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let filter = HistoryFilter {
        instance_id: params.instance_id,
        task_id: params.task_id,
        kind,
    };
    Ok(ApiResponse::ok(state.engine.history(&filter).await?))
}

/// GET /act/queryByAssigneeTask?assignee=
pub async fn query_by_assignee_task(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AssigneeQuery>,
) -> ApiResult<Vec<Task>> {
    let assignee = required("assignee", params.assignee)?;
    Ok(ApiResponse::ok(state.engine.tasks_by_assignee(&assignee).await))
}

/// PUT /act/updateAssigneeByTaskId?taskId=&assignee=
pub async fn update_assignee_by_task_id(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TaskAssigneeRequest>,
) -> ApiResult<Task> {
    let task = state
        .engine
        .set_assignee(&params.task_id, &params.assignee)
        .await?;
    Ok(ApiResponse::ok(task))
}

/// POST /act/addComment
pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddCommentRequest>,
) -> ApiResult<Comment> {
    let comment = state
        .engine
        .add_comment(&req.task_id, req.comment_type.as_deref(), &req.message)
        .await?;
    Ok(ApiResponse::ok(comment))
}

/// GET /act/queryComment?taskId=&type=
pub async fn query_comment(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CommentQuery>,
) -> ApiResult<Vec<Comment>> {
    let comments = state
        .engine
        .comments(&params.task_id, params.comment_type.as_deref())
        .await?;
    Ok(ApiResponse::ok(comments))
}

/// GET /act/queryTaskByCandidateUser?candidate=
pub async fn query_task_by_candidate_user(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CandidateQuery>,
) -> ApiResult<Vec<Task>> {
    let candidate = required("candidate", params.candidate)?;
    Ok(ApiResponse::ok(state.engine.tasks_by_candidate(&candidate).await))
}

/// POST /act/claimTask
pub async fn claim_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimTaskRequest>,
) -> ApiResult<Task> {
    let task = state.engine.claim(&req.task_id, &req.candidate).await?;
    Ok(ApiResponse::ok(task))
}

/// POST /act/delegateTask
///
/// The owner defaults to the current assignee.
pub async fn delegate_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DelegateTaskRequest>,
) -> ApiResult<Task> {
    let owner = match req.owner {
        Some(owner) => owner,
        None => state
            .engine
            .get_task(&req.task_id)
            .await?
            .assignee
            .ok_or_else(|| {
                AppError::BadRequest("'owner' is required for an unassigned task".to_string())
            })?,
    };
    let task = state
        .engine
        .delegate(&req.task_id, &owner, &req.assignee)
        .await?;
    Ok(ApiResponse::ok(task))
}

/// POST /act/setAssignee
pub async fn set_assignee(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskAssigneeRequest>,
) -> ApiResult<Task> {
    let task = state.engine.set_assignee(&req.task_id, &req.assignee).await?;
    Ok(ApiResponse::ok(task))
}

/// POST /act/terminateInstance
pub async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TerminateRequest>,
) -> ApiResult<ProcessInstance> {
    let reason = req.reason.unwrap_or_else(|| "terminated by request".to_string());
    let instance = state
        .engine
        .terminate_instance(&req.instance_id, &reason)
        .await?;
    Ok(ApiResponse::ok(instance))
}

/// GET /act/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<MetricsSnapshot> {
    Ok(ApiResponse::ok(state.engine.metrics()))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn to_variables(map: Option<serde_json::Map<String, serde_json::Value>>) -> Result<Variables, AppError> {
    Ok(variables_from_json(map.unwrap_or_default())?)
}

fn required(name: &str, value: Option<String>) -> Result<String, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("'{}' is required", name)))
}
