mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use errors::{ApiResponse, AppError};

use crate::engine::ProcessEngine;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: Arc<ProcessEngine>,
}

/// Build the API router.
pub fn router(engine: Arc<ProcessEngine>, max_body: usize) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/act/deploy", post(handlers::deploy))
        .route("/act/queryDeploymentInfo", get(handlers::query_deployment_info))
        .route("/act/queryProcessInfo", get(handlers::query_process_info))
        .route("/act/deleteDeploymentById", delete(handlers::delete_deployment_by_id))
        .route("/act/startProcess", post(handlers::start_process))
        .route("/act/completeTask", post(handlers::complete_task))
        .route("/act/completeDelegateTask", post(handlers::complete_delegate_task))
        .route(
            "/act/queryHistoryProcessInstance",
            get(handlers::query_history_process_instance),
        )
        .route("/act/queryHistoryTask", get(handlers::query_history_task))
        .route("/act/queryActivityInstance", get(handlers::query_activity_instance))
        .route("/act/queryHistoryEvents", get(handlers::query_history_events))
        .route("/act/queryByAssigneeTask", get(handlers::query_by_assignee_task))
        .route("/act/updateAssigneeByTaskId", put(handlers::update_assignee_by_task_id))
        .route("/act/addComment", post(handlers::add_comment))
        .route("/act/queryComment", get(handlers::query_comment))
        .route("/act/queryTaskByCandidateUser", get(handlers::query_task_by_candidate_user))
        .route("/act/claimTask", post(handlers::claim_task))
        .route("/act/delegateTask", post(handlers::delegate_task))
        .route("/act/setAssignee", post(handlers::set_assignee))
        .route("/act/terminateInstance", post(handlers::terminate_instance))
        .route("/act/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, engine: Arc<ProcessEngine>, max_body: usize) -> Result<()> {
    let app = router(engine, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("IronBPM API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
