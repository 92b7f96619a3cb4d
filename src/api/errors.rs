use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::engine::EngineError;

/// Uniform response envelope: `{ok, data?, message?, code?}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            message: None,
            code: None,
        })
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            ok: true,
            data: Some(data),
            message: Some(message.into()),
            code: None,
        })
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Malformed request parameters, rejected before reaching the engine.
    BadRequest(String),
    Engine(EngineError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Engine(e) => match e {
                EngineError::Validation(_) | EngineError::PackageFormat(_) => StatusCode::BAD_REQUEST,
                EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::Conflict(_) => StatusCode::CONFLICT,
                EngineError::InvalidState(_)
                | EngineError::NoMatchingTransition { .. }
                | EngineError::ServiceStep { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match self {
            AppError::BadRequest(msg) => (msg, "BAD_REQUEST"),
            AppError::Engine(e) => {
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (e.to_string(), e.code())
            }
        };

        let body: ApiResponse<()> = ApiResponse {
            ok: false,
            data: None,
            message: Some(message),
            code: Some(code),
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}
