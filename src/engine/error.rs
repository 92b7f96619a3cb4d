//! Engine-level error types.

use thiserror::Error;

/// Errors returned by the definition store, execution engine and task manager.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition errors ------
    /// A process graph or a variable map failed validation; nothing was stored.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A deployment package could not be unpacked or parsed.
    #[error("malformed deployment package: {0}")]
    PackageFormat(String),

    // ------ Lookup / state errors ------
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A state precondition was violated (double claim, referenced definition, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not valid for the current task or instance status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    // ------ Execution errors (fatal for the instance) ------
    #[error("no outgoing transition of node '{node_id}' matched in instance '{instance_id}'")]
    NoMatchingTransition { instance_id: String, node_id: String },

    #[error("service step '{node_id}' failed: {message}")]
    ServiceStep { node_id: String, message: String },

    // ------ Infrastructure ------
    /// Storage failure; transient, the caller may retry.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable, user-visible code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::PackageFormat(_) => "PACKAGE_FORMAT_ERROR",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::NoMatchingTransition { .. } => "NO_MATCHING_TRANSITION",
            EngineError::ServiceStep { .. } => "SERVICE_STEP_FAILED",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
