//! Application error type mapping engine errors to the envelope format.

use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use loomflow_core::workflow::approval::GateError;
use loomflow_core::workflow::checkpoint::CheckpointError;
use loomflow_core::workflow::coordinator::CoordinatorError;
use loomflow_core::workflow::definition::DefinitionError;
use loomflow_core::workflow::idempotency::StoreError;
use loomflow_core::workflow::phase::PhaseError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised by the run coordinator.
    Coordinator(CoordinatorError),
    /// Malformed request.
    Validation(String),
    /// Unknown resource outside the coordinator (routes, pipelines).
    NotFound(String),
    /// Generic internal error.
    Internal(String),
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        AppError::Coordinator(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Coordinator(CoordinatorError::Definition(e))
    }
}

impl AppError {
    /// Machine-readable code and message for this error.
    pub fn code_and_message(&self) -> (&'static str, String) {
        match self {
            AppError::Coordinator(e) => classify(e),
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => ("INTERNAL_ERROR", msg.clone()),
        }
    }
}

fn classify(e: &CoordinatorError) -> (&'static str, String) {
    let code = match e {
        CoordinatorError::NotFound(_)
        | CoordinatorError::Checkpoint(CheckpointError::RunNotFound(_)) => "RUN_NOT_FOUND",
        CoordinatorError::Definition(DefinitionError::NotFound(_)) => "NOT_FOUND",
        CoordinatorError::Validation(_)
        | CoordinatorError::Definition(
            DefinitionError::ValidationError(_) | DefinitionError::ParseError(_),
        )
        | CoordinatorError::Gate(GateError::ReasonRequired)
        | CoordinatorError::Phase(PhaseError::InvalidEvent(_))
        | CoordinatorError::Store(StoreError::UnknownStep(_)) => "VALIDATION_ERROR",
        CoordinatorError::InvalidState(_)
        | CoordinatorError::Gate(GateError::NotArmed(_) | GateError::InvalidState { .. })
        | CoordinatorError::Phase(PhaseError::IllegalTransition { .. })
        | CoordinatorError::Checkpoint(CheckpointError::AttemptClosed { .. }) => "INVALID_STATE",
        CoordinatorError::Store(StoreError::Conflict(_)) => "CONFLICT",
        _ => "INTERNAL_ERROR",
    };
    (code, e.to_string())
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = self.code_and_message();
        if code == "INTERNAL_ERROR" {
            tracing::error!(error = %message, "request failed");
        }
        ApiResponse::error(code, &message, Uuid::now_v7().to_string(), 0).into_response()
    }
}
