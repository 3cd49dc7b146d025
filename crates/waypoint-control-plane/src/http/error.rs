//! Mapping from domain errors to HTTP responses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use waypoint_core::CoreError;

use crate::http::responses::ErrorResponse;

/// Error returned by every handler. Rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::DuplicateId { .. }
            | CoreError::Conflict { .. }
            | CoreError::WorkerBusy(_)
            | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::CapabilityMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::WorkerOffline(_) => StatusCode::GONE,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::RetriesExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection, "Invalid JSON in request body");
        Self(CoreError::InvalidInput(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(CoreError::InvalidInput(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::TaskState;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (CoreError::task_not_found("t1"), StatusCode::NOT_FOUND),
            (CoreError::WorkerBusy("w1".into()), StatusCode::CONFLICT),
            (
                CoreError::InvalidTransition {
                    from: TaskState::Completed,
                    to: TaskState::Running,
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::CapabilityMismatch {
                    task_id: "t1".into(),
                    task_type: "deploy".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (CoreError::WorkerOffline("w1".into()), StatusCode::GONE),
            (CoreError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (CoreError::Storage("disk".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
