//! REST handlers over the orchestrator.

pub mod admin_api;
pub mod inference_api;
pub mod model_api;
pub mod registration_api;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::error::OrchestratorError;
use crate::metrics;
use crate::state::AppState;

/// API error type
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    /// The `{"error": ...}` body, also sent as the last event of a failed stream.
    pub fn body(&self) -> Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.status.as_u16(),
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::InvalidSpec(_) | OrchestratorError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::DuplicateName(_) => StatusCode::CONFLICT,
            OrchestratorError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::TerminatedMidRequest(_) => StatusCode::GONE,
            OrchestratorError::TerminationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::BackendFailure(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Unwrap a JSON body, reporting a malformed one through the error taxonomy.
pub(crate) fn json_payload<T>(
    payload: Result<Json<T>, JsonRejection>,
    invalid: fn(String) -> OrchestratorError,
) -> Result<T, OrchestratorError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| invalid(rejection.body_text()))
}

/// Count the request and label its outcome for `requests_total`.
pub(crate) fn record<T>(
    state: &AppState,
    route: &str,
    result: Result<T, OrchestratorError>,
) -> Result<T, ApiError> {
    state.counters.inc_total_requests();
    match result {
        Ok(value) => {
            metrics::inc_request(route, "ok");
            Ok(value)
        }
        Err(err) => {
            state.counters.inc_failed_requests();
            metrics::inc_request(route, err.kind());
            if err.is_unexpected() {
                tracing::error!("{} failed: {}", route, err);
            } else {
                tracing::debug!("{} rejected: {}", route, err);
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_to_status_codes() {
        let cases = [
            (OrchestratorError::InvalidSpec("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::model_not_found("m"), StatusCode::NOT_FOUND),
            (OrchestratorError::DuplicateName("m".into()), StatusCode::CONFLICT),
            (OrchestratorError::ResourceExhausted("full".into()), StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::TerminatedMidRequest("m".into()), StatusCode::GONE),
            (
                OrchestratorError::TerminationFailed { uid: "m".into(), reason: "busy".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (OrchestratorError::BackendFailure("boom".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let err = ApiError::from(OrchestratorError::model_not_found("abc"));
        let body = err.body();
        assert_eq!(body["error"]["message"], "model `abc` not found");
        assert_eq!(body["error"]["type"], "not_found");
        assert_eq!(body["error"]["code"], 404);
    }
}
