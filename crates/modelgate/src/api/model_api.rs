//! Model lifecycle endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use super::{json_payload, record, ApiError};
use crate::catalog::LaunchRequest;
use crate::client::restful::LaunchResponse;
use crate::error::OrchestratorError;
use crate::orchestrator::ModelDescription;
use crate::state::AppState;

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelDescription>>, ApiError> {
    let models = record(&state, "/v1/models", Ok(state.orchestrator.list()))?;
    Ok(Json(models))
}

/// POST /v1/models
pub async fn launch_model(
    State(state): State<AppState>,
    payload: Result<Json<LaunchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LaunchResponse>), ApiError> {
    let launched = match json_payload(payload, OrchestratorError::InvalidSpec) {
        Ok(request) => {
            info!("Launch request for {}", request.model_name);
            state.orchestrator.launch(request).await
        }
        Err(e) => Err(e),
    };
    let model_uid = record(&state, "/v1/models", launched)?;
    Ok((StatusCode::CREATED, Json(LaunchResponse { model_uid })))
}

/// GET /v1/models/:uid
pub async fn describe_model(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<ModelDescription>, ApiError> {
    let description = record(&state, "/v1/models/:uid", state.orchestrator.describe(&uid))?;
    Ok(Json(description))
}

/// DELETE /v1/models/:uid
pub async fn terminate_model(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let terminated = state.orchestrator.terminate(&uid).await;
    record(&state, "/v1/models/:uid", terminated)?;
    Ok(StatusCode::NO_CONTENT)
}
