//! Custom model registration endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{json_payload, record, ApiError};
use crate::catalog::{ModelFamily, RegistrationSummary};
use crate::error::OrchestratorError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterModelRequest {
    /// The registration document, as a JSON string.
    pub model: String,
    #[serde(default)]
    pub persist: bool,
}

pub async fn list_model_registrations(
    State(state): State<AppState>,
) -> Result<Json<Vec<RegistrationSummary>>, ApiError> {
    let registrations = state.orchestrator.list_model_registrations();
    Ok(Json(record(&state, "/v1/model_registrations", Ok(registrations))?))
}

pub async fn register_model(
    State(state): State<AppState>,
    payload: Result<Json<RegisterModelRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let registered = json_payload(payload, OrchestratorError::InvalidSpec)
        .and_then(|req| state.orchestrator.register_model(&req.model, req.persist));
    record(&state, "/v1/model_registrations", registered)?;
    Ok(StatusCode::CREATED)
}

pub async fn get_model_registration(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelFamily>, ApiError> {
    let family = state.orchestrator.get_model_registration(&name);
    Ok(Json(record(&state, "/v1/model_registrations/:name", family)?))
}

pub async fn unregister_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let unregistered = state.orchestrator.unregister_model(&name);
    record(&state, "/v1/model_registrations/:name", unregistered)?;
    Ok(StatusCode::NO_CONTENT)
}
