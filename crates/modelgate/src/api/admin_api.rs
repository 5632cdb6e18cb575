//! Health and status endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::metrics;
use crate::state::{AppState, CounterSnapshot};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running_models: usize,
    pub max_running_models: usize,
    pub uptime_seconds: u64,
    pub requests: CounterSnapshot,
    pub memory_usage: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.uptime_seconds(),
        }),
    )
}

pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let memory_usage = {
        let mut sys = System::new();
        sys.refresh_memory();
        let used = sys.used_memory();
        let total = sys.total_memory();
        (total > 0).then(|| format!("{}/{} MB", used / 1024 / 1024, total / 1024 / 1024))
    };

    let response = StatusResponse {
        running_models: state.orchestrator.running_count(),
        max_running_models: state.orchestrator.config().max_running_models,
        uptime_seconds: state.uptime_seconds(),
        requests: state.counters.snapshot(),
        memory_usage,
    };

    metrics::inc_request("/v1/status", "ok");
    (StatusCode::OK, Json(response))
}
