//! Prometheus metrics. Recording is a no-op until `init_metrics` has run.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static RUNNING_MODELS: OnceLock<IntGauge> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("requests_total is a valid metric")
    });

    let running_models = RUNNING_MODELS.get_or_init(|| {
        IntGauge::new("running_models", "Model instances currently launched")
            .expect("running_models is a valid metric")
    });

    let active_streams = ACTIVE_STREAMS.get_or_init(|| {
        IntGauge::new("active_streams", "Streaming responses currently being consumed")
            .expect("active_streams is a valid metric")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(running_models.clone())).ok();
    REGISTRY.register(Box::new(active_streams.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn set_running_models(count: usize) {
    if let Some(gauge) = RUNNING_MODELS.get() {
        gauge.set(count as i64);
    }
}

pub fn inc_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.inc();
    }
}

pub fn dec_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.dec();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_exported() {
        init_metrics();
        inc_request("/v1/models", "200");
        set_running_models(2);

        let text = {
            let mut buffer = vec![];
            TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer).unwrap();
            String::from_utf8(buffer).unwrap()
        };
        assert!(text.contains("requests_total"));
        assert!(text.contains("running_models"));
    }
}
