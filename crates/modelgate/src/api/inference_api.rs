//! Generate, chat and embedding endpoints.
//!
//! With `generate_config.stream` set, the response is an event stream: one
//! JSON chunk per event, a `{"error": ...}` event if the stream fails, and a
//! final `[DONE]`. Dropping the connection drops the underlying stream, which
//! stops the backend producing tokens.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

use super::{json_payload, record, ApiError};
use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{ChatGeneration, CompletionGeneration};
use crate::prompt::ChatMessage;
use crate::state::AppState;
use crate::types::{Embedding, EmbeddingInput, GenerateConfig, Generation};

const KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Left untyped so a non-string prompt is reported as an invalid argument.
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub generate_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub generate_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub input: EmbeddingInput,
}

async fn run_generate(
    state: &AppState,
    uid: &str,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<CompletionGeneration> {
    let body = json_payload(payload, OrchestratorError::InvalidArgument)?;
    let config = GenerateConfig::from_value(body.generate_config)?;
    let model = state.orchestrator.get(uid)?;
    model.generate(body.prompt, config).await
}

async fn run_chat(
    state: &AppState,
    uid: &str,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<ChatGeneration> {
    let body = json_payload(payload, OrchestratorError::InvalidArgument)?;
    let config = GenerateConfig::from_value(body.generate_config)?;
    let model = state.orchestrator.get(uid)?;
    model
        .chat(body.prompt, body.system_prompt, body.chat_history, config)
        .await
}

async fn run_embedding(
    state: &AppState,
    uid: &str,
    payload: std::result::Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<Embedding> {
    let body = json_payload(payload, OrchestratorError::InvalidArgument)?;
    let model = state.orchestrator.get(uid)?;
    model.create_embedding(body.input).await
}

/// POST /v1/models/:uid/generate
pub async fn generate(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    payload: std::result::Result<Json<GenerateRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let outcome = run_generate(&state, &uid, payload).await;
    Ok(into_response(&state, record(&state, "/v1/models/:uid/generate", outcome)?))
}

/// POST /v1/models/:uid/chat
pub async fn chat(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let outcome = run_chat(&state, &uid, payload).await;
    Ok(into_response(&state, record(&state, "/v1/models/:uid/chat", outcome)?))
}

/// POST /v1/models/:uid/embeddings
pub async fn create_embedding(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    payload: std::result::Result<Json<EmbeddingRequest>, JsonRejection>,
) -> std::result::Result<Json<Embedding>, ApiError> {
    let outcome = run_embedding(&state, &uid, payload).await;
    Ok(Json(record(&state, "/v1/models/:uid/embeddings", outcome)?))
}

fn into_response<T, C>(state: &AppState, generation: Generation<T, C>) -> Response
where
    T: Serialize,
    C: Serialize + Send + 'static,
{
    match generation {
        Generation::Complete(result) => Json(result).into_response(),
        Generation::Stream(chunks) => {
            state.counters.inc_streamed_responses();
            event_stream(chunks).into_response()
        }
    }
}

fn event_stream<C>(
    mut chunks: BoxStream<'static, Result<C>>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>>
where
    C: Serialize + Send + 'static,
{
    let events = async_stream::stream! {
        while let Some(item) = chunks.next().await {
            let data = match item {
                Ok(chunk) => serde_json::to_string(&chunk)
                    .map_err(|e| OrchestratorError::BackendFailure(format!("unencodable chunk: {}", e))),
                Err(e) => Err(e),
            };
            match data {
                Ok(json) => yield Ok::<_, Infallible>(Event::default().data(json)),
                Err(e) => {
                    if e.is_unexpected() {
                        warn!("stream failed: {}", e);
                    } else {
                        debug!("stream ended early: {}", e);
                    }
                    yield Ok(Event::default().data(ApiError::from(e).body().to_string()));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
}
