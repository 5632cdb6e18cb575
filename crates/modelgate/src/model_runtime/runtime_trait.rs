//! Backend boundary: what the orchestrator needs from an inference engine.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::catalog::ResolvedModel;

/// Per-instance runtime settings handed to a freshly created backend.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model_uid: String,
    pub model: ResolvedModel,
    pub host: String,
    pub port: u16,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub runtime_binary: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
}

/// A single completion request after prompt rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub stop_token_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One incremental piece of a streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDelta {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Lazily-driven token stream. Dropping it must release whatever the backend
/// holds for the request.
pub type TokenStream = BoxStream<'static, anyhow::Result<TokenDelta>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub runtime_name: String,
    pub supports_streaming: bool,
    pub supports_embeddings: bool,
}

/// Inference engine bound to one launched model instance.
///
/// `initialize` runs once before the runtime is shared; every other method is
/// called concurrently through `&self`.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()>;

    async fn is_ready(&self) -> bool;

    async fn generate(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse>;

    async fn generate_stream(&self, request: InferenceRequest) -> anyhow::Result<TokenStream>;

    async fn embed(&self, input: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Release backend resources. An error leaves the instance registered.
    async fn shutdown(&self) -> anyhow::Result<()>;

    fn metadata(&self) -> RuntimeMetadata;
}

/// Builds a runtime for a resolved model; injected into the orchestrator.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, model: &ResolvedModel) -> anyhow::Result<Box<dyn ModelRuntime>>;

    /// Fill in host/port/binary settings for a new instance.
    fn runtime_config(&self, model_uid: &str, model: &ResolvedModel) -> RuntimeConfig;
}
