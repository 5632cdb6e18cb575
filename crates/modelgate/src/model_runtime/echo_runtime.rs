//! Echo runtime
//!
//! Deterministic in-process backend: completions replay the prompt's words,
//! embeddings are derived from a blake3 digest of each input. Used as the
//! default runtime for local serving and as the reference backend in tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::runtime_trait::*;
use crate::catalog::ResolvedModel;

pub const EMBEDDING_DIM: usize = 32;

pub struct EchoRuntime {
    model_uid: String,
    ready: AtomicBool,
    token_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self {
            model_uid: String::new(),
            ready: AtomicBool::new(false),
            token_delay: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn with_in_flight_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.in_flight = counter;
        self
    }

    /// The tokens a request produces and why generation stopped.
    fn plan(request: &InferenceRequest) -> (Vec<String>, &'static str) {
        let words: Vec<&str> = request.prompt.split_whitespace().collect();
        let mut tokens = Vec::new();
        for (i, word) in words.iter().enumerate() {
            if request.stop.iter().any(|s| s == word) {
                return (tokens, "stop");
            }
            if tokens.len() as u32 >= request.max_tokens {
                return (tokens, "length");
            }
            tokens.push(if i == 0 { word.to_string() } else { format!(" {}", word) });
        }
        (tokens, "stop")
    }

    fn ensure_ready(&self) -> anyhow::Result<()> {
        if !self.ready.load(Ordering::Acquire) {
            anyhow::bail!("echo runtime for {} is not running", self.model_uid);
        }
        Ok(())
    }
}

impl Default for EchoRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a live producer task; decremented however the task ends.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelRuntime for EchoRuntime {
    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()> {
        self.model_uid = config.model_uid;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn generate(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.ensure_ready()?;
        let (tokens, finish_reason) = Self::plan(&request);
        Ok(InferenceResponse {
            completion_tokens: tokens.len() as u32,
            prompt_tokens: request.prompt.split_whitespace().count() as u32,
            text: tokens.concat(),
            finish_reason: Some(finish_reason.to_string()),
        })
    }

    async fn generate_stream(&self, request: InferenceRequest) -> anyhow::Result<TokenStream> {
        self.ensure_ready()?;
        let (tokens, finish_reason) = Self::plan(&request);
        let (tx, rx) = mpsc::channel::<anyhow::Result<TokenDelta>>(1);
        let delay = self.token_delay;
        let guard = InFlight::enter(&self.in_flight);
        let uid = self.model_uid.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let last = tokens.len().saturating_sub(1);
            if tokens.is_empty() {
                let _ = tx
                    .send(Ok(TokenDelta {
                        text: String::new(),
                        finish_reason: Some(finish_reason.to_string()),
                    }))
                    .await;
                return;
            }
            for (i, text) in tokens.into_iter().enumerate() {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tx.closed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let delta = TokenDelta {
                    text,
                    finish_reason: (i == last).then(|| finish_reason.to_string()),
                };
                if tx.send(Ok(delta)).await.is_err() {
                    break;
                }
            }
            if tx.is_closed() {
                debug!("Echo stream for {} abandoned by consumer", uid);
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn embed(&self, input: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        self.ensure_ready()?;
        Ok(input
            .iter()
            .map(|text| {
                let digest = blake3::hash(text.as_bytes());
                let raw: Vec<f32> = digest
                    .as_bytes()
                    .iter()
                    .take(EMBEDDING_DIM)
                    .map(|b| *b as f32 / 255.0 - 0.5)
                    .collect();
                let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
                raw.into_iter().map(|v| v / norm).collect()
            })
            .collect())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            runtime_name: "echo".to_string(),
            supports_streaming: true,
            supports_embeddings: true,
        }
    }
}

/// Creates an `EchoRuntime` per launch, sharing one in-flight counter.
#[derive(Clone, Default)]
pub struct EchoRuntimeFactory {
    token_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
}

impl EchoRuntimeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Number of stream producers currently alive across all instances.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl RuntimeFactory for EchoRuntimeFactory {
    fn create(&self, _model: &ResolvedModel) -> anyhow::Result<Box<dyn ModelRuntime>> {
        let mut runtime = EchoRuntime::new().with_in_flight_counter(self.in_flight.clone());
        if let Some(delay) = self.token_delay {
            runtime = runtime.with_token_delay(delay);
        }
        Ok(Box::new(runtime))
    }

    fn runtime_config(&self, model_uid: &str, model: &ResolvedModel) -> RuntimeConfig {
        RuntimeConfig {
            model_uid: model_uid.to_string(),
            model: model.clone(),
            host: "127.0.0.1".to_string(),
            port: 0,
            context_size: 2048,
            threads: 1,
            gpu_layers: 0,
            runtime_binary: None,
            model_path: None,
        }
    }
}
