//! llama.cpp runtime adapter
//!
//! Spawns one `llama-server` process per launched model (ggmlv3 / gguf
//! weights) and proxies completions and embeddings over its
//! OpenAI-compatible HTTP API. Can also attach to a server someone else
//! manages, in which case shutdown leaves the process alone.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::runtime_trait::*;
use crate::catalog::{ModelFormat, ResolvedModel};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct LlamaServerRuntime {
    config: Option<RuntimeConfig>,
    server_process: Mutex<Option<Child>>,
    http_client: reqwest::Client,
    base_url: String,
    startup_timeout: Duration,
}

impl LlamaServerRuntime {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            config: None,
            server_process: Mutex::new(None),
            http_client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            base_url: String::new(),
            startup_timeout: Duration::from_secs(60),
        }
    }

    /// Proxy to an already running llama-server instead of spawning one.
    pub fn attach(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let mut runtime = Self::new(request_timeout);
        runtime.base_url = base_url.into().trim_end_matches('/').to_string();
        runtime
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn owns_process(&self) -> bool {
        self.server_process
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    async fn start_server(&mut self, config: &RuntimeConfig) -> anyhow::Result<()> {
        let binary_path = config
            .runtime_binary
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("llama-server binary not configured (set LLAMA_BIN)"))?;
        let model_path = config
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no model file configured for {}", config.model_uid))?;

        if !model_path.exists() {
            anyhow::bail!("Model file not found: {}", model_path.display());
        }

        info!("Starting llama-server for {}: {}", config.model_uid, model_path.display());
        info!("  Binary: {}", binary_path.display());
        info!("  Port: {}", config.port);
        info!("  Context Size: {}", config.context_size);
        info!("  GPU Layers: {}", config.gpu_layers);

        let mut cmd = Command::new(binary_path);
        cmd.arg("--model")
            .arg(model_path)
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--ctx-size")
            .arg(config.context_size.to_string())
            .arg("--threads")
            .arg(config.threads.to_string())
            .arg("--n-gpu-layers")
            .arg(config.gpu_layers.to_string())
            .arg("--embedding")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn llama-server: {}", e))?;

        *self
            .server_process
            .lock()
            .map_err(|_| anyhow::anyhow!("llama-server process lock poisoned"))? = Some(child);
        self.base_url = format!("http://{}:{}", config.host, config.port);

        info!("llama-server process started, waiting for health check...");
        let started = std::time::Instant::now();
        let mut attempt = 0u32;
        while started.elapsed() < self.startup_timeout {
            sleep(HEALTH_POLL_INTERVAL).await;
            attempt += 1;

            if self.is_ready().await {
                info!(
                    "llama-server for {} ready after {:.1}s",
                    config.model_uid,
                    started.elapsed().as_secs_f32()
                );
                return Ok(());
            }
            if attempt % 10 == 0 {
                info!(
                    "Still waiting for llama-server... ({}s/{}s)",
                    started.elapsed().as_secs(),
                    self.startup_timeout.as_secs()
                );
            }
        }

        // Do not leave a half-started server behind.
        self.kill_child()?;
        anyhow::bail!(
            "llama-server failed to start within {} seconds",
            self.startup_timeout.as_secs()
        )
    }

    fn kill_child(&self) -> anyhow::Result<()> {
        let mut guard = self
            .server_process
            .lock()
            .map_err(|_| anyhow::anyhow!("llama-server process lock poisoned"))?;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill() {
                // Already exited is fine; anything else keeps the handle for a retry.
                if child.try_wait().ok().flatten().is_none() {
                    *guard = Some(child);
                    return Err(anyhow::anyhow!("Failed to kill llama-server process: {}", e));
                }
            }
            let _ = child.wait();
            info!("llama-server process stopped");
        }
        Ok(())
    }

    fn completion_payload(request: &InferenceRequest, stream: bool) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(t) = request.temperature {
            payload["temperature"] = t.into();
        }
        if let Some(p) = request.top_p {
            payload["top_p"] = p.into();
        }
        if !request.stop.is_empty() {
            payload["stop"] = serde_json::json!(request.stop);
        }
        if !request.stop_token_ids.is_empty() {
            payload["stop_token_ids"] = serde_json::json!(request.stop_token_ids);
        }
        payload
    }

    async fn post(&self, path: &str, payload: &serde_json::Value) -> anyhow::Result<reqwest::Response> {
        if self.base_url.is_empty() {
            anyhow::bail!("Runtime not initialized");
        }
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Request to llama-server failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("llama-server returned {}: {}", status, body);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelRuntime for LlamaServerRuntime {
    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()> {
        let format = config.model.spec.model_format;
        if !format.is_llama_cpp() {
            anyhow::bail!("llama-server cannot serve {} weights", format);
        }

        self.config = Some(config.clone());
        if !self.base_url.is_empty() {
            info!("Attaching {} to llama-server at {}", config.model_uid, self.base_url);
            if !self.is_ready().await {
                anyhow::bail!("llama-server at {} is not healthy", self.base_url);
            }
            return Ok(());
        }
        self.start_server(&config).await
    }

    async fn is_ready(&self) -> bool {
        if self.base_url.is_empty() {
            return false;
        }
        let health_url = format!("{}/health", self.base_url);
        match self.http_client.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        let resp = self
            .post("/v1/completions", &Self::completion_payload(&request, false))
            .await?;
        let response: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

        let text = response["choices"][0]["text"].as_str().unwrap_or("").to_string();
        let finish_reason = response["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        Ok(InferenceResponse {
            text,
            finish_reason,
            prompt_tokens: response["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: response["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    async fn generate_stream(&self, request: InferenceRequest) -> anyhow::Result<TokenStream> {
        let resp = self
            .post("/v1/completions", &Self::completion_payload(&request, true))
            .await?;
        Ok(completion_deltas(resp.bytes_stream()))
    }

    async fn embed(&self, input: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        let resp = self
            .post("/v1/embeddings", &serde_json::json!({ "input": input }))
            .await?;
        let response: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embeddings response: {}", e))?;

        let data = response["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Embeddings response has no data array"))?;
        data.iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("Embeddings item has no embedding"))
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
            })
            .collect()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let uid = self.config.as_ref().map(|c| c.model_uid.as_str()).unwrap_or("?");
        if self.owns_process() {
            info!("Shutting down llama-server for {}", uid);
            self.kill_child()
        } else {
            debug!("{} is attached to an external llama-server; nothing to stop", uid);
            Ok(())
        }
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            runtime_name: "llama.cpp (llama-server)".to_string(),
            supports_streaming: true,
            supports_embeddings: true,
        }
    }
}

/// Turn a `/v1/completions` event-stream body into token deltas.
fn completion_deltas<S, B, E>(byte_stream: S) -> TokenStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let sse_stream = async_stream::try_stream! {
        // Split on raw bytes so a character cut by a chunk boundary survives.
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = std::str::from_utf8(&raw)
                    .map_err(|e| anyhow::anyhow!("Stream event is not UTF-8: {}", e))?
                    .trim();

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return;
                }

                let event: serde_json::Value = serde_json::from_str(data)
                    .map_err(|e| anyhow::anyhow!("Malformed stream event: {}", e))?;
                if let Some(err) = event.get("error") {
                    Err::<(), _>(anyhow::anyhow!("llama-server stream error: {}", err))?;
                }
                yield TokenDelta {
                    text: event["choices"][0]["text"].as_str().unwrap_or("").to_string(),
                    finish_reason: event["choices"][0]["finish_reason"]
                        .as_str()
                        .map(|s| s.to_string()),
                };
            }
        }
    };

    sse_stream.boxed()
}

impl Drop for LlamaServerRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.kill_child() {
            error!("{}", e);
        }
    }
}

/// Settings shared by every llama-server instance the factory creates.
#[derive(Debug, Clone)]
pub struct LlamaServerSettings {
    pub binary: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub host: String,
    pub base_port: u16,
    pub models_dir: PathBuf,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
}

/// Creates a `LlamaServerRuntime` per launch, handing out consecutive ports.
pub struct LlamaServerRuntimeFactory {
    settings: LlamaServerSettings,
    next_port: AtomicU16,
}

impl LlamaServerRuntimeFactory {
    pub fn new(settings: LlamaServerSettings) -> Self {
        let next_port = AtomicU16::new(settings.base_port);
        Self { settings, next_port }
    }

    /// Where the weights for a resolved model are expected on disk.
    pub fn model_path(&self, model: &ResolvedModel) -> PathBuf {
        let ext = match model.spec.model_format {
            ModelFormat::Gguf => "gguf",
            _ => "bin",
        };
        self.settings.models_dir.join(&model.family.model_name).join(format!(
            "{}.{}b.{}.{}",
            model.family.model_name, model.spec.model_size_in_billions, model.quantization, ext
        ))
    }
}

impl RuntimeFactory for LlamaServerRuntimeFactory {
    fn create(&self, model: &ResolvedModel) -> anyhow::Result<Box<dyn ModelRuntime>> {
        if !model.spec.model_format.is_llama_cpp() {
            anyhow::bail!(
                "the llama-server runtime cannot serve {} weights of {}",
                model.spec.model_format,
                model.family.model_name
            );
        }
        let runtime = match &self.settings.endpoint {
            Some(url) => LlamaServerRuntime::attach(url.clone(), self.settings.request_timeout),
            None => LlamaServerRuntime::new(self.settings.request_timeout)
                .with_startup_timeout(self.settings.startup_timeout),
        };
        Ok(Box::new(runtime))
    }

    fn runtime_config(&self, model_uid: &str, model: &ResolvedModel) -> RuntimeConfig {
        let base_port = self.settings.base_port;
        let port = self
            .next_port
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                Some(port.checked_add(1).unwrap_or(base_port))
            })
            .unwrap_or(base_port);
        if port == u16::MAX {
            warn!("llama-server port range exhausted; wrapping around to {}", base_port);
        }
        RuntimeConfig {
            model_uid: model_uid.to_string(),
            model: model.clone(),
            host: self.settings.host.clone(),
            port,
            context_size: self.settings.context_size,
            threads: self.settings.threads,
            gpu_layers: self.settings.gpu_layers,
            runtime_binary: self.settings.binary.clone(),
            model_path: Some(self.model_path(model)),
        }
    }
}
