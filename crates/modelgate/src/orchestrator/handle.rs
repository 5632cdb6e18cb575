//! Handle onto one running model: generate, chat and embeddings.

use chrono::Utc;
use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::{ModelDescription, RunningModelEntry};
use super::stream::{terminated, TerminationAware};
use crate::catalog::ModelAbility;
use crate::error::{OrchestratorError, Result};
use crate::model_runtime::{InferenceRequest, InferenceResponse};
use crate::prompt::{render_chat_prompt, ChatMessage};
use crate::types::*;

pub type CompletionGeneration = Generation<Completion, CompletionChunk>;
pub type ChatGeneration = Generation<ChatCompletion, ChatCompletionChunk>;

/// Capability reference to a running model. Cheap to clone; obtained only
/// through `Orchestrator::get`.
#[derive(Clone)]
pub struct ModelHandle {
    entry: Arc<RunningModelEntry>,
}

impl ModelHandle {
    pub(crate) fn new(entry: Arc<RunningModelEntry>) -> Self {
        Self { entry }
    }

    pub fn uid(&self) -> &str {
        &self.entry.uid
    }

    pub fn describe(&self) -> ModelDescription {
        self.entry.describe()
    }

    pub fn abilities(&self) -> &[ModelAbility] {
        &self.entry.model.family.model_ability
    }

    pub async fn generate(
        &self,
        prompt: impl Into<PromptArg>,
        config: GenerateConfig,
    ) -> Result<CompletionGeneration> {
        let prompt = prompt.into().into_text()?;
        self.require(ModelAbility::Generate)?;
        let request = self.inference_request(prompt, &config, &[], &[]);
        let uid = self.entry.uid.clone();
        let id = format!("cmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp();

        if !config.stream {
            let response = self.run(request).await?;
            return Ok(Generation::Complete(Completion {
                id,
                object: "text_completion".to_string(),
                created,
                model: uid,
                usage: usage(&response),
                choices: vec![CompletionChoice {
                    text: response.text,
                    index: 0,
                    finish_reason: response.finish_reason,
                }],
            }));
        }

        let tokens = self.open_stream(request).await?;
        let chunks = tokens.map(move |delta| {
            delta.map(|delta| CompletionChunk {
                id: id.clone(),
                object: "text_completion".to_string(),
                created,
                model: uid.clone(),
                choices: vec![CompletionChoice {
                    text: delta.text,
                    index: 0,
                    finish_reason: delta.finish_reason,
                }],
            })
        });
        Ok(Generation::Stream(self.guard_stream(chunks)))
    }

    /// Render `prompt` after `chat_history` with the model's prompt style and
    /// complete it. `system_prompt` replaces the style's system prompt.
    pub async fn chat(
        &self,
        prompt: impl Into<PromptArg>,
        system_prompt: Option<String>,
        chat_history: Vec<ChatMessage>,
        config: GenerateConfig,
    ) -> Result<ChatGeneration> {
        let prompt = prompt.into().into_text()?;
        self.require(ModelAbility::Chat)?;
        let mut style = self.entry.model.family.prompt_style.clone().ok_or_else(|| {
            OrchestratorError::InvalidArgument(format!(
                "model `{}` has no prompt style",
                self.entry.model.family.model_name
            ))
        })?;
        if let Some(system_prompt) = system_prompt {
            style.system_prompt = system_prompt;
        }

        let full_prompt = render_chat_prompt(&prompt, &chat_history, &style)?;
        debug!("Rendered chat prompt for {}: {:?}", self.entry.uid, full_prompt);

        let style_stop = style.stop.clone().unwrap_or_default();
        let style_stop_ids = style.stop_token_ids.clone().unwrap_or_default();
        let request = self.inference_request(full_prompt, &config, &style_stop, &style_stop_ids);
        let uid = self.entry.uid.clone();
        let id = format!("chatcmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp();
        let assistant = style.assistant_role().to_string();

        if !config.stream {
            let response = self.run(request).await?;
            return Ok(Generation::Complete(ChatCompletion {
                id,
                object: "chat.completion".to_string(),
                created,
                model: uid,
                usage: usage(&response),
                choices: vec![ChatCompletionChoice {
                    index: 0,
                    message: ChatMessage::new(assistant, response.text),
                    finish_reason: response.finish_reason,
                }],
            }));
        }

        let tokens = self.open_stream(request).await?;
        let chunk = move |delta: ChatDelta, finish_reason: Option<String>| ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: uid.clone(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        let role_chunk = chunk(
            ChatDelta {
                role: Some(assistant),
                content: None,
            },
            None,
        );
        let content_chunks = tokens.map(move |delta| {
            delta.map(|delta| {
                chunk(
                    ChatDelta {
                        role: None,
                        content: Some(delta.text),
                    },
                    delta.finish_reason,
                )
            })
        });
        let chunks = stream::once(async move { Ok(role_chunk) }).chain(content_chunks);
        Ok(Generation::Stream(self.guard_stream(chunks)))
    }

    pub async fn create_embedding(&self, input: impl Into<EmbeddingInput>) -> Result<Embedding> {
        self.require(ModelAbility::Embed)?;
        let input = input.into().into_vec();
        if input.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "embedding input must not be empty".to_string(),
            ));
        }
        self.ensure_running()?;

        let prompt_tokens: usize = input.iter().map(|s| s.split_whitespace().count()).sum();
        let runtime = self.entry.runtime.clone();
        let vectors = tokio::select! {
            biased;
            _ = terminated(self.entry.watch_terminated()) => {
                return Err(OrchestratorError::TerminatedMidRequest(self.entry.uid.clone()));
            }
            result = runtime.embed(input) => result.map_err(|e| self.backend_error(e))?,
        };

        Ok(Embedding {
            object: "list".to_string(),
            model: self.entry.uid.clone(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    index: index as u32,
                    object: "embedding".to_string(),
                    embedding,
                })
                .collect(),
            usage: Usage {
                prompt_tokens: prompt_tokens as u32,
                completion_tokens: 0,
                total_tokens: prompt_tokens as u32,
            },
        })
    }

    fn require(&self, ability: ModelAbility) -> Result<()> {
        if self.entry.model.family.has_ability(ability) {
            return Ok(());
        }
        Err(OrchestratorError::InvalidArgument(format!(
            "model `{}` does not support {}",
            self.entry.model.family.model_name,
            ability.name()
        )))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.entry.is_terminated() {
            return Err(OrchestratorError::TerminatedMidRequest(self.entry.uid.clone()));
        }
        Ok(())
    }

    fn backend_error(&self, err: anyhow::Error) -> OrchestratorError {
        warn!("Backend failure on model {}: {:#}", self.entry.uid, err);
        OrchestratorError::backend(err)
    }

    fn inference_request(
        &self,
        prompt: String,
        config: &GenerateConfig,
        extra_stop: &[String],
        extra_stop_ids: &[u32],
    ) -> InferenceRequest {
        let mut stop = config.stop.clone();
        for s in extra_stop {
            if !stop.contains(s) {
                stop.push(s.clone());
            }
        }
        let mut stop_token_ids = config.stop_token_ids.clone();
        for id in extra_stop_ids {
            if !stop_token_ids.contains(id) {
                stop_token_ids.push(*id);
            }
        }
        InferenceRequest {
            prompt,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            stop,
            stop_token_ids,
        }
    }

    /// Run a one-shot completion, failing fast if the model is terminated meanwhile.
    async fn run(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.ensure_running()?;
        let runtime = self.entry.runtime.clone();
        tokio::select! {
            biased;
            _ = terminated(self.entry.watch_terminated()) => {
                Err(OrchestratorError::TerminatedMidRequest(self.entry.uid.clone()))
            }
            result = runtime.generate(request) => result.map_err(|e| self.backend_error(e)),
        }
    }

    async fn open_stream(
        &self,
        request: InferenceRequest,
    ) -> Result<impl futures::Stream<Item = Result<crate::model_runtime::TokenDelta>> + Send + 'static> {
        self.ensure_running()?;
        let tokens = self
            .entry
            .runtime
            .generate_stream(request)
            .await
            .map_err(|e| self.backend_error(e))?;
        let uid = self.entry.uid.clone();
        Ok(tokens.map(move |delta| {
            delta.map_err(|e| {
                warn!("Backend failure mid-stream on model {}: {:#}", uid, e);
                OrchestratorError::backend(e)
            })
        }))
    }

    fn guard_stream<S, T>(&self, chunks: S) -> futures::stream::BoxStream<'static, Result<T>>
    where
        S: futures::Stream<Item = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        TerminationAware::new(self.entry.uid.clone(), chunks, self.entry.watch_terminated()).boxed()
    }
}

fn usage(response: &InferenceResponse) -> Usage {
    Usage {
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
        total_tokens: response.prompt_tokens + response.completion_tokens,
    }
}
