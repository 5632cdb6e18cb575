//! Client facades
//!
//! Two front doors with one contract: `Client` calls an in-process
//! `Orchestrator`; `RestfulClient` talks to a running server over HTTP and
//! decodes streamed responses from server-sent events.

pub mod local;
pub mod restful;
mod sse;

pub use local::Client;
pub use restful::{ClientError, RestfulClient, RestfulModelHandle};

use async_trait::async_trait;

use crate::catalog::{LaunchRequest, ModelFamily, RegistrationSummary};
use crate::orchestrator::ModelDescription;
use crate::prompt::ChatMessage;
use crate::types::{
    ChatCompletion, ChatCompletionChunk, Completion, CompletionChunk, Embedding, EmbeddingInput,
    GenerateConfig, Generation, PromptArg,
};

/// Lifecycle and registration operations.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Handle: ModelApi<Error = Self::Error>;

    async fn list_models(&self) -> Result<Vec<ModelDescription>, Self::Error>;

    async fn launch_model(&self, request: LaunchRequest) -> Result<String, Self::Error>;

    async fn get_model(&self, model_uid: &str) -> Result<Self::Handle, Self::Error>;

    async fn describe_model(&self, model_uid: &str) -> Result<ModelDescription, Self::Error>;

    async fn terminate_model(&self, model_uid: &str) -> Result<(), Self::Error>;

    /// Register a custom model from its JSON description.
    async fn register_model(&self, model: &str, persist: bool) -> Result<(), Self::Error>;

    async fn unregister_model(&self, model_name: &str) -> Result<(), Self::Error>;

    async fn list_model_registrations(&self) -> Result<Vec<RegistrationSummary>, Self::Error>;

    async fn get_model_registration(&self, model_name: &str) -> Result<ModelFamily, Self::Error>;
}

/// Requests against one running model.
#[async_trait]
pub trait ModelApi: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn model_uid(&self) -> &str;

    async fn generate(
        &self,
        prompt: PromptArg,
        config: GenerateConfig,
    ) -> Result<Generation<Completion, CompletionChunk, Self::Error>, Self::Error>;

    async fn chat(
        &self,
        prompt: PromptArg,
        system_prompt: Option<String>,
        chat_history: Vec<ChatMessage>,
        config: GenerateConfig,
    ) -> Result<Generation<ChatCompletion, ChatCompletionChunk, Self::Error>, Self::Error>;

    async fn create_embedding(&self, input: EmbeddingInput) -> Result<Embedding, Self::Error>;
}
