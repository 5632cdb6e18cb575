//! In-process facade over an `Orchestrator`.

use async_trait::async_trait;
use std::sync::Arc;

use super::{InferenceClient, ModelApi};
use crate::catalog::{LaunchRequest, ModelFamily, RegistrationSummary};
use crate::error::OrchestratorError;
use crate::orchestrator::{
    ChatGeneration, CompletionGeneration, ModelDescription, ModelHandle, Orchestrator,
};
use crate::prompt::ChatMessage;
use crate::types::{Embedding, EmbeddingInput, GenerateConfig, PromptArg};

#[derive(Clone)]
pub struct Client {
    orchestrator: Arc<Orchestrator>,
}

impl Client {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

#[async_trait]
impl InferenceClient for Client {
    type Error = OrchestratorError;
    type Handle = ModelHandle;

    async fn list_models(&self) -> Result<Vec<ModelDescription>, Self::Error> {
        Ok(self.orchestrator.list())
    }

    async fn launch_model(&self, request: LaunchRequest) -> Result<String, Self::Error> {
        self.orchestrator.launch(request).await
    }

    async fn get_model(&self, model_uid: &str) -> Result<ModelHandle, Self::Error> {
        self.orchestrator.get(model_uid)
    }

    async fn describe_model(&self, model_uid: &str) -> Result<ModelDescription, Self::Error> {
        self.orchestrator.describe(model_uid)
    }

    async fn terminate_model(&self, model_uid: &str) -> Result<(), Self::Error> {
        self.orchestrator.terminate(model_uid).await
    }

    async fn register_model(&self, model: &str, persist: bool) -> Result<(), Self::Error> {
        self.orchestrator.register_model(model, persist)
    }

    async fn unregister_model(&self, model_name: &str) -> Result<(), Self::Error> {
        self.orchestrator.unregister_model(model_name)
    }

    async fn list_model_registrations(&self) -> Result<Vec<RegistrationSummary>, Self::Error> {
        Ok(self.orchestrator.list_model_registrations())
    }

    async fn get_model_registration(&self, model_name: &str) -> Result<ModelFamily, Self::Error> {
        self.orchestrator.get_model_registration(model_name)
    }
}

#[async_trait]
impl ModelApi for ModelHandle {
    type Error = OrchestratorError;

    fn model_uid(&self) -> &str {
        self.uid()
    }

    async fn generate(
        &self,
        prompt: PromptArg,
        config: GenerateConfig,
    ) -> Result<CompletionGeneration, Self::Error> {
        ModelHandle::generate(self, prompt, config).await
    }

    async fn chat(
        &self,
        prompt: PromptArg,
        system_prompt: Option<String>,
        chat_history: Vec<ChatMessage>,
        config: GenerateConfig,
    ) -> Result<ChatGeneration, Self::Error> {
        ModelHandle::chat(self, prompt, system_prompt, chat_history, config).await
    }

    async fn create_embedding(&self, input: EmbeddingInput) -> Result<Embedding, Self::Error> {
        ModelHandle::create_embedding(self, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::model_runtime::EchoRuntimeFactory;
    use crate::orchestrator::OrchestratorConfig;
    use futures::StreamExt;
    use serde_json::json;

    fn client() -> Client {
        Client::new(Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(ModelCatalog::with_builtin().unwrap()),
            Arc::new(EchoRuntimeFactory::new()),
        )))
    }

    #[tokio::test]
    async fn test_local_client_flow() {
        let client = client();
        assert!(client.list_models().await.unwrap().is_empty());

        let uid = client
            .launch_model(LaunchRequest::new("orca").with_size(3).with_quantization("q4_0"))
            .await
            .unwrap();
        assert_eq!(client.list_models().await.unwrap().len(), 1);

        let model = client.get_model(&uid).await.unwrap();
        let completion = ModelApi::chat(
            &model,
            "write a poem.".into(),
            None,
            vec![],
            GenerateConfig::default(),
        )
        .await
        .unwrap()
        .into_complete()
        .unwrap();
        assert!(!completion.choices[0].message.content.is_empty());

        let embedding = ModelApi::create_embedding(
            &model,
            "The food was delicious and the waiter...".into(),
        )
        .await
        .unwrap();
        assert!(!embedding.data[0].embedding.is_empty());

        client.terminate_model(&uid).await.unwrap();
        assert!(client.list_models().await.unwrap().is_empty());
        assert!(matches!(
            client.terminate_model(&uid).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_client_rejects_config_as_prompt() {
        let client = client();
        let uid = client.launch_model(LaunchRequest::new("orca")).await.unwrap();
        let model = client.get_model(&uid).await.unwrap();

        let err = ModelApi::generate(&model, json!({"max_tokens": 64}).into(), GenerateConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));

        let chunks: Vec<_> = ModelApi::generate(&model, "one two".into(), GenerateConfig::streaming())
            .await
            .unwrap()
            .into_stream()
            .unwrap()
            .collect()
            .await;
        assert!(chunks.iter().all(|c| c.is_ok()));
    }
}
