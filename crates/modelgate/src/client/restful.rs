//! HTTP client for a running modelgate server.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::sse::decode_events;
use super::{InferenceClient, ModelApi};
use crate::catalog::{LaunchRequest, ModelFamily, RegistrationSummary};
use crate::orchestrator::ModelDescription;
use crate::prompt::ChatMessage;
use crate::types::*;

/// Every failure seen through the REST facade, transport or application,
/// collapses into this one kind; only the message tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("{0}")]
    Runtime(String),
}

impl ClientError {
    /// Build from the `error` member of a server error body.
    pub(crate) fn from_error_body(error: &Value) -> Self {
        match error.get("message").and_then(|m| m.as_str()) {
            Some(message) => ClientError::Runtime(message.to_string()),
            None => ClientError::Runtime(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Runtime(format!("HTTP error: {}", err))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub model_uid: String,
}

/// Turn a non-2xx response into a `ClientError` carrying the server's message.
async fn checked(resp: reqwest::Response, action: &str) -> Result<reqwest::Response, ClientError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| {
            body.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text });
    Err(ClientError::Runtime(format!("Failed to {}, detail: {}", action, detail)))
}

async fn json_body<T: DeserializeOwned>(resp: reqwest::Response, action: &str) -> Result<T, ClientError> {
    let resp = checked(resp, action).await?;
    resp.json()
        .await
        .map_err(|e| ClientError::Runtime(format!("Failed to {}, bad response: {}", action, e)))
}

#[derive(Clone)]
pub struct RestfulClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestfulClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl InferenceClient for RestfulClient {
    type Error = ClientError;
    type Handle = RestfulModelHandle;

    async fn list_models(&self) -> Result<Vec<ModelDescription>, ClientError> {
        let resp = self.client.get(self.url("/v1/models")).send().await?;
        json_body(resp, "list models").await
    }

    async fn launch_model(&self, request: LaunchRequest) -> Result<String, ClientError> {
        let resp = self
            .client
            .post(self.url("/v1/models"))
            .json(&request)
            .send()
            .await?;
        let launched: LaunchResponse = json_body(resp, "launch model").await?;
        Ok(launched.model_uid)
    }

    async fn get_model(&self, model_uid: &str) -> Result<RestfulModelHandle, ClientError> {
        let description = self.describe_model(model_uid).await?;
        Ok(RestfulModelHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            description,
        })
    }

    async fn describe_model(&self, model_uid: &str) -> Result<ModelDescription, ClientError> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/models/{}", model_uid)))
            .send()
            .await?;
        json_body(resp, "get model").await
    }

    async fn terminate_model(&self, model_uid: &str) -> Result<(), ClientError> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/models/{}", model_uid)))
            .send()
            .await?;
        checked(resp, "terminate model").await?;
        Ok(())
    }

    async fn register_model(&self, model: &str, persist: bool) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(self.url("/v1/model_registrations"))
            .json(&json!({ "model": model, "persist": persist }))
            .send()
            .await?;
        checked(resp, "register model").await?;
        Ok(())
    }

    async fn unregister_model(&self, model_name: &str) -> Result<(), ClientError> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/model_registrations/{}", model_name)))
            .send()
            .await?;
        checked(resp, "unregister model").await?;
        Ok(())
    }

    async fn list_model_registrations(&self) -> Result<Vec<RegistrationSummary>, ClientError> {
        let resp = self
            .client
            .get(self.url("/v1/model_registrations"))
            .send()
            .await?;
        json_body(resp, "list model registrations").await
    }

    async fn get_model_registration(&self, model_name: &str) -> Result<ModelFamily, ClientError> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/model_registrations/{}", model_name)))
            .send()
            .await?;
        json_body(resp, "get model registration").await
    }
}

/// Remote counterpart of `ModelHandle`.
#[derive(Clone)]
pub struct RestfulModelHandle {
    client: reqwest::Client,
    base_url: String,
    description: ModelDescription,
}

impl RestfulModelHandle {
    pub fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn url(&self, action: &str) -> String {
        format!("{}/v1/models/{}/{}", self.base_url, self.description.model_uid, action)
    }

    async fn request<T, C>(
        &self,
        action: &str,
        body: Value,
        stream: bool,
    ) -> Result<Generation<T, C, ClientError>, ClientError>
    where
        T: DeserializeOwned + Send,
        C: DeserializeOwned + Send + 'static,
    {
        let resp = self.client.post(self.url(action)).json(&body).send().await?;
        let resp = checked(resp, action).await?;
        if stream {
            return Ok(Generation::Stream(decode_events(resp.bytes_stream())));
        }
        let result = resp
            .json()
            .await
            .map_err(|e| ClientError::Runtime(format!("Failed to {}, bad response: {}", action, e)))?;
        Ok(Generation::Complete(result))
    }
}

#[async_trait]
impl ModelApi for RestfulModelHandle {
    type Error = ClientError;

    fn model_uid(&self) -> &str {
        &self.description.model_uid
    }

    async fn generate(
        &self,
        prompt: PromptArg,
        config: GenerateConfig,
    ) -> Result<Generation<Completion, CompletionChunk, ClientError>, ClientError> {
        let stream = config.stream;
        let body = json!({ "prompt": prompt, "generate_config": config });
        self.request("generate", body, stream).await
    }

    async fn chat(
        &self,
        prompt: PromptArg,
        system_prompt: Option<String>,
        chat_history: Vec<ChatMessage>,
        config: GenerateConfig,
    ) -> Result<Generation<ChatCompletion, ChatCompletionChunk, ClientError>, ClientError> {
        let stream = config.stream;
        let body = json!({
            "prompt": prompt,
            "system_prompt": system_prompt,
            "chat_history": chat_history,
            "generate_config": config,
        });
        self.request("chat", body, stream).await
    }

    async fn create_embedding(&self, input: EmbeddingInput) -> Result<Embedding, ClientError> {
        let resp = self
            .client
            .post(self.url("embeddings"))
            .json(&json!({ "input": input }))
            .send()
            .await?;
        json_body(resp, "create embedding").await
    }
}
