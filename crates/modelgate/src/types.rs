//! Request and result shapes shared by the in-process and RESTful surfaces.
//!
//! Results follow the OpenAI completion/chat/embedding layouts so streamed
//! chunks and one-shot results carry the same choice bookkeeping.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::prompt::ChatMessage;

fn default_max_tokens() -> u32 {
    256
}

/// Recognised generation options. Unknown keys are rejected on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_token_ids: Vec<u32>,
    #[serde(default)]
    pub stream: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: None,
            top_p: None,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            stream: false,
        }
    }
}

impl GenerateConfig {
    pub fn streaming() -> Self {
        Self {
            stream: true,
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Parse a loosely-typed configuration bag, as received over HTTP.
    pub fn from_value(value: Option<Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(v @ Value::Object(_)) => serde_json::from_value(v)
                .map_err(|e| OrchestratorError::InvalidArgument(format!("generate_config: {}", e))),
            Some(other) => Err(OrchestratorError::InvalidArgument(format!(
                "generate_config must be an object, got {}",
                json_type(&other)
            ))),
        }
    }
}

/// The prompt argument of `generate`/`chat` as handed to a facade.
///
/// Kept as raw JSON so both facades can receive exactly what a caller passed
/// and reject anything that is not a string, rather than coercing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptArg(pub Value);

impl PromptArg {
    pub fn into_text(self) -> Result<String> {
        match self.0 {
            Value::String(s) => Ok(s),
            other => Err(OrchestratorError::InvalidArgument(format!(
                "prompt must be a string, got {}",
                json_type(&other)
            ))),
        }
    }
}

impl From<&str> for PromptArg {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for PromptArg {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl From<Value> for PromptArg {
    fn from(v: Value) -> Self {
        Self(v)
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s],
            Self::Batch(v) => v,
        }
    }
}

impl From<&str> for EmbeddingInput {
    fn from(s: &str) -> Self {
        Self::Single(s.to_string())
    }
}

impl From<Vec<String>> for EmbeddingInput {
    fn from(v: Vec<String>) -> Self {
        Self::Batch(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub index: u32,
    pub object: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub model: String,
    pub data: Vec<EmbeddingData>,
    pub usage: Usage,
}

/// Outcome of a generate or chat call: a finished result, or a lazy,
/// single-use stream of chunks when `stream` was requested.
pub enum Generation<T, C, E = OrchestratorError> {
    Complete(T),
    Stream(BoxStream<'static, std::result::Result<C, E>>),
}

impl<T, C, E> Generation<T, C, E> {
    pub fn is_stream(&self) -> bool {
        matches!(self, Generation::Stream(_))
    }

    pub fn into_complete(self) -> Option<T> {
        match self {
            Generation::Complete(result) => Some(result),
            Generation::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<BoxStream<'static, std::result::Result<C, E>>> {
        match self {
            Generation::Stream(stream) => Some(stream),
            Generation::Complete(_) => None,
        }
    }
}

impl<T: std::fmt::Debug, C, E> std::fmt::Debug for Generation<T, C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::Complete(result) => f.debug_tuple("Complete").field(result).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
