//! Model runtime
//!
//! Backends that actually execute a launched model, behind one trait:
//! - `EchoRuntime`: deterministic in-process backend
//! - `LlamaServerRuntime`: llama.cpp server over its OpenAI-compatible HTTP API
//!
//! The orchestrator only ever sees `dyn ModelRuntime` built by an injected
//! `RuntimeFactory`.
pub mod runtime_trait;
pub mod echo_runtime;
pub mod llama_server_runtime;

pub use runtime_trait::{
    InferenceRequest, InferenceResponse, ModelRuntime, RuntimeConfig, RuntimeFactory,
    RuntimeMetadata, TokenDelta, TokenStream,
};
pub use echo_runtime::{EchoRuntime, EchoRuntimeFactory};
pub use llama_server_runtime::{LlamaServerRuntime, LlamaServerRuntimeFactory, LlamaServerSettings};
