pub mod api;
pub mod catalog;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model_runtime;
pub mod orchestrator;
pub mod prompt;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod types;

// Public API exports
pub use catalog::{LaunchRequest, ModelCatalog, ModelFamily};
pub use client::{Client, ClientError, InferenceClient, ModelApi, RestfulClient};
pub use config::Config;
pub use error::OrchestratorError;
pub use orchestrator::{ModelDescription, ModelHandle, Orchestrator, OrchestratorConfig};
pub use server::{build_router, run_server};
pub use state::AppState;
pub use types::{GenerateConfig, Generation};
