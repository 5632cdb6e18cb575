#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use modelgate::catalog::ModelCatalog;
use modelgate::model_runtime::EchoRuntimeFactory;
use modelgate::{build_router, AppState, Orchestrator, OrchestratorConfig};

pub const CUSTOM_MODEL: &str = r#"{
  "version": 1,
  "model_name": "custom_model",
  "model_lang": ["en", "zh"],
  "model_ability": ["embed", "chat"],
  "model_specs": [
    {
      "model_format": "pytorch",
      "model_size_in_billions": 7,
      "quantizations": ["4-bit", "8-bit", "none"],
      "model_id": "ziqingyang/chinese-alpaca-2-7b"
    }
  ],
  "prompt_style": {
    "style_name": "ADD_COLON_SINGLE",
    "system_prompt": "Below is an instruction that describes a task. Write a response that appropriately completes the request.",
    "roles": ["Instruction", "Response"],
    "intra_message_sep": "\n\n### "
  }
}"#;

pub struct TestServer {
    pub endpoint: String,
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn spawn_server(max_running_models: usize, factory: EchoRuntimeFactory) -> TestServer {
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig { max_running_models },
        Arc::new(ModelCatalog::with_builtin().unwrap()),
        Arc::new(factory),
    ));
    let app = build_router(
        AppState::new(orchestrator.clone()),
        Duration::from_secs(30),
        64,
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        endpoint: format!("http://{}", addr),
        orchestrator,
    }
}
