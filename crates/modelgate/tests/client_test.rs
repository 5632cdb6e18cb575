mod common;

use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

use common::{spawn_server, CUSTOM_MODEL};
use modelgate::model_runtime::EchoRuntimeFactory;
use modelgate::{ClientError, GenerateConfig, InferenceClient, LaunchRequest, ModelApi, RestfulClient};

fn orca() -> LaunchRequest {
    LaunchRequest::new("orca")
        .with_size(3)
        .with_format(modelgate::catalog::ModelFormat::Ggmlv3)
        .with_quantization("q4_0")
}

fn message(err: ClientError) -> String {
    match err {
        ClientError::Runtime(message) => message,
    }
}

#[tokio::test]
async fn test_restful_lifecycle() {
    let server = spawn_server(4, EchoRuntimeFactory::new()).await;
    let client = RestfulClient::new(&server.endpoint);

    assert!(client.list_models().await.unwrap().is_empty());
    let uid = client.launch_model(orca()).await.unwrap();

    let models = client.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].model_uid, uid);
    assert_eq!(models[0].model_size_in_billions, 3);
    assert_eq!(models[0].quantization, "q4_0");

    let model = client.get_model(&uid).await.unwrap();
    assert_eq!(model.model_uid(), uid);

    let completion = model
        .generate("Once upon a time, there was a very old computer".into(), GenerateConfig::default())
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(completion.choices[0].text, "Once upon a time, there was a very old computer");
    assert_eq!(completion.model, uid);
    assert!(completion.usage.total_tokens > 0);

    let chunks: Vec<_> = model
        .generate("Once upon a time".into(), GenerateConfig::streaming())
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;
    let streamed: String = chunks
        .into_iter()
        .map(|c| c.unwrap().choices[0].text.clone())
        .collect();
    assert_eq!(streamed, "Once upon a time");

    let chat = model
        .chat("Write a poem.".into(), None, vec![], GenerateConfig::default())
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert_eq!(chat.choices[0].message.role, "Response");

    let chunks: Vec<_> = model
        .chat("Write a poem.".into(), None, vec![], GenerateConfig::streaming())
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;
    let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();
    assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("Response"));
    let streamed: String = chunks
        .iter()
        .filter_map(|c| c.choices[0].delta.content.clone())
        .collect();
    assert_eq!(streamed, chat.choices[0].message.content);

    let embedding = model
        .create_embedding("The food was delicious and the waiter...".into())
        .await
        .unwrap();
    assert_eq!(embedding.data.len(), 1);
    assert!(!embedding.data[0].embedding.is_empty());

    client.terminate_model(&uid).await.unwrap();
    assert!(client.list_models().await.unwrap().is_empty());

    let err = message(client.terminate_model(&uid).await.unwrap_err());
    assert!(err.contains("not found"), "{}", err);
    let err = message(
        model
            .generate("after terminate".into(), GenerateConfig::default())
            .await
            .unwrap_err(),
    );
    assert!(err.contains("not found"), "{}", err);
}

#[tokio::test]
async fn test_invalid_arguments_are_reported() {
    let server = spawn_server(4, EchoRuntimeFactory::new()).await;
    let client = RestfulClient::new(&server.endpoint);
    let uid = client.launch_model(orca()).await.unwrap();
    let model = client.get_model(&uid).await.unwrap();

    let err = message(
        model
            .generate(json!({"max_tokens": 64}).into(), GenerateConfig::default())
            .await
            .unwrap_err(),
    );
    assert!(err.starts_with("Failed to generate"), "{}", err);
    assert!(err.contains("prompt must be a string"), "{}", err);

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{}/v1/models/{}/generate", server.endpoint, uid))
        .json(&json!({"prompt": "hi", "generate_config": {"max_tokens": 4, "beam_width": 2}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_argument");

    let err = message(client.launch_model(LaunchRequest::new("no-such-model")).await.unwrap_err());
    assert!(err.contains("unknown model name"), "{}", err);
    assert_eq!(client.list_models().await.unwrap().len(), 1);

    let resp = http
        .get(format!("{}/v1/models/missing", server.endpoint))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_capacity_and_duplicate_uid() {
    let server = spawn_server(1, EchoRuntimeFactory::new()).await;
    let client = RestfulClient::new(&server.endpoint);

    let uid = client.launch_model(orca().with_uid("my-orca")).await.unwrap();
    assert_eq!(uid, "my-orca");

    let err = message(client.launch_model(orca().with_uid("my-orca")).await.unwrap_err());
    assert!(err.contains("duplicate name"), "{}", err);

    let err = message(client.launch_model(orca()).await.unwrap_err());
    assert!(err.contains("resource exhausted"), "{}", err);

    client.terminate_model(&uid).await.unwrap();
    client.launch_model(orca()).await.unwrap();
}

#[tokio::test]
async fn test_terminate_interrupts_stream() {
    let factory = EchoRuntimeFactory::new().with_token_delay(Duration::from_millis(25));
    let server = spawn_server(4, factory.clone()).await;
    let client = RestfulClient::new(&server.endpoint);
    let uid = client.launch_model(orca()).await.unwrap();
    let model = client.get_model(&uid).await.unwrap();

    let prompt = vec!["token"; 200].join(" ");
    let mut stream = model
        .generate(prompt.into(), GenerateConfig::streaming())
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    client.terminate_model(&uid).await.unwrap();

    let mut saw_error = None;
    while let Some(item) = stream.next().await {
        if let Err(e) = item {
            saw_error = Some(message(e));
            break;
        }
    }
    let err = saw_error.expect("stream should fail after terminate");
    assert!(err.contains("terminated"), "{}", err);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.in_flight(), 0);
}

#[tokio::test]
async fn test_restful_registrations() {
    let server = spawn_server(4, EchoRuntimeFactory::new()).await;
    let client = RestfulClient::new(&server.endpoint);

    client.register_model(CUSTOM_MODEL, false).await.unwrap();
    let registrations = client.list_model_registrations().await.unwrap();
    assert!(registrations
        .iter()
        .any(|r| r.model_name == "custom_model" && !r.is_builtin));

    let err = message(client.register_model(CUSTOM_MODEL, false).await.unwrap_err());
    assert!(err.contains("duplicate name"), "{}", err);

    let family = client.get_model_registration("custom_model").await.unwrap();
    assert_eq!(family.model_specs[0].model_size_in_billions, 7);

    let uid = client
        .launch_model(LaunchRequest::new("custom_model").with_quantization("8-bit"))
        .await
        .unwrap();
    let model = client.get_model(&uid).await.unwrap();
    let reply = model
        .chat("Tell a story".into(), None, vec![], GenerateConfig::default())
        .await
        .unwrap()
        .into_complete()
        .unwrap();
    assert!(reply.choices[0].message.content.contains("### Instruction: Tell a story"));
    client.terminate_model(&uid).await.unwrap();

    client.unregister_model("custom_model").await.unwrap();
    assert!(!client
        .list_model_registrations()
        .await
        .unwrap()
        .iter()
        .any(|r| r.model_name == "custom_model"));
    assert!(client.unregister_model("custom_model").await.is_err());
    assert!(client.unregister_model("orca").await.is_err());
}

#[tokio::test]
async fn test_ambient_endpoints() {
    let server = spawn_server(3, EchoRuntimeFactory::new()).await;
    let client = RestfulClient::new(&server.endpoint);
    client.launch_model(orca()).await.unwrap();

    let http = reqwest::Client::new();
    let health: Value = http
        .get(format!("{}/healthz", server.endpoint))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let status: Value = http
        .get(format!("{}/v1/status", server.endpoint))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["running_models"], 1);
    assert_eq!(status["max_running_models"], 3);
    assert!(status["requests"]["total_requests"].as_u64().unwrap() >= 1);

    let metrics = http
        .get(format!("{}/metrics", server.endpoint))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);
    assert_eq!(server.orchestrator.running_count(), 1);
}
