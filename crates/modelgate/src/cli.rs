//! Command line front end.
//!
//! Every subcommand but `serve` maps onto one `InferenceClient` call against a
//! running server. `generate` and `chat` read one prompt per line from the
//! input until an empty line or end of input.

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::io::{BufRead, Write};

use crate::catalog::{LaunchRequest, ModelFormat};
use crate::client::{InferenceClient, ModelApi, RestfulClient};
use crate::config::Config;
use crate::prompt::ChatMessage;
use crate::types::{GenerateConfig, Generation};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:9997";

#[derive(Debug, Parser)]
#[command(name = "modelgate", version, about = "Launch, query and terminate models on a modelgate server")]
pub struct Cli {
    /// Base URL of the server.
    #[arg(long, global = true, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelType {
    #[value(name = "LLM", alias = "llm")]
    Llm,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server, configured from the environment.
    Serve,
    Launch {
        #[arg(long)]
        model_name: String,
        #[arg(long)]
        size_in_billions: Option<u32>,
        #[arg(long)]
        model_format: Option<ModelFormat>,
        #[arg(long)]
        quantization: Option<String>,
        /// Run the model under this uid instead of a generated one.
        #[arg(long)]
        model_uid: Option<String>,
    },
    List {
        #[arg(long, value_enum, default_value = "LLM")]
        model_type: ModelType,
        /// Also list every launchable registration.
        #[arg(long)]
        all: bool,
    },
    Generate {
        #[arg(long)]
        model_uid: String,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long, action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
        stream: bool,
    },
    Chat {
        #[arg(long)]
        model_uid: String,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long, action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
        stream: bool,
    },
    CreateEmbedding {
        #[arg(long)]
        model_uid: String,
        #[arg(long)]
        input: String,
    },
    Terminate {
        #[arg(long)]
        model_uid: String,
    },
    Register {
        #[arg(long, value_enum, default_value = "LLM")]
        model_type: ModelType,
        /// Registration document, as JSON.
        #[arg(long)]
        model: String,
        #[arg(long, action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
        persist: bool,
    },
    Unregister {
        #[arg(long, value_enum, default_value = "LLM")]
        model_type: ModelType,
        #[arg(long)]
        model_name: String,
    },
    ListRegistrations {
        #[arg(long, value_enum, default_value = "LLM")]
        model_type: ModelType,
    },
}

/// Run a parsed command line against the server at `cli.endpoint`.
pub async fn run<R: BufRead, W: Write>(cli: Cli, input: &mut R, out: &mut W) -> Result<()> {
    if let Command::Serve = cli.command {
        return crate::server::run_server(Config::from_env()?).await;
    }
    let client = RestfulClient::new(&cli.endpoint);
    execute(&client, cli.command, input, out).await
}

/// Run one client command.
pub async fn execute<C, R, W>(client: &C, command: Command, input: &mut R, out: &mut W) -> Result<()>
where
    C: InferenceClient,
    R: BufRead,
    W: Write,
{
    match command {
        Command::Serve => anyhow::bail!("`serve` starts a server and has no client form"),
        Command::Launch {
            model_name,
            size_in_billions,
            model_format,
            quantization,
            model_uid,
        } => {
            let request = LaunchRequest {
                model_uid,
                model_name,
                model_size_in_billions: size_in_billions,
                model_format,
                quantization,
            };
            let uid = client.launch_model(request).await?;
            writeln!(out, "Model uid: {}", uid)?;
        }
        Command::List {
            model_type: ModelType::Llm,
            all,
        } => list(client, all, out).await?,
        Command::Generate {
            model_uid,
            max_tokens,
            stream,
        } => {
            let model = client.get_model(&model_uid).await?;
            while let Some(prompt) = read_prompt(input)? {
                match model.generate(prompt.into(), generate_config(stream, max_tokens)).await? {
                    Generation::Complete(completion) => {
                        let text = completion
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.text)
                            .unwrap_or_default();
                        writeln!(out, "{}", text)?;
                    }
                    Generation::Stream(mut chunks) => {
                        while let Some(chunk) = chunks.next().await {
                            for choice in chunk?.choices {
                                write!(out, "{}", choice.text)?;
                                out.flush()?;
                            }
                        }
                        writeln!(out)?;
                    }
                }
            }
        }
        Command::Chat {
            model_uid,
            max_tokens,
            stream,
        } => chat(client, &model_uid, max_tokens, stream, input, out).await?,
        Command::CreateEmbedding { model_uid, input: text } => {
            let model = client.get_model(&model_uid).await?;
            let embedding = model.create_embedding(text.as_str().into()).await?;
            for data in &embedding.data {
                writeln!(out, "{}", serde_json::to_string(&data.embedding)?)?;
            }
        }
        Command::Terminate { model_uid } => client.terminate_model(&model_uid).await?,
        Command::Register {
            model_type: ModelType::Llm,
            model,
            persist,
        } => client.register_model(&model, persist).await?,
        Command::Unregister {
            model_type: ModelType::Llm,
            model_name,
        } => client.unregister_model(&model_name).await?,
        Command::ListRegistrations {
            model_type: ModelType::Llm,
        } => {
            writeln!(out, "{:<24}{}", "Name", "Built-in")?;
            for registration in client.list_model_registrations().await? {
                writeln!(out, "{:<24}{}", registration.model_name, registration.is_builtin)?;
            }
        }
    }
    Ok(())
}

async fn list<C: InferenceClient, W: Write>(client: &C, all: bool, out: &mut W) -> Result<()> {
    writeln!(
        out,
        "{:<38}{:<16}{:<10}{:<6}{}",
        "UID", "Name", "Format", "Size", "Quantization"
    )?;
    for model in client.list_models().await? {
        writeln!(
            out,
            "{:<38}{:<16}{:<10}{:<6}{}",
            model.model_uid,
            model.model_name,
            model.model_format,
            format!("{}B", model.model_size_in_billions),
            model.quantization
        )?;
    }

    if all {
        writeln!(out)?;
        writeln!(out, "{:<24}{:<10}{}", "Registered", "Built-in", "Abilities")?;
        for registration in client.list_model_registrations().await? {
            let family = client.get_model_registration(&registration.model_name).await?;
            let abilities: Vec<&str> = family.model_ability.iter().map(|a| a.name()).collect();
            writeln!(
                out,
                "{:<24}{:<10}{}",
                registration.model_name,
                registration.is_builtin,
                abilities.join(",")
            )?;
        }
    }
    Ok(())
}

async fn chat<C, R, W>(
    client: &C,
    model_uid: &str,
    max_tokens: Option<u32>,
    stream: bool,
    input: &mut R,
    out: &mut W,
) -> Result<()>
where
    C: InferenceClient,
    R: BufRead,
    W: Write,
{
    let model = client.get_model(model_uid).await?;
    let description = client.describe_model(model_uid).await?;
    let family = client.get_model_registration(&description.model_name).await?;
    let style = family
        .prompt_style
        .with_context(|| format!("model {} has no chat prompt style", description.model_name))?;
    let (user_role, assistant_role) = (style.user_role().to_string(), style.assistant_role().to_string());

    let mut history: Vec<ChatMessage> = Vec::new();
    while let Some(prompt) = read_prompt(input)? {
        let config = generate_config(stream, max_tokens);
        let reply = match model
            .chat(prompt.clone().into(), None, history.clone(), config)
            .await?
        {
            Generation::Complete(completion) => {
                let reply = completion
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .unwrap_or_default();
                writeln!(out, "{}", reply)?;
                reply
            }
            Generation::Stream(mut chunks) => {
                let mut reply = String::new();
                while let Some(chunk) = chunks.next().await {
                    for choice in chunk?.choices {
                        if let Some(content) = choice.delta.content {
                            write!(out, "{}", content)?;
                            out.flush()?;
                            reply.push_str(&content);
                        }
                    }
                }
                writeln!(out)?;
                reply
            }
        };
        history.push(ChatMessage::new(user_role.as_str(), prompt));
        history.push(ChatMessage::new(assistant_role.as_str(), reply));
    }
    Ok(())
}

fn generate_config(stream: bool, max_tokens: Option<u32>) -> GenerateConfig {
    let config = GenerateConfig {
        stream,
        ..Default::default()
    };
    match max_tokens {
        Some(n) => config.with_max_tokens(n),
        None => config,
    }
}

/// Next non-empty line, or `None` at an empty line or end of input.
fn read_prompt<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::client::Client;
    use crate::model_runtime::EchoRuntimeFactory;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use std::io::Cursor;
    use std::sync::Arc;

    fn local_client() -> Client {
        Client::new(Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(ModelCatalog::with_builtin().unwrap()),
            Arc::new(EchoRuntimeFactory::new()),
        )))
    }

    async fn exec(client: &Client, args: &[&str], stdin: &str) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("modelgate").chain(args.iter().copied()))?;
        let mut input = Cursor::new(stdin.as_bytes().to_vec());
        let mut out = Vec::new();
        execute(client, cli.command, &mut input, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "modelgate",
            "launch",
            "--endpoint",
            "http://localhost:1234",
            "--model-name",
            "orca",
            "--size-in-billions",
            "3",
            "--model-format",
            "ggmlv3",
            "--quantization",
            "q4_0",
        ])
        .unwrap();
        assert_eq!(cli.endpoint, "http://localhost:1234");
        match cli.command {
            Command::Launch {
                model_name,
                size_in_billions,
                model_format,
                ..
            } => {
                assert_eq!(model_name, "orca");
                assert_eq!(size_in_billions, Some(3));
                assert_eq!(model_format, Some(ModelFormat::Ggmlv3));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["modelgate", "generate", "--model-uid", "m", "--stream", "True"]).unwrap();
        assert!(matches!(cli.command, Command::Generate { stream: true, .. }));

        let cli = Cli::try_parse_from([
            "modelgate",
            "register",
            "--model-type",
            "LLM",
            "--model",
            "{}",
            "--persist",
            "False",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Register { persist: false, .. }));
        assert!(Cli::try_parse_from(["modelgate", "list", "--model-type", "audio"]).is_err());
    }

    #[tokio::test]
    async fn test_launch_generate_and_terminate() {
        let client = local_client();
        let out = exec(
            &client,
            &["launch", "--model-name", "orca", "--size-in-billions", "3", "--quantization", "q4_0"],
            "",
        )
        .await
        .unwrap();
        let uid = out.split("Model uid: ").nth(1).unwrap().trim().to_string();
        assert!(!uid.is_empty());

        let listed = exec(&client, &["list"], "").await.unwrap();
        assert!(listed.contains(&uid));

        for stream in ["true", "false"] {
            let out = exec(
                &client,
                &["generate", "--model-uid", &uid, "--stream", stream],
                "Once upon a time\nthere was\n\nignored after the blank line\n",
            )
            .await
            .unwrap();
            assert_eq!(out, "Once upon a time\nthere was\n");
        }

        exec(&client, &["terminate", "--model-uid", &uid], "").await.unwrap();
        let listed = exec(&client, &["list"], "").await.unwrap();
        assert!(!listed.contains(&uid));
        assert!(exec(&client, &["terminate", "--model-uid", &uid], "").await.is_err());
    }

    #[tokio::test]
    async fn test_chat_keeps_history() {
        let client = local_client();
        let uid = client.launch_model(LaunchRequest::new("orca")).await.unwrap();
        let out = exec(
            &client,
            &["chat", "--model-uid", &uid, "--stream", "true", "--max-tokens", "4096"],
            "Write a poem.\nAnother one\n\n",
        )
        .await
        .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        // The echo backend replays the rendered prompt, so the second reply
        // carries the first exchange.
        assert!(lines[1].contains("Write a poem."));
        assert!(lines[1].contains("Another one"));
    }

    #[tokio::test]
    async fn test_create_embedding_prints_vector() {
        let client = local_client();
        let uid = client.launch_model(LaunchRequest::new("orca")).await.unwrap();
        let out = exec(
            &client,
            &["create-embedding", "--model-uid", &uid, "--input", "The food was delicious"],
            "",
        )
        .await
        .unwrap();
        let vector: Vec<f32> = serde_json::from_str(out.trim()).unwrap();
        assert!(!vector.is_empty());
    }
}
