#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use serde_json::{json, Value};
use std::process;
use tracing::debug;
use tracing_subscriber::{
    prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use ::askdocs::{
    config::parse_temperature, openai::Prompt, ChatMessage, CompletionRequest, Config, EmbeddingRequest, LlmClient,
    ServiceMode,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Route calls to the GPT-4 pool and deployment
    #[arg(long, global = true)]
    gpt4: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Params {
    #[arg(long)]
    deployment: Option<String>,
    #[arg(long, value_parser = parse_temperature)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u16>,
    /// Number of candidate completions
    #[arg(short, default_value_t = 1)]
    n: u8,
    #[arg(long)]
    stop: Vec<String>,
}

impl Params {
    fn into_request(self, prompt: impl Into<Prompt>) -> CompletionRequest {
        let mut request = CompletionRequest::new(prompt).n(self.n);
        request.deployment = self.deployment;
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;

        if !self.stop.is_empty() {
            request = request.stop(self.stop);
        }

        request
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Complete {
        prompt: String,
        #[command(flatten)]
        params: Params,
    },
    Chat {
        question: String,
        #[arg(long)]
        system: Option<String>,
        #[command(flatten)]
        params: Params,
    },
    Embed {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        deployment: Option<String>,
    },
    Endpoints,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "askdocs=info,askdocs_cli=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if cli.gpt4 {
        config = config.gpt4();
    }
    debug!(mode = ?config.mode, endpoints = config.pool.len(), "Loaded configuration");

    let output = match cli.command {
        Commands::Endpoints => describe(&config),
        Commands::Complete { prompt, params } => {
            let completion = client(&config)?
                .dispatch(params.into_request(prompt))
                .await?;

            serde_json::to_value(completion)?
        }
        Commands::Chat {
            question,
            system,
            params,
        } => {
            let messages = system
                .map(ChatMessage::system)
                .into_iter()
                .chain([ChatMessage::user(question)])
                .collect::<Vec<_>>();
            let completion = client(&config)?
                .dispatch(params.into_request(messages))
                .await?;

            serde_json::to_value(completion)?
        }
        Commands::Embed { text, deployment } => {
            let mut request = EmbeddingRequest::new(text);
            request.deployment = deployment;

            serde_json::to_value(client(&config)?.embed(request).await?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn client(config: &Config) -> Result<LlmClient> {
    LlmClient::from_config(config).context("Failed to build client")
}

/// Summarizes where calls will go, without exposing keys.
fn describe(config: &Config) -> Value {
    let endpoints = match config.mode {
        ServiceMode::Pooled => config
            .pool
            .iter()
            .map(|endpoint| endpoint.base_url.clone())
            .collect::<Vec<_>>(),
        ServiceMode::SingleTenant => vec![config.service_url()],
    };

    let mode = match config.mode {
        ServiceMode::Pooled => "pooled",
        ServiceMode::SingleTenant => "single_tenant",
    };

    json!({
        "mode": mode,
        "strategy": config.strategy.to_string(),
        "endpoints": endpoints,
        "deployments": {
            "completion": config.deployments.completion,
            "chat": config.deployments.chat,
            "embedding": config.deployments.embedding,
        },
        "temperature": config.temperature(),
        "api_version": config.api_version,
    })
}
