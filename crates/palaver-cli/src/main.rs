use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::{Config, SpeechKind};
use palaver_core::{builtin_tools, ChannelGateway, TriggerQueue};
use palaver_provider::{
    register_from_configs, AssistantClient, OpenAiSpeech, ProviderRegistry, SpeechRegistry,
    StubSpeech,
};
use palaver_server::{AppState, Registry};
use palaver_store::SessionStore;

#[derive(Parser)]
#[command(name = "palaver", version, about = "conversational experiment platform")]
struct Cli {
    #[arg(long, default_value = "palaver.yaml", help = "Path to the config file")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the webhook server for all configured channels")]
    Start {
        #[arg(long, default_value = "0.0.0.0:3000", help = "Listen address")]
        addr: String,
    },
    #[command(about = "Validate the config file and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,palaver_core=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::CheckConfig => {
            Config::load(&cli.config)?;
            println!("config ok: {}", cli.config.display());
            Ok(())
        }
        Commands::Start { addr } => start(&cli.config, &addr).await,
    }
}

async fn start(config_path: &PathBuf, addr: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = SessionStore::open(&config.store_path)?;

    // Routing edges live in the store so the pipeline can tag sub-route
    // output without the config in hand.
    for route in &config.routes {
        for experiment in &config.experiments {
            if experiment.id == route.parent_id {
                store
                    .upsert_route(&experiment.team, &route.parent_id, &route.child_id, &route.keyword)
                    .await?;
            }
        }
    }

    let mut providers = ProviderRegistry::new();
    register_from_configs(&mut providers, &config.providers)?;

    let mut speech = SpeechRegistry::new();
    for entry in &config.speech_providers {
        match entry.kind {
            SpeechKind::OpenAI => {
                let key = entry
                    .api_key
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("speech provider {} requires api_key", entry.id))?;
                let base = entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into());
                speech.register(&entry.id, Arc::new(OpenAiSpeech::new(key, base)));
            }
            SpeechKind::Stub => {
                speech.register(&entry.id, Arc::new(StubSpeech::default()));
            }
        }
        tracing::info!("registered speech provider: {}", entry.id);
    }

    let (triggers, mut trigger_rx) = TriggerQueue::channel(256);
    tokio::spawn(async move {
        // Placeholder consumer: downstream jobs subscribe here.
        while let Some((session_id, trigger)) = trigger_rx.recv().await {
            tracing::debug!(session_id, ?trigger, "session trigger");
        }
    });

    let mut gateway = ChannelGateway::new(
        store.clone(),
        providers,
        speech,
        builtin_tools(&store),
        Arc::new(triggers),
    );
    if let Some(assistant) = &config.assistant {
        let base = assistant
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        gateway = gateway.with_assistant_client(AssistantClient::new(&assistant.api_key, base));
    }

    let state = AppState {
        gateway: Arc::new(gateway),
        registry: Arc::new(Registry::new(config.experiments, config.channels)),
    };

    palaver_server::serve(state, addr).await
}
