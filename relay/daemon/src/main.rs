//! Relay Daemon
//!
//! Serves the relay pipeline over WebSocket. Every connection can issue
//! commands and receives every stream message the relay publishes; clients
//! filter by channel id.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (127.0.0.1:8765, local Ollama)
//! relay-daemon
//!
//! # Custom listen address and Ollama host
//! relay-daemon --bind 0.0.0.0:9000 --ollama-host gpu-box
//!
//! # Explicit config file, no title generation
//! relay-daemon --config ./relay.toml --no-titles
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_CONFIG`: Path to the TOML config file
//! - `RELAY_BIND`: Listen address
//! - `OLLAMA_HOST` / `OLLAMA_PORT`: Ollama endpoint
//! - `OPENAI_API_KEY` / `OPENAI_BASE_URL`: Enables the OpenAI-compatible provider
//! - `RELAY_ENVIRONMENT`: Environment name stamped on request contexts
//! - `RUST_LOG`: Log filter (default `relay_core=info,relay_daemon=info`)
//!
//! # Signals
//!
//! - SIGINT (Ctrl+C): Stop accepting connections, then wait up to
//!   `--drain-timeout-secs` for running replies to finish

mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::{
    load_config, load_config_from_path, Broadcaster, ConfigOverrides, InteractionPipeline,
    MemoryStore, OllamaProvider, OpenAiProvider, RelayClient, RelayConfig, Stores, TaskRunner,
};

use server::{RelayServer, ServerSettings};

#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about = "Streaming reply relay over WebSocket")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Ollama host
    #[arg(long)]
    ollama_host: Option<String>,

    /// Ollama port
    #[arg(long)]
    ollama_port: Option<u16>,

    /// Do not generate conversation titles
    #[arg(long)]
    no_titles: bool,

    /// Seconds to wait for running replies on shutdown
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(bind) = &self.bind {
            overrides = overrides.with_bind(bind.clone());
        }
        if let Some(host) = &self.ollama_host {
            overrides = overrides.with_ollama_host(host.clone());
        }
        if let Some(port) = self.ollama_port {
            overrides = overrides.with_ollama_port(port);
        }
        if self.no_titles {
            overrides = overrides.with_generate_titles(false);
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_core=info,relay_daemon=info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        bind = %config.bind,
        environment = %config.service.environment,
        "Starting relay daemon"
    );

    let relay = build_relay(&config)?;
    let providers = relay.providers();
    if providers.is_empty() {
        warn!("No providers enabled; every message will fail with required_provider_missing");
    }
    for provider in &providers {
        info!(provider_id = %provider.id, provider_name = %provider.name, "Provider registered");
    }

    let store = MemoryStore::new();
    let pipeline = InteractionPipeline::new(
        relay,
        Broadcaster::new(config.broadcast),
        TaskRunner::new(),
        Stores::memory(&store),
        config.generation.clone(),
    );

    let settings = ServerSettings {
        read_timeout: config.read_timeout,
        service: config.service.clone(),
    };
    let server = RelayServer::bind(&config.bind, pipeline.clone(), settings).await?;

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    let runner = pipeline.runner();
    let drain = Duration::from_secs(args.drain_timeout_secs);
    if tokio::time::timeout(drain, runner.wait_idle()).await.is_ok() {
        info!("All replies finished");
    } else {
        warn!(
            active_jobs = runner.active_count(),
            "Shutting down with replies still running"
        );
    }

    info!("Relay daemon stopped");
    Ok(())
}

fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            load_config_from_path(Some(path.clone()))?
        }
        None => load_config()?,
    };
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_relay(config: &RelayConfig) -> Result<RelayClient> {
    let mut relay = RelayClient::default();
    if config.ollama.enabled {
        relay.register(Arc::new(OllamaProvider::from_config(&config.ollama)));
    }
    if let Some(openai) = OpenAiProvider::from_config(&config.openai)
        .context("Failed to configure the OpenAI provider")?
    {
        relay.register(Arc::new(openai));
    }
    Ok(relay)
}
