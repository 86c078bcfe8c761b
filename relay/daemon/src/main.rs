//! Relay Daemon
//!
//! Web front-end for a local text-generation engine. Launches the engine as a
//! child process, serves a chat page, and streams each answer to the browser
//! one character at a time while recording the conversation in SQLite.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (engine ./chat, listening on 127.0.0.1:9600)
//! relay-daemon
//!
//! # Custom engine and sampling parameters
//! relay-daemon --engine-command ./gpt4all-lora-quantized --temp 0.7 --n-predict 256
//!
//! # From a config file, with verbose logging
//! relay-daemon --config relay.toml --debug
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_CONFIG`: Config file path
//! - `RELAY_HOST`, `RELAY_PORT`: Listen address
//! - `RELAY_ENGINE_COMMAND`: Engine executable
//! - `RELAY_DB_PATH`: SQLite database file
//! - `RELAY_INITIAL_TIMEOUT_MS`, `RELAY_IDLE_TIMEOUT_MS`: Streaming timeouts
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (stops the engine process)

mod handlers;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;

use relay_core::{
    load_config, ChatService, ConfigOverrides, ConfigSource, ConversationStore, ProcessEngine,
    Relay,
};

use crate::server::{build_app, serve, AppState};

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about = "Stream a local generation engine to the browser")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Hostname to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Generation engine executable
    #[arg(long)]
    engine_command: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Sampling temperature
    #[arg(long)]
    temp: Option<f32>,

    /// Number of tokens to predict per response
    #[arg(long, alias = "n_predict")]
    n_predict: Option<u32>,

    /// Top-k sampling
    #[arg(long, alias = "top_k")]
    top_k: Option<u32>,

    /// Top-p sampling
    #[arg(long, alias = "top_p")]
    top_p: Option<f32>,

    /// Penalty for repeated tokens
    #[arg(long, alias = "repeat_penalty")]
    repeat_penalty: Option<f32>,

    /// Number of previous tokens considered for the repeat penalty
    #[arg(long, alias = "repeat_last_n")]
    repeat_last_n: Option<u32>,

    /// Context window size
    #[arg(long, alias = "ctx_size")]
    ctx_size: Option<u32>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            debug: self.debug.then_some(true),
            engine_command: self.engine_command.clone(),
            db_path: self.db_path.clone(),
            temp: self.temp,
            n_predict: self.n_predict,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            ctx_size: self.ctx_size,
        }
    }
}

fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("relay_daemon={level}").parse()?)
                .add_directive(format!("relay_core={level}").parse()?)
                .add_directive(format!("tower_http={level}").parse()?),
        )
        .with_target(true)
        .init();
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, source) =
        load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let config = config.with_env().with_overrides(args.overrides());

    init_tracing(config.server.debug)?;

    info!("Starting relay daemon");
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Loaded configuration"),
        ConfigSource::Defaults => info!("Using default configuration"),
    }

    let store = ConversationStore::open(&config.store.db_path).with_context(|| {
        format!(
            "Failed to open conversation store at {}",
            config.store.db_path.display()
        )
    })?;

    let engine = ProcessEngine::from_config(&config.engine, &config.generation);
    info!(
        command = %config.engine.command.display(),
        args = ?engine.args(),
        "Launching generation engine"
    );
    let relay = Arc::new(Relay::new(engine, config.streaming.clone()));
    relay
        .start()
        .await
        .context("Failed to start generation engine")?;

    let app = build_app(AppState {
        chat: Arc::new(ChatService::new(store, Arc::clone(&relay))),
    });

    let served = serve(
        &config.server.host,
        config.server.port,
        app,
        shutdown_signal(),
    )
    .await;

    info!("Performing graceful shutdown...");
    relay.shutdown().await;

    served?;
    info!("Relay daemon stopped cleanly");
    Ok(())
}
