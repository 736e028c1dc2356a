#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agentmux
//!
//! Serves reattachable terminal, chat and remote shell sessions to browsers
//! over one multiplexed WebSocket per client.
//!
//! ## Subcommands
//!
//! - `agentmux serve` (default) — run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                  | Auth   | Description                       |
//! |--------|-----------------------|--------|-----------------------------------|
//! | GET    | `/api/health`         | No     | Liveness probe                    |
//! | GET    | `/api/sessions`       | Yes    | Live session summaries            |
//! | DELETE | `/api/sessions/{id}`  | Yes    | Terminate a session               |
//! | GET    | `/api/ws`             | In-band| Multiplexed session WebSocket     |

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use agentmux::chat::log;
use agentmux::store::FileStore;
use agentmux::{AppState, Config};

/// Browser access to long-lived agent sessions.
#[derive(Parser)]
#[command(name = "agentmux", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("agentmux: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("agentmux v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set AGENTMUX_API_KEY or update config");
    }

    let data_dir = config.data_dir();
    info!("Data dir: {}", data_dir.display());
    let removed = log::cleanup_empty_logs(&log::chat_dir(&data_dir)).await;
    if removed > 0 {
        info!("Removed {removed} empty chat log(s)");
    }

    let store = Arc::new(FileStore::new(&data_dir));
    let state = AppState::new(config, store);
    let app = agentmux::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    // Periodic reap: exited sessions and sessions idle past their grace
    let registry = state.registry.clone();
    let reap_every = Duration::from_secs(state.config.lifecycle.reap_interval_secs.max(1));
    let reap_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_every);
        loop {
            interval.tick().await;
            for (id, reason) in registry.reap().await {
                info!("Reaped session {id} ({})", reason.as_str());
            }
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }

    info!("Shutting down...");
    reap_task.abort();
    state.registry.shutdown().await;
    info!("Goodbye");
}
