use std::sync::Arc;

use clap::Parser;
use foreman_core::{AppendLog, CheckpointStore, Decider, ForemanConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use foreman_server::subsystems::retention;
use foreman_server::{server, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "foreman.toml")]
    config: String,

    /// Run with in-memory log and checkpoints; no config file needed.
    #[arg(long)]
    dev: bool,

    /// Check backend connectivity and exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = if args.dev {
        ForemanConfig::in_memory()
    } else {
        match ForemanConfig::load(&args.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", args.config, e);
                std::process::exit(1);
            }
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    let state = match AppState::bootstrap(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start backends: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        println!("✅ Log backend: {}", state.log.name());
        println!("✅ Checkpoint backend: {}", state.checkpoints.name());
        println!("✅ Decider: {}", state.decider.name());
        println!("✅ Foreman health check passed");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    // Consumer loops, one per configured user stream
    let orchestrator = Arc::new(state.orchestrator());
    let orchestrator_task = tokio::spawn(orchestrator.run(cancel.child_token()));

    // Stream trimming + checkpoint expiry
    tokio::spawn(retention::run_retention_loop(
        Arc::clone(&state.log),
        Arc::clone(&state.checkpoints),
        state.config.orchestrator.users.clone(),
        state.config.streams.clone(),
        state.config.checkpoint.clone(),
        cancel.child_token(),
    ));

    // HTTP API if enabled
    if state.config.http.enabled {
        let http_state = state.clone();
        let http_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = foreman_server::http::start_http_server(http_state, http_cancel).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = state.config.service.socket_path.clone();
    server::run_unix_server(&socket_path, state, cancel.clone()).await?;

    // Wait for the consumer loops to stop
    cancel.cancel();
    if let Err(e) = orchestrator_task.await {
        tracing::error!("Orchestrator task failed: {}", e);
    }

    Ok(())
}
