#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # smshub
//!
//! Control-plane hub for a fleet of SMS gateway devices.
//!
//! Devices hold a long-lived WebSocket to `/ws`, authenticate with their
//! connect key and then stream telemetry, incoming SMS, delivery reports and
//! command results. The hub routes commands (SMS, USSD, enable/disable,
//! status requests) back to the right connection and picks the best
//! device/SIM for each outbound SMS.
//!
//! ## Subcommands
//!
//! - `smshub serve` (default): run the HTTP/WS server
//! - `smshub check-config`: load and validate the configuration, then exit
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! config.rs        TOML + env-var configuration
//! auth.rs          operator Bearer token middleware
//! hub.rs           connection registry actor
//! session.rs       device WebSocket read/write pumps
//! protocol.rs      inbound/outbound envelope types
//! router.rs        inbound message handlers
//! selector.rs      device/SIM selection, cost estimate
//! correlation.rs   command state machine
//! gateway.rs       command-sender service
//! store.rs         persistence trait + in-memory store
//! cache.rs         status cache trait + TTL cache
//! outbox.rs        event publisher trait + bounded outbox
//! routes/          /health, /ws/stats, /api/reports/delivery
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use smshub::{AppState, Config, LogPublisher, MemoryStatusCache, MemoryStore};

/// Control-plane hub for SMS gateway devices.
#[derive(Parser)]
#[command(name = "smshub", version)]
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
    /// Load and validate the configuration, print a summary and exit.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => check_config(config.as_deref()),
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn check_config(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let seeded = match config.store.seed_path.as_deref() {
        Some(path) => match MemoryStore::from_seed_file(Path::new(path)) {
            Ok(_) => format!("{path} (ok)"),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => "none".to_string(),
    };

    let hub = &config.hub;
    println!("listen:            {}", config.server.listen);
    println!("duplicate policy:  {:?}", hub.duplicate_policy);
    println!(
        "keepalive/read:    {}s / {}s",
        hub.keepalive_interval_secs, hub.read_deadline_secs
    );
    println!(
        "buffers:           outbound={} command={} outbox={}",
        hub.outbound_buffer, hub.command_buffer, config.outbox.capacity
    );
    println!("min battery:       {}%", config.selector.min_battery);
    println!("device seed:       {seeded}");
    if config.auth.api_key == "change-me" {
        println!("warning: using default API key");
    }
    ExitCode::SUCCESS
}

async fn run_server(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("smshub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set SMSHUB_API_KEY or update config");
    }

    let store = match config.store.seed_path.as_deref() {
        Some(path) => match MemoryStore::from_seed_file(Path::new(path)) {
            Ok(store) => {
                info!(path, "Loaded device seed");
                store
            }
            Err(e) => {
                error!(error = %e, "Failed to load device seed");
                return ExitCode::FAILURE;
            }
        },
        None => {
            warn!("No device seed configured, every connect key will be rejected");
            MemoryStore::new()
        }
    };
    let status_cache = MemoryStatusCache::from_config(&config.status_cache);

    let (state, tasks) = AppState::build(
        config,
        Arc::new(store),
        Arc::new(status_cache),
        Arc::new(LogPublisher),
    );
    let app = smshub::routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %state.config.server.listen, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!("Server ready");

    // Device sockets must close before graceful shutdown can finish.
    let token = state.shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await;

    // Cleanup
    info!("Shutting down...");
    state.shutdown.cancel();
    tasks.join().await;
    let dropped = state.outbox.dropped();
    if dropped > 0 {
        warn!(dropped, "Outbox dropped events during this run");
    }

    match result {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
