//! collabkitd - the CollabKit room broker.
//!
//! Accepts WebSocket connections, authenticates them, and brokers CRDT
//! operations, presence, function calls, and WebRTC signaling between
//! room members.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use collabkit::auth::{Principal, StaticTokenProvider};
use collabkit::config::{Config, LogFormat};
use collabkit::network::Gateway;
use collabkit::state::{Hub, HubParams};
use collabkit::storage::{FileStorage, Storage};
use tracing::{error, info};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `collabkit.toml` when no argument is provided.
fn resolve_config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => {
            // No explicit config: run on defaults when the conventional
            // file is absent.
            if !Path::new("collabkit.toml").exists() {
                return None;
            }
            "collabkit.toml".to_string()
        }
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => Some(p.to_string_lossy().into_owned()),
        Err(_) => Some(raw_path),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log_format)
    let config = match resolve_config_path() {
        Some(path) => Config::load(&path).map_err(|e| {
            eprintln!("ERROR: Failed to load config: {e}");
            e
        })?,
        None => Config::default(),
    };

    // Initialize tracing based on config
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match config.server.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    // Validate configuration
    if let Err(errors) = collabkit::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(
        server = %config.server.name,
        listen = %config.server.listen,
        path = %config.broker.path,
        "Starting collabkitd"
    );

    // Static token table from config.
    let mut tokens = HashMap::new();
    for entry in &config.tokens {
        tokens.insert(
            entry.token.clone(),
            Principal {
                id: entry.user_id.clone(),
                name: entry.name.clone(),
                roles: entry.roles.clone(),
            },
        );
    }
    let auth = Arc::new(StaticTokenProvider::new(tokens));

    // Snapshot persistence only matters when save_on_operation is set.
    let storage: Option<Arc<dyn Storage>> = if config.broker.save_on_operation {
        Some(Arc::new(FileStorage::new("data")))
    } else {
        None
    };

    let hub = Arc::new(Hub::new(HubParams {
        config: config.broker.clone(),
        auth,
        perms: None,
        storage,
    }));
    info!("Hub initialized");

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM - initiating graceful shutdown"),
            }

            hub.shutdown();
        });
    }

    // Auth lockout pruning task (runs every 5 minutes).
    {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(300));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown_rx = hub.subscribe_shutdown();
            loop {
                tokio::select! {
                    _ = interval.tick() => hub.auth_guard.prune(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    let gateway = Gateway::bind(config.server.listen, Arc::clone(&hub)).await?;
    gateway.run().await?;

    info!("Gateway stopped, waiting for connections to finish...");
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

    Ok(())
}
