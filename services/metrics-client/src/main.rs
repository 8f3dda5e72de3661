//! Metrics client
//!
//! Command-line client for the metrics backend:
//! 1. Loads config, checks backend health and resumes (or establishes) a session
//! 2. Keeps the access token fresh in the background
//! 3. Subscribes to the metrics stream and prints the final result as JSON

mod app;
mod config;
mod error;

use anyhow::{Context, Result};
use serde_json::json;
use session_auth::{CredentialStore, FileStore, MemoryStore};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("starting metrics-client");

    // CLI: simple --config / --register / --logout flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let register = args.iter().any(|a| a == "--register");
    let logout = args.iter().any(|a| a == "--logout");

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        email = %config.session.email,
        time_period = config.stream.time_period,
        "configuration loaded"
    );

    let store: Arc<dyn CredentialStore> = match &config.storage.credentials_path {
        Some(path) => Arc::new(FileStore::open(path.clone()).with_context(|| {
            format!("failed to open credentials file {}", path.display())
        })?),
        None => Arc::new(MemoryStore::new()),
    };

    let app = App::new(config, store).context("failed to build client")?;
    app.watch_session();

    if logout {
        app.logout();
        info!("stored session removed");
        return Ok(());
    }

    app.check_health().await;

    let user = app
        .ensure_session(register)
        .await
        .context("failed to establish session")?;
    if let Some(user) = &user {
        info!(user_id = %user.id, email = %user.email, "signed in");
    }

    let state = app
        .stream_metrics(shutdown_signal())
        .await
        .context("metrics stream failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "loading": state.loading,
            "success": state.success,
            "progress": state.progress,
            "data": state.data,
            "error": state.error,
        }))?
    );

    if let Some(message) = state.error {
        anyhow::bail!("metrics stream reported an error: {message}");
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
