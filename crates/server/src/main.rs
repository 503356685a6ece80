//! indexgate server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use indexgate_core::config::AppConfig;
use indexgate_server::authz::AuthGate;
use indexgate_server::bootstrap::{ensure_admin_token, register_repositories};
use indexgate_server::{AppState, create_internal_router, create_router};
use std::future::IntoFuture;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// indexgate - code-intelligence index upload service
#[derive(Parser, Debug)]
#[command(name = "indexgate-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "INDEXGATE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with("INDEXGATE_") && key != "INDEXGATE_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: indexgate-server --config /path/to/config.toml\n  \
             2. Environment variables: INDEXGATE_SERVER__BIND=0.0.0.0:8080 \
             INDEXGATE_ADMIN__TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE indexgate-server\n\n\
             Set INDEXGATE_CONFIG to change the default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("INDEXGATE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

async fn bind(addr: &str) -> Result<tokio::net::TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address: {addr}"))?;
    tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,indexgate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("indexgate v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    indexgate_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = indexgate_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    // Fail fast rather than report healthy with unreachable storage.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    let metadata = indexgate_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    ensure_admin_token(metadata.as_ref(), &config.admin).await?;
    register_repositories(metadata.as_ref(), &config.repositories).await?;

    let auth_gate =
        AuthGate::from_config(&config.auth).context("failed to build code host HTTP client")?;
    let resolver = indexgate_server::git::from_config(&config.git).map_err(anyhow::Error::msg)?;
    tracing::info!(resolver = resolver.name(), "Commit resolver initialized");

    let state = AppState::new(config.clone(), storage, metadata, auth_gate, resolver);

    let listener = bind(&config.server.bind).await?;
    tracing::info!("Listening on {}", config.server.bind);
    let external = axum::serve(listener, create_router(state.clone())).into_future();

    match &config.server.internal_bind {
        Some(internal_bind) => {
            let internal_listener = bind(internal_bind).await?;
            tracing::info!("Internal API listening on {}", internal_bind);
            let internal =
                axum::serve(internal_listener, create_internal_router(state)).into_future();
            tokio::try_join!(external, internal)?;
        }
        None => external.await?,
    }

    Ok(())
}
