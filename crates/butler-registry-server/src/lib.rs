//! HTTP adapter for Butler Registry.
//!
//! Exposes the three surfaces of the core engine — public webhooks,
//! executor callbacks, and the registry API — and hosts the background
//! dispatch, sweep, and rate-limiter eviction loops. The binary forwards
//! to [`run`]; embedders who want the exact server surface can call it
//! programmatically.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use butler_registry::SqliteStore;
use butler_registry::config::RegistryConfig;
use butler_registry::dispatch::Dispatcher;

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use state::AppState;

/// How often idle rate-limiter buckets are collected.
const LIMITER_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "butler-registry-server", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "butler.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the registry server (default).
    Serve,
    /// Mint a registry API token and print it once.
    Token {
        /// Name recorded against the token; doubles as the acting identity.
        name: String,
    },
}

/// Programmatic entrypoint behind the binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = RegistryConfig::load_or_default(&cli.config)?;
    let store = Arc::new(SqliteStore::open(&config.database.path)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Token { name } => mint_token(store.as_ref(), &name),
        Command::Serve => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(serve(store, config))
        }
    }
}

fn mint_token(store: &SqliteStore, name: &str) -> Result<()> {
    use butler_registry::Store;
    let minted = butler_token::mint_registry_token();
    store.insert_api_token(name, &minted.token_hash)?;
    // The plaintext is shown exactly once; only the hash is stored.
    println!("{}", minted.token);
    Ok(())
}

async fn serve(store: Arc<SqliteStore>, config: RegistryConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let dispatch_config = config.dispatch.clone();
    let state = AppState::new(store.clone(), config);

    if dispatch_config.enabled {
        let dispatcher = Arc::new(Dispatcher::new(store, dispatch_config)?);
        tokio::spawn(dispatcher.run());
    } else {
        info!("dispatch loop disabled by configuration");
    }

    let limiters = (state.webhook_limiter.clone(), state.api_limiter.clone());
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LIMITER_EVICTION_INTERVAL);
        loop {
            tick.tick().await;
            limiters.0.evict_idle();
            limiters.1.evict_idle();
        }
    });

    let app = routes::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "butler-registry listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install shutdown handler");
        }
    })
    .await
    .context("server error")
}
