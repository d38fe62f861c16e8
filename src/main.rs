mod cache;
mod config;
mod error;
mod generator;
mod http;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{ArtifactStore, RegenerationCoordinator};
use crate::config::Config;
use crate::generator::github::GitHubClient;
use crate::generator::render::CardRenderer;
use crate::generator::{CardGenerator, GitHubCardGenerator};
use crate::http::cards::CardService;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "repocard", about = "GitHub repository card service")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding `server.http_listen`.
    #[arg(short, long)]
    listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cards: CardService,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::parse_config("")?,
    };
    if let Some(listen) = cli.listen {
        config.server.http_listen = listen;
    }
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = cli.config.as_deref().unwrap_or("<defaults>"),
        cache_dir = %config.cache.dir,
        ttl_secs = config.cache.ttl_secs,
        "starting repocard"
    );

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Artifact store ----
    let clock = cache::system_clock();
    let store = ArtifactStore::open(&config.cache.dir, Arc::clone(&clock))?;

    // ---- Generator ----
    let client = GitHubClient::new(&config.github)?;
    let renderer = CardRenderer::new(&config.render);
    let generator: Arc<dyn CardGenerator> = Arc::new(GitHubCardGenerator::new(client, renderer));

    // ---- Cache core ----
    let coordinator = RegenerationCoordinator::new(
        store,
        generator,
        config.cache.generation_timeout(),
        Arc::clone(&metrics.metrics),
    );
    let cards = CardService::new(
        coordinator,
        config.cache.ttl(),
        clock,
        Arc::clone(&metrics.metrics),
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        cards,
        metrics,
    };

    run_http_server(state).await?;

    tracing::info!("repocard shut down cleanly");
    Ok(())
}
