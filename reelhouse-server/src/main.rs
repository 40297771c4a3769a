//! # Reelhouse Server
//!
//! Artifact generation service for a home media library.
//!
//! The server derives thumbnails, probed metadata, hover previews,
//! subtitles and face-detection data from video files with external tools.
//! Work is accepted over HTTP, admitted under strict concurrency ceilings so
//! that a low-power host stays responsive, and the idle worker catches up on
//! missing artifacts when nothing else is queued.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelhouse_config::{Config, ConfigLoad, ConfigLoader};
use reelhouse_server::{
    AppState, create_app,
    infra::{
        shutdown::shutdown_signal,
        startup::{build_services, spawn_idle_worker},
    },
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "reelhouse-server")]
#[command(about = "Artifact generation service for a home media library")]
struct Cli {
    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Path to reelhouse.toml
    #[arg(long, env = "REELHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Do not start the idle worker
    #[arg(long, default_value_t = false)]
    no_idle: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;
    run_server(config).await
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Arc<Config>> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }
    if cli.no_idle {
        config.idle.enabled = false;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    let limits = &config.scheduler.limits;
    info!(
        scheduler.global = limits.global,
        scheduler.cpu_light = limits.cpu_light,
        scheduler.cpu_heavy = limits.cpu_heavy,
        scheduler.io_bound = limits.io_bound,
        scheduler.tool_threads = config.scheduler.tool_threads,
        cache.root = %config.cache.root.display(),
        "scheduler configuration"
    );

    Ok(Arc::new(config))
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    config
        .ensure_directories()
        .context("failed to create cache directories")?;

    let services = build_services(&config)?;
    let shutdown = CancellationToken::new();
    let idle = spawn_idle_worker(&config, &services, shutdown.child_token());

    let state = AppState::new(services.scheduler.clone());
    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "reelhouse server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Some(handle) = idle
        && let Err(err) = handle.await
    {
        error!(error = %err, "idle worker ended abnormally");
    }
    services.scheduler.shutdown().await;

    served.context("server error")?;
    info!("reelhouse server stopped");
    Ok(())
}
