//! minicloudd — the minicloud daemon.
//!
//! Single binary that assembles the cluster manager:
//! - Cluster registry
//! - Docker execution backend
//! - Elasticity controller loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! minicloudd init --output minicloud.toml
//! minicloudd serve --config minicloud.toml --port 5000
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use minicloud_autoscale::ElasticityController;
use minicloud_backend::DockerBackend;
use minicloud_core::MinicloudConfig;
use minicloud_scheduler::ClusterManager;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,minicloudd=debug,minicloud_api=debug,\
minicloud_autoscale=debug,minicloud_scheduler=debug,minicloud_backend=debug,\
minicloud_state=debug";

#[derive(Parser)]
#[command(name = "minicloudd", about = "minicloud cluster manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the cluster API and run the elasticity loop.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "minicloud.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "5000")]
        port: u16,
    },
    /// Write a starter configuration file.
    Init {
        /// Where to write the configuration.
        #[arg(long, default_value = "minicloud.toml")]
        output: PathBuf,

        /// Upstream manager base URL.
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        manager: String,

        /// Base URL containers use to reach this daemon.
        #[arg(long, default_value = "http://host.docker.internal:5000")]
        callback: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, port } => run_serve(config, port).await,
        Command::Init {
            output,
            manager,
            callback,
        } => write_scaffold(output, &manager, &callback),
    }
}

fn write_scaffold(output: PathBuf, manager: &str, callback: &str) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = MinicloudConfig::scaffold(manager, callback);
    std::fs::write(&output, config.to_toml_string()?)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(path = ?output, "configuration written");
    Ok(())
}

async fn run_serve(config_path: PathBuf, port: u16) -> anyhow::Result<()> {
    info!("minicloud daemon starting");

    let config = MinicloudConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(path = ?config_path, tier = %config.cluster.tier, "configuration loaded");

    // ── Initialize subsystems ──────────────────────────────────

    let backend = Arc::new(DockerBackend::connect().context("connecting to docker")?);
    info!("docker backend connected");

    let manager = Arc::new(ClusterManager::from_config(&config, backend)?);
    let controller = Arc::new(ElasticityController::new(manager.clone()));
    info!(
        interval_ms = config.elasticity.interval_ms,
        "elasticity controller ready"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let loop_controller = controller.clone();
    let interval = Duration::from_millis(config.elasticity.interval_ms);
    let elasticity_handle = tokio::spawn(async move {
        loop_controller.run(interval, shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = minicloud_api::build_router(manager, controller);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = elasticity_handle.await;

    info!("minicloud daemon stopped");
    Ok(())
}
