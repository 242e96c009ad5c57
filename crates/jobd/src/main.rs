//! jobd — the jobgrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Workflow orchestrator
//! - Query index refresh loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! jobd standalone --port 8080 --data-dir /var/lib/jobgrid
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use jobgrid_query::QueryIndex;
use jobgrid_runtime::JobCache;
use jobgrid_state::StateStore;
use jobgrid_workflow::{LocalTaskActions, OrchestratorConfig, WorkflowOrchestrator};

#[derive(Parser)]
#[command(name = "jobd", about = "jobgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/jobgrid")]
        data_dir: PathBuf,

        /// Query index refresh interval in seconds.
        #[arg(long, default_value = "10")]
        index_refresh_interval: u64,

        /// Backoff between admission retries for stalled workflows,
        /// in seconds.
        #[arg(long, default_value = "5")]
        stall_retry_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobd=debug,jobgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            index_refresh_interval,
            stall_retry_interval,
        } => run_standalone(port, data_dir, index_refresh_interval, stall_retry_interval).await,
    }
}

async fn run_standalone(
    port: u16,
    data_dir: PathBuf,
    index_refresh_interval: u64,
    stall_retry_interval: u64,
) -> anyhow::Result<()> {
    info!("jobgrid daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("jobgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cache = JobCache::new();

    // Standalone mode has no external task supervisor; actions are
    // acknowledged locally.
    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        cache.clone(),
        Arc::new(LocalTaskActions),
    )
    .with_config(OrchestratorConfig {
        stall_retry: Duration::from_secs(stall_retry_interval),
        batch_pause: Duration::ZERO,
    });
    info!(stall_retry = stall_retry_interval, "orchestrator initialized");

    let index = QueryIndex::new();
    match index.refresh(&store).await {
        Ok(count) => info!(jobs = count, "query index primed"),
        Err(e) => warn!(error = %e, "initial index refresh failed"),
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Query index refresh loop.
    let refresh_handle = tokio::spawn(refresh_loop(
        index.clone(),
        store.clone(),
        Duration::from_secs(index_refresh_interval),
        shutdown_rx,
    ));

    // ── Start API server ───────────────────────────────────────

    let router = jobgrid_api::build_router(jobgrid_api::ApiState {
        store,
        cache,
        index,
        orchestrator,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = refresh_handle.await;

    info!("jobgrid daemon stopped");
    Ok(())
}

/// Rebuild the query index on an interval until shutdown.
async fn refresh_loop(
    index: QueryIndex,
    store: StateStore,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = index.refresh(&store).await {
                    warn!(error = %e, "index refresh failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("index refresh loop stopping");
                    return;
                }
            }
        }
    }
}
