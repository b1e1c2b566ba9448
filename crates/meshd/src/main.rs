//! meshd — the meshwork daemon.
//!
//! Single binary that assembles the mesh control plane:
//! - Endpoint store (redb)
//! - Registry + heartbeat ingestion
//! - Router + service mapping table
//! - Circuit breaker
//! - Invocation client (route cache kept in step with lifecycle events)
//! - Health worker
//! - REST API + Prometheus exposition
//!
//! # Usage
//!
//! ```text
//! meshd serve --config /etc/meshwork/mesh.toml --port 7400
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use meshwork_api::{ApiState, build_router};
use meshwork_breaker::CircuitBreaker;
use meshwork_client::MeshClient;
use meshwork_events::{EventBus, MeshEvent};
use meshwork_health::HealthWorker;
use meshwork_registry::Registry;
use meshwork_router::MeshRouter;
use meshwork_state::MeshStore;

mod config;
use config::MeshConfig;

#[derive(Parser)]
#[command(name = "meshd", about = "Meshwork daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the mesh control plane.
    Serve {
        /// Path to mesh.toml; built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the API port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshd=debug,meshwork=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = MeshConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            serve(config).await
        }
    }
}

async fn serve(config: MeshConfig) -> anyhow::Result<()> {
    info!("meshwork daemon starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("meshwork.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = MeshStore::open(&db_path)?;
    info!(path = ?db_path, "endpoint store opened");

    let bus = EventBus::default();
    let registry = Registry::new(store.clone(), bus.clone(), config.registry.clone());
    let router = Arc::new(MeshRouter::new(
        store.clone(),
        bus.clone(),
        config.router.clone(),
        config.registry.degradation_threshold(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        bus.clone(),
        config.breaker.clone(),
    ));
    let client = Arc::new(MeshClient::new(
        router.clone(),
        breaker.clone(),
        config.client.clone(),
    )?);
    info!("mesh components initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let worker = HealthWorker::new(
        store.clone(),
        registry.clone(),
        bus.clone(),
        config.health_check.clone(),
    );
    let health_handle = worker.spawn(shutdown_rx.clone());

    let purge_handle = tokio::spawn(purge_loop(
        registry.clone(),
        Duration::from_secs(config.purge_interval_secs),
        shutdown_rx.clone(),
    ));

    let cache_handle = tokio::spawn(cache_invalidation_loop(
        client.clone(),
        bus.subscribe(),
        shutdown_rx.clone(),
    ));

    // ── Start API server ───────────────────────────────────────

    let api_state = ApiState {
        registry,
        router,
        breaker,
        started_at: Instant::now(),
    };
    let app = build_router(api_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = health_handle.await;
    let _ = purge_handle.await;
    let _ = cache_handle.await;

    info!("meshwork daemon stopped");
    Ok(())
}

/// Sweep expired endpoint records on a fixed cadence. Expiry is already
/// enforced at read time; the sweep just keeps the store compact.
async fn purge_loop(registry: Registry, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match registry.purge_expired() {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "purged expired endpoints"),
                    Err(e) => error!(error = %e, "expired-endpoint purge failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Drop cached routes when the mesh learns an instance is gone or a
/// circuit changed state, so the next invoke re-resolves.
async fn cache_invalidation_loop(
    client: Arc<MeshClient>,
    mut events: broadcast::Receiver<MeshEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MeshEvent::EndpointDeregistered { app_id, .. })
                | Ok(MeshEvent::CircuitStateChanged { app_id, .. }) => {
                    client.forget_route(&app_id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged, route cache may be stale");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
