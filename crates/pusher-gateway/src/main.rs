//! Pusher APNS Gateway
//!
//! HTTP service that registers APNS identities and device tokens and fans
//! notifications out to Apple.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pusher_core::GatewayConfig;
use pusher_core::config::load_config;
use pusher_core::tracing_init::init_tracing;

use pusher_gateway::apns::{ApnsTransportFactory, ClientSettings};
use pusher_gateway::coordinator::DeliveryCoordinator;
use pusher_gateway::registry::{CertificateRegistry, CredentialSnapshot};
use pusher_gateway::server::{AppState, build_router};
use pusher_gateway::storage::TokenDatabase;

#[derive(Parser, Debug)]
#[command(name = "pusher-gateway")]
#[command(version, about = "Pusher APNS gateway - credential registry and push fan-out")]
struct Args {
    /// Explicit JSON settings file, layered over the global one.
    #[arg(long, env = "PUSHER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<String>,

    /// Path to the token store database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to the credential snapshot file.
    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    /// Delivery workers per identity.
    #[arg(long)]
    workers: Option<usize>,

    /// Outbound request timeout in seconds.
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(addr) = &self.addr {
            config.listen_addr.clone_from(addr);
        }
        if let Some(path) = &self.db_path {
            config.database_path.clone_from(path);
        }
        if let Some(path) = &self.snapshot_path {
            config.snapshot_path.clone_from(path);
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(secs) = self.request_timeout.filter(|s| *s > 0) {
            config.request_timeout_secs = secs;
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    init_tracing("pusher_gateway=info", config.log_json)?;
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        workers = config.workers,
        "Starting pusher-gateway"
    );

    let store = TokenDatabase::open(&config.database_path).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let factory = Arc::new(ApnsTransportFactory::new(ClientSettings::from(&config)));
    let registry = Arc::new(CertificateRegistry::new(factory, config.workers, Some(tx)));

    match CredentialSnapshot::load(&config.snapshot_path) {
        Ok(snapshot) if !snapshot.is_empty() => {
            registry.restore(&snapshot).await;
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Credential snapshot unreadable, starting empty"),
    }

    let coordinator = Arc::new(DeliveryCoordinator::new(Arc::clone(&registry), store.clone()));
    let drain = coordinator.spawn_response_drain(rx);

    let app = build_router(AppState::new(
        Arc::clone(&coordinator),
        Some(config.snapshot_path.clone()),
    ));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    registry.shutdown().await;
    // The registry holds the last response sender.
    drop(coordinator);
    drop(registry);
    if let Err(e) = drain.await {
        warn!(error = %e, "Response drain ended abnormally");
    }
    store.close().await;

    info!("pusher-gateway stopped");
    Ok(())
}
