//! `ffarm-master`: binds the Control API, runs the lease and heartbeat
//! sweepers, and (unless disabled) advertises itself over mDNS.
//!
//! Entrypoint shape follows the `ZVault` server's `main.rs`: load
//! config, build shared state, spawn background workers alongside the
//! HTTP server, and drive everything to a coordinated stop on
//! Ctrl-C/SIGTERM via a `tokio::sync::watch` shutdown channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ffarm::api::{self, AppState};
use ffarm::config::MasterConfig;
use ffarm::discovery::MasterAdvertiser;
use ffarm::pause::PauseState;
use ffarm::store::Store;
use ffarm::sweep;

#[derive(Parser, Debug)]
#[command(name = "ffarm-master", about = "LAN video transcode dispatcher: master coordinator")]
struct Cli {
    /// Path to a master.toml config file (defaults to ~/.ffarm/master.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP bind host
    #[arg(long)]
    host: Option<String>,

    /// HTTP bind port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Disable mDNS advertisement
    #[arg(long)]
    no_zeroconf: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = MasterConfig::load(cli.config.as_deref()).context("loading master config")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    if cli.no_zeroconf {
        config.advertise = false;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    tracing::info!(host = %config.host, port = config.port, db = %config.db_path.display(), "ffarm-master starting");

    let store = Arc::new(Store::open(&config.db_path).context("opening job store")?);
    let state = Arc::new(AppState {
        store: store.clone(),
        pause: PauseState::new(),
        lease_duration_secs: config.lease_duration_secs,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lease_sweeper = tokio::spawn({
        let store = store.clone();
        let interval = Duration::from_secs(lease_sweep_interval_secs(config.lease_duration_secs));
        let shutdown_rx = shutdown_rx.clone();
        async move { sweep::run_lease_sweeper(store, interval, shutdown_rx).await }
    });

    let heartbeat_sweeper = tokio::spawn({
        let store = store.clone();
        let heartbeat_timeout = Duration::from_secs(config.heartbeat_timeout_secs);
        let interval = Duration::from_secs(heartbeat_sweep_interval_secs(config.heartbeat_timeout_secs));
        let shutdown_rx = shutdown_rx.clone();
        async move { sweep::run_heartbeat_sweeper(store, heartbeat_timeout, interval, shutdown_rx).await }
    });

    let base_url = format!("http://{}:{}", advertise_host(&config.host), config.port);
    let advertiser = if config.advertise {
        let id = uuid::Uuid::new_v4().to_string();
        match MasterAdvertiser::start(&id, "ffarm-master", &base_url, config.port) {
            Ok(advertiser) => Some(advertiser),
            Err(err) => {
                tracing::warn!(%err, "mDNS advertisement failed to start; continuing without it");
                None
            }
        }
    } else {
        None
    };

    let app = api::build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("control API server error")?;

    tracing::info!("waiting for background sweepers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), lease_sweeper).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), heartbeat_sweeper).await;

    if let Some(advertiser) = advertiser {
        if let Err(err) = advertiser.stop() {
            tracing::warn!(%err, "failed to cleanly unregister mDNS advertisement");
        }
    }

    tracing::info!("ffarm-master stopped");
    Ok(())
}

/// `max(5s, LEASE_DURATION/3)`, per spec.md §4.3.
fn lease_sweep_interval_secs(lease_duration_secs: i64) -> u64 {
    (lease_duration_secs / 3).max(5) as u64
}

/// `max(5s, HEARTBEAT_TIMEOUT/2)`, per spec.md §4.3.
fn heartbeat_sweep_interval_secs(heartbeat_timeout_secs: u64) -> u64 {
    (heartbeat_timeout_secs / 2).max(5)
}

fn advertise_host(bind_host: &str) -> String {
    if bind_host == "0.0.0.0" || bind_host.is_empty() {
        ffarm::discovery::local_ipv4_or_loopback()
    } else {
        bind_host.to_string()
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown_tx.send(true);
}
