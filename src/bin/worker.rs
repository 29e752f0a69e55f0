//! `ffarm-worker`: resolves a master URL, optionally advertises itself
//! over mDNS, and runs the lease/heartbeat/encoder-supervision loops
//! until told to stop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ffarm::agent::{self, WorkerAgent, WorkerAgentConfig};
use ffarm::config::WorkerConfig;
use ffarm::discovery::advertise_worker;

#[derive(Parser, Debug)]
#[command(name = "ffarm-worker", about = "LAN video transcode dispatcher: worker agent")]
struct Cli {
    /// Path to a worker.toml config file (defaults to ~/.ffarm/worker.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Master base URL (defaults to FFARM_MASTER_URL, then mDNS discovery)
    #[arg(long)]
    master: Option<String>,

    /// Worker ID (defaults to config value, else a random UUID)
    #[arg(long = "id")]
    worker_id: Option<String>,

    /// Friendly worker name (defaults to config value, else Worker-<hostname>)
    #[arg(long)]
    name: Option<String>,

    /// Disable mDNS self-advertisement
    #[arg(long)]
    no_zeroconf: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = WorkerConfig::load(cli.config.as_deref()).context("loading worker config")?;
    if cli.master.is_some() {
        config.master_url = cli.master;
    }
    if cli.worker_id.is_some() {
        config.worker_id = cli.worker_id;
    }
    if cli.name.is_some() {
        config.name = cli.name;
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

    let worker_id = config.worker_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = config.name.clone().unwrap_or_else(|| format!("Worker-{}", hostname()));

    let master_url = {
        let explicit = config.master_url.clone();
        tokio::task::spawn_blocking(move || agent::resolve_master_url(explicit.as_deref(), Duration::from_secs(10)))
            .await
            .context("resolving master URL")??
    };
    tracing::info!(%master_url, worker_id = %worker_id, name = %name, "ffarm-worker starting");

    let (ffmpeg_path, ffprobe_path) = agent::resolve_encoder_tools();

    let advertiser = if config.advertise {
        match advertise_worker(&worker_id, &name, "", 0) {
            Ok(advertiser) => Some(advertiser),
            Err(err) => {
                tracing::warn!(%err, "mDNS self-advertisement failed to start; continuing without it");
                None
            }
        }
    } else {
        None
    };

    let agent = std::sync::Arc::new(WorkerAgent::new(WorkerAgentConfig {
        master_url,
        worker_id,
        name,
        poll_interval: Duration::from_secs(config.poll_interval_secs),
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        ffmpeg_path,
        ffprobe_path,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn(agent.clone().run(shutdown_rx));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping worker");
    let _ = shutdown_tx.send(true);
    let _ = run_handle.await;

    if let Some(advertiser) = advertiser {
        if let Err(err) = advertiser.stop() {
            tracing::warn!(%err, "failed to cleanly unregister mDNS advertisement");
        }
    }

    tracing::info!("ffarm-worker stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::process::Command::new("hostname")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}

async fn wait_for_shutdown_signal() {
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
}
