//! Background sweepers: periodic tasks that reclaim state the happy
//! path doesn't touch — expired leases and workers that stopped
//! heartbeating without telling anyone.
//!
//! Both follow the same shape: a `tokio::select!` between an interval
//! tick and a shutdown watch channel, so the master's graceful shutdown
//! can stop them without waiting out a full tick.

use crate::models::WorkerStatus;
use crate::store::{self, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run_lease_sweeper(store: Arc<Store>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store::expire_leases(&store) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(jobs = n, "reclaimed expired leases"),
                    Err(err) => tracing::error!(%err, "lease sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("lease sweeper shutting down");
                return;
            }
        }
    }
}

pub async fn run_heartbeat_sweeper(
    store: Arc<Store>,
    heartbeat_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_once(&store, heartbeat_timeout) {
                    tracing::error!(%err, "heartbeat sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::debug!("heartbeat sweeper shutting down");
                return;
            }
        }
    }
}

fn sweep_once(store: &Store, heartbeat_timeout: Duration) -> Result<(), crate::error::StoreError> {
    let timeout = chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::seconds(30));
    let now = Utc::now();
    for worker in store.list_workers()? {
        if worker.status == WorkerStatus::Offline {
            continue;
        }
        if now - worker.last_seen > timeout {
            tracing::warn!(worker = %worker.id, "worker missed heartbeat deadline, marking offline");
            store.mark_offline(&worker.id)?;
            let released = store::release_worker(store, &worker.id)?;
            if released > 0 {
                tracing::info!(worker = %worker.id, jobs = released, "released jobs from offline worker");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_once_marks_stale_worker_offline_and_releases_its_job() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_worker("w1", "Worker 1", "http://w1").unwrap();
        store
            .enqueue("/a.mov", "/out/a.mov", "prores_proxy_1280")
            .unwrap();
        let job = store::lease_next(&store, "w1", 900).unwrap().unwrap();
        store.set_running_job("w1", Some(job.id)).unwrap();

        crate::store::test_support::set_last_seen(&store, "w1", Utc::now() - chrono::Duration::seconds(120));

        sweep_once(&store, Duration::from_secs(30)).unwrap();

        let worker = store.get_worker("w1").unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.state, crate::models::JobState::Pending);
    }
}
