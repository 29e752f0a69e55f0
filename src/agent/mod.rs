//! The Worker Agent: bootstrap, lease loop, heartbeat loop, and encoder
//! supervision wired into one long-running control loop.
//!
//! Generalizes `worker/client.py`'s `WorkerClient` — three threads
//! (lease loop, heartbeat loop, force-stop watcher) coordinating through
//! plain instance fields — into three `tokio` tasks coordinating
//! through a small set of shared, lock-guarded fields, per spec.md §5's
//! "confining writes to one activity and publishing immutably, or
//! guarding with a lock" guidance.

pub mod encoder;

use crate::api::types::{
    CompletionReport, HeartbeatRequest, HeartbeatResponse, LeaseRequest, LeaseResponse, ProgressRequest,
};
use crate::error::AgentError;
use crate::models::WorkerStatus;
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const COMMON_FFMPEG_PATHS: &[&str] = &["/opt/homebrew/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/usr/bin/ffmpeg"];
const COMMON_FFPROBE_PATHS: &[&str] = &["/opt/homebrew/bin/ffprobe", "/usr/local/bin/ffprobe", "/usr/bin/ffprobe"];

/// Resolve `master_url` in the order spec.md §4.5 "Bootstrap" specifies:
/// explicit argument, then `FFARM_MASTER_URL`, then a blocking Discovery
/// wait. Callers on an async runtime should run this via
/// `spawn_blocking` since mDNS browsing blocks the calling thread.
pub fn resolve_master_url(explicit: Option<&str>, discovery_timeout: Duration) -> Result<String, AgentError> {
    if let Some(url) = explicit.filter(|u| !u.is_empty()) {
        return Ok(url.trim_end_matches('/').to_string());
    }
    if let Ok(url) = std::env::var("FFARM_MASTER_URL") {
        if !url.is_empty() {
            return Ok(url.trim_end_matches('/').to_string());
        }
    }
    match crate::discovery::discover_master(discovery_timeout) {
        Ok(Some(url)) => Ok(url.trim_end_matches('/').to_string()),
        _ => Err(AgentError::NoMaster),
    }
}

/// An absolute-and-executable override, else a `PATH` lookup, else a
/// short list of common install locations. Mirrors `worker/client.py`'s
/// `_resolve_tool`.
pub fn resolve_tool(env_var: &str, executable: &str, fallbacks: &[&str]) -> Option<String> {
    if let Ok(override_path) = std::env::var(env_var) {
        if !override_path.is_empty() {
            let p = Path::new(&override_path);
            if p.is_absolute() && is_executable(p) {
                return Some(override_path);
            }
            if let Some(found) = which(&override_path) {
                return Some(found);
            }
            tracing::warn!(env_var, value = %override_path, "not executable, falling back to PATH lookup");
        }
    }
    if let Some(found) = which(executable) {
        return Some(found);
    }
    for candidate in fallbacks {
        let p = Path::new(candidate);
        if p.is_absolute() && is_executable(p) {
            return Some(candidate.to_string());
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

fn which(executable: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(executable)).find(|p| is_executable(p)).map(|p| p.to_string_lossy().to_string())
}

pub struct WorkerAgentConfig {
    pub master_url: String,
    pub worker_id: String,
    pub name: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

struct ActiveJob {
    job_id: i64,
    input_path: String,
    output_path: String,
    argv: Vec<String>,
}

/// Long-running control loop for a single worker process. See spec.md
/// §4.5 for the bootstrap/lease-loop/heartbeat-loop/encoder-supervision
/// algorithm this implements.
pub struct WorkerAgent {
    client: Client,
    cfg: WorkerAgentConfig,
    status: Mutex<WorkerStatus>,
    accept_leases: AtomicBool,
    current_job_id: Mutex<Option<i64>>,
    force_stop: Arc<AtomicBool>,
}

impl WorkerAgent {
    pub fn new(cfg: WorkerAgentConfig) -> Self {
        Self {
            client: Client::builder().timeout(Duration::from_secs(15)).build().expect("reqwest client"),
            cfg,
            status: Mutex::new(WorkerStatus::Online),
            accept_leases: AtomicBool::new(true),
            current_job_id: Mutex::new(None),
            force_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the lease loop and heartbeat loop concurrently until
    /// `shutdown` fires, then drains both with a bounded timeout, per
    /// spec.md §5's worker shutdown semantics.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let heartbeat = {
            let agent = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { agent.heartbeat_loop(&mut rx).await })
        };
        let lease = {
            let agent = self.clone();
            let mut rx = shutdown.clone();
            tokio::spawn(async move { agent.lease_loop(&mut rx).await })
        };

        let _ = shutdown.changed().await;
        self.force_stop.store(true, Ordering::SeqCst);

        let _ = tokio::time::timeout(Duration::from_secs(10), lease).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), heartbeat).await;
    }

    async fn lease_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let idle = self.current_job_id.lock().unwrap().is_none();
            if idle && self.accept_leases.load(Ordering::SeqCst) && !self.force_stop.load(Ordering::SeqCst) {
                match self.request_lease().await {
                    Ok(Some(job)) => {
                        self.execute_job(job).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%err, "lease request failed, retrying next tick"),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => { return; }
            }
        }
    }

    async fn request_lease(&self) -> Result<Option<ActiveJob>, AgentError> {
        let body = LeaseRequest { worker_id: self.cfg.worker_id.clone(), name: self.cfg.name.clone(), base_url: String::new() };
        let resp: LeaseResponse = self
            .client
            .post(format!("{}/api/v1/jobs/lease", self.cfg.master_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.accept_leases.store(resp.accept_leases, Ordering::SeqCst);

        match resp.action.as_deref() {
            Some("force_stop") => {
                *self.status.lock().unwrap() = WorkerStatus::ForceStopping;
                self.force_stop.store(true, Ordering::SeqCst);
                return Ok(None);
            }
            Some("stop") => {
                *self.status.lock().unwrap() = WorkerStatus::Stopping;
                self.accept_leases.store(false, Ordering::SeqCst);
                return Ok(None);
            }
            _ => {}
        }

        let Some(job_id) = resp.job_id else {
            return Ok(None);
        };
        Ok(Some(ActiveJob {
            job_id,
            input_path: resp.input_path.unwrap_or_default(),
            output_path: resp.output_path.unwrap_or_default(),
            argv: resp.encoder_argv,
        }))
    }

    async fn heartbeat_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        self.send_heartbeat().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.heartbeat_interval) => {
                    self.send_heartbeat().await;
                }
                _ = shutdown.changed() => { return; }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn send_heartbeat(&self) {
        let running_job_id = *self.current_job_id.lock().unwrap();
        let status = *self.status.lock().unwrap();
        let body = HeartbeatRequest {
            worker_id: self.cfg.worker_id.clone(),
            name: self.cfg.name.clone(),
            base_url: String::new(),
            running_job_id,
            status,
        };
        let result = self
            .client
            .post(format!("{}/api/v1/workers/heartbeat", self.cfg.master_url))
            .json(&body)
            .send()
            .await;
        let response = match result {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(%err, "heartbeat failed, will retry next tick");
                return;
            }
        };
        let parsed: Result<HeartbeatResponse, _> = response.json().await;
        let Ok(parsed) = parsed else { return };

        self.accept_leases.store(parsed.accept_leases, Ordering::SeqCst);
        match parsed.status {
            WorkerStatus::ForceStopping => {
                *self.status.lock().unwrap() = WorkerStatus::ForceStopping;
                self.force_stop.store(true, Ordering::SeqCst);
            }
            WorkerStatus::Stopping => {
                *self.status.lock().unwrap() = WorkerStatus::Stopping;
                self.accept_leases.store(false, Ordering::SeqCst);
            }
            _ => {
                if running_job_id.is_none() {
                    *self.status.lock().unwrap() = WorkerStatus::Online;
                }
            }
        }
    }

    async fn execute_job(&self, job: ActiveJob) {
        *self.current_job_id.lock().unwrap() = Some(job.job_id);
        *self.status.lock().unwrap() = WorkerStatus::Online;
        self.force_stop.store(false, Ordering::SeqCst);
        tracing::info!(job_id = job.job_id, input = %job.input_path, "starting job");

        let outcome = if self.cfg.ffmpeg_path.is_empty() {
            tracing::error!("FFmpeg executable not found; set FFARM_FFMPEG or add ffmpeg to PATH");
            encoder::JobOutcome {
                success: false,
                return_code: Some(-1),
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                error_message: Some("FFmpeg failed".to_string()),
            }
        } else {
            self.run_encoder(&job).await
        };

        self.send_completion(job.job_id, &outcome).await;

        *self.current_job_id.lock().unwrap() = None;
        self.force_stop.store(false, Ordering::SeqCst);
        *self.status.lock().unwrap() =
            if self.accept_leases.load(Ordering::SeqCst) { WorkerStatus::Online } else { WorkerStatus::Stopped };
        tracing::info!(job_id = job.job_id, success = outcome.success, return_code = ?outcome.return_code, "job finished");
    }

    async fn run_encoder(&self, job: &ActiveJob) -> encoder::JobOutcome {
        let duration = encoder::probe_duration_secs(&self.cfg.ffprobe_path, &job.input_path).await;

        if let Some(parent) = Path::new(&job.output_path).parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(%err, path = %parent.display(), "failed to create output directory");
            }
        }

        let (progress_tx, mut progress_rx) = watch::channel(encoder::ProgressTick::default());
        let reporter = {
            let client = self.client.clone();
            let master_url = self.cfg.master_url.clone();
            let worker_id = self.cfg.worker_id.clone();
            let job_id = job.job_id;
            tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let tick = progress_rx.borrow().clone();
                    let body = ProgressRequest {
                        worker_id: worker_id.clone(),
                        progress: tick.fraction,
                        stdout_tail: Some(tick.stdout_tail),
                        stderr_tail: Some(tick.stderr_tail),
                    };
                    if let Err(err) = client
                        .post(format!("{master_url}/api/v1/jobs/{job_id}/progress"))
                        .json(&body)
                        .send()
                        .await
                    {
                        tracing::warn!(%err, "progress report failed");
                    }
                }
            })
        };

        let outcome =
            encoder::execute(&self.cfg.ffmpeg_path, &job.argv, duration, self.force_stop.clone(), progress_tx).await;
        let _ = reporter.await;
        outcome
    }

    async fn send_completion(&self, job_id: i64, outcome: &encoder::JobOutcome) {
        let body = CompletionReport {
            worker_id: self.cfg.worker_id.clone(),
            success: outcome.success,
            return_code: outcome.return_code,
            stderr_tail: Some(outcome.stderr_tail.clone()),
            stdout_tail: Some(outcome.stdout_tail.clone()),
            error_message: outcome.error_message.clone(),
        };
        if let Err(err) = self
            .client
            .post(format!("{}/api/v1/jobs/{job_id}/complete", self.cfg.master_url))
            .json(&body)
            .send()
            .await
        {
            tracing::error!(%err, job_id, "failed to report completion");
        }
    }
}

/// Resolve both encoder tools up front so a missing `ffmpeg` is reported
/// once at startup rather than silently degrading every job to failure.
pub fn resolve_encoder_tools() -> (String, String) {
    let ffmpeg = resolve_tool("FFARM_FFMPEG", "ffmpeg", COMMON_FFMPEG_PATHS).unwrap_or_default();
    let ffprobe = resolve_tool("FFARM_FFPROBE", "ffprobe", COMMON_FFPROBE_PATHS).unwrap_or_default();
    if ffmpeg.is_empty() {
        tracing::warn!("ffmpeg not found on PATH or FFARM_FFMPEG; jobs will fail until resolved");
    }
    if ffprobe.is_empty() {
        tracing::warn!("ffprobe not found on PATH or FFARM_FFPROBE; duration tracking disabled");
    }
    (ffmpeg, ffprobe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_master_url_prefers_explicit_argument() {
        let url = resolve_master_url(Some("http://master.local:8000/"), Duration::from_millis(1)).unwrap();
        assert_eq!(url, "http://master.local:8000");
    }

    #[test]
    fn resolve_master_url_falls_back_to_env_var() {
        // SAFETY: tests run single-threaded within this process's env scope for this var.
        unsafe { std::env::set_var("FFARM_MASTER_URL", "http://from-env:8000") };
        let url = resolve_master_url(None, Duration::from_millis(1)).unwrap();
        unsafe { std::env::remove_var("FFARM_MASTER_URL") };
        assert_eq!(url, "http://from-env:8000");
    }

    #[test]
    fn which_finds_an_executable_known_to_exist_on_posix_systems() {
        assert!(which("sh").is_some());
    }
}
