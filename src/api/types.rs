//! Wire types for the Control API, field-for-field matching spec.md
//! §4.4 (the wire name is `encoder_argv`, not the original's
//! `ffmpeg_args`).

use crate::models::{Job, Worker, WorkerStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LeaseResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub encoder_argv: Vec<String>,
    pub accept_leases: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub worker_id: String,
    pub progress: f64,
    #[serde(default)]
    pub stderr_tail: Option<String>,
    #[serde(default)]
    pub stdout_tail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionReport {
    pub worker_id: String,
    pub success: bool,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub stderr_tail: Option<String>,
    #[serde(default)]
    pub stdout_tail: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusOk {
    pub status: String,
}

impl StatusOk {
    pub fn ok() -> Self {
        Self { status: "ok".to_string() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedCount {
    pub deleted: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub running_job_id: Option<i64>,
    pub status: WorkerStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accept_leases: bool,
    pub status: WorkerStatus,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub root: String,
    pub profile_id: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub paused: bool,
}

pub type JobView = Job;
pub type WorkerView = Worker;
