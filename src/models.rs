//! Job and Worker entities and their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `state ∈ {PENDING, LEASED, RUNNING, SUCCEEDED, FAILED}`.
///
/// Lifecycle: `PENDING → LEASED → RUNNING → {SUCCEEDED, FAILED}`, with
/// recovery edges `LEASED|RUNNING → PENDING` (lease expiry, explicit
/// release, worker offline) and the admin edge `FAILED → PENDING` (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Leased,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Leased => "LEASED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => JobState::Pending,
            "LEASED" => JobState::Leased,
            "RUNNING" => JobState::Running,
            "SUCCEEDED" => JobState::Succeeded,
            "FAILED" => JobState::Failed,
            _ => return None,
        })
    }

    pub fn holds_lease(self) -> bool {
        matches!(self, JobState::Leased | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A unit of transcode work. See §3 of the design for the full invariant
/// set; the store is the only writer of these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub input_path: String,
    pub output_path: String,
    pub profile_id: String,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub progress: f64,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub stderr_tail: Option<String>,
    pub stdout_tail: Option<String>,
    pub error_message: Option<String>,
}

/// `status ∈ {ONLINE, STOPPING, FORCE_STOPPING, STOPPED, OFFLINE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Online,
    Stopping,
    ForceStopping,
    Stopped,
    Offline,
}

impl WorkerStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            WorkerStatus::Online => "ONLINE",
            WorkerStatus::Stopping => "STOPPING",
            WorkerStatus::ForceStopping => "FORCE_STOPPING",
            WorkerStatus::Stopped => "STOPPED",
            WorkerStatus::Offline => "OFFLINE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "ONLINE" => WorkerStatus::Online,
            "STOPPING" => WorkerStatus::Stopping,
            "FORCE_STOPPING" => WorkerStatus::ForceStopping,
            "STOPPED" => WorkerStatus::Stopped,
            "OFFLINE" => WorkerStatus::Offline,
            _ => return None,
        })
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub last_seen: DateTime<Utc>,
    pub status: WorkerStatus,
    pub running_job_id: Option<i64>,
    pub accept_leases: bool,
}
