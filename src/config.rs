//! Configuration for both binaries: a TOML file under `~/.ffarm/` with
//! serde defaults for every field, so a missing or partial file is
//! always a valid configuration. CLI flags (see `src/bin/*.rs`) are
//! applied on top of whatever this module loads.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn ffarm_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".ffarm")
}

pub fn default_db_path() -> PathBuf {
    ffarm_home().join("ffarm.sqlite3")
}

fn default_master_config_path() -> PathBuf {
    ffarm_home().join("master.toml")
}

fn default_worker_config_path() -> PathBuf {
    ffarm_home().join("worker.toml")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_lease_duration_secs() -> i64 {
    15 * 60
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub db_path: PathBuf,
    pub lease_duration_secs: i64,
    pub heartbeat_timeout_secs: u64,
    pub advertise: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            db_path: default_db_path(),
            lease_duration_secs: default_lease_duration_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            advertise: default_true(),
        }
    }
}

impl MasterConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        load_toml_or_default(path.map(Path::to_path_buf).unwrap_or_else(default_master_config_path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub master_url: Option<String>,
    pub worker_id: Option<String>,
    pub name: Option<String>,
    pub log_level: String,
    pub advertise: bool,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_url: None,
            worker_id: None,
            name: None,
            log_level: default_log_level(),
            advertise: default_true(),
            poll_interval_secs: default_poll_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        load_toml_or_default(path.map(Path::to_path_buf).unwrap_or_else(default_worker_config_path))
    }
}

fn load_toml_or_default<T: Default + for<'de> Deserialize<'de>>(path: PathBuf) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
}
