//! The Job Store: durable persistence of jobs and workers, with
//! atomic state transitions. A single `rusqlite::Connection` behind a
//! mutex gives single-writer-per-row transaction discipline without the
//! complexity of a connection pool — appropriate at LAN-worker scale.

mod lease;
mod schema;

pub use lease::{
    CompleteOutcome, complete, expire_leases, lease_next, mark_running, release_worker, renew,
    update_progress,
};

use crate::error::StoreError;
use crate::models::{Job, JobState, Worker, WorkerStatus};
use crate::profile::EnqueueRules;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// Video file extensions the enqueue walk looks for, matching the
/// original reference implementation's `VIDEO_EXTENSIONS` set.
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "mxf", "mkv", "avi", "m4v"];

pub enum EnqueueOutcome {
    Added(i64),
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueSummary {
    pub added: usize,
    pub skipped: usize,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(rusqlite::Error::InvalidPath(
                    format!("{}: {e}", parent.display()).into(),
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---- Job queries -----------------------------------------------

    pub fn get_job(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![state.as_db_str()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_jobs(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0u64;
        let tx = conn.unchecked_transaction()?;
        for id in ids {
            deleted += tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])? as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn delete_by_state(&self, state: JobState) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM jobs WHERE state = ?1", params![state.as_db_str()])?;
        Ok(n as u64)
    }

    pub fn delete_all_jobs(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM jobs", [])?;
        Ok(n as u64)
    }

    /// Transition all FAILED jobs back to PENDING, clearing transient
    /// fields. Idempotent: applying it twice yields the same state.
    pub fn reset_failed(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = 'PENDING', worker_id = NULL, lease_until = NULL,
                progress = 0.0, return_code = NULL, error_message = NULL
             WHERE state = 'FAILED'",
            [],
        )?;
        Ok(n as u64)
    }

    /// Insert a single job row if `input_path` is not already present.
    pub fn enqueue(
        &self,
        input_path: &str,
        output_path: &str,
        profile_id: &str,
    ) -> Result<EnqueueOutcome, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO jobs
                (input_path, output_path, profile_id, state, progress, attempts, created_at)
             VALUES (?1, ?2, ?3, 'PENDING', 0.0, 0, ?4)",
            params![input_path, output_path, profile_id, now],
        )?;
        if changed == 0 {
            return Ok(EnqueueOutcome::AlreadyPresent);
        }
        Ok(EnqueueOutcome::Added(conn.last_insert_rowid()))
    }

    /// Recursively walk `root`, enqueueing every matching video file
    /// under `profile_id` per the enqueue policy in §4.1: extension
    /// filter, profile-output-directory skip, already-enqueued skip,
    /// prefix filter, proxy-suffix exclusion, collision-suffixed output
    /// paths unique across both the store and the filesystem.
    pub fn enqueue_folder(
        &self,
        root: &Path,
        profile_id: &str,
        rules: &EnqueueRules,
        output_subdirs: &HashSet<&str>,
    ) -> Result<EnqueueSummary, StoreError> {
        let mut existing_inputs: HashSet<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT input_path FROM jobs")?;
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?
        };
        let mut existing_outputs: HashSet<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT output_path FROM jobs")?;
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?
        };

        let mut summary = EnqueueSummary::default();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !e.file_type().is_dir()
                    || e.file_name()
                        .to_str()
                        .map(|name| !output_subdirs.contains(name))
                        .unwrap_or(true)
            })
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || !is_video_file(path) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");

            if let Some(prefix) = rules.filter_prefix {
                if !file_name.starts_with(prefix) {
                    continue;
                }
            }
            if rules.ignore_proxy_suffix && stem.ends_with("_Proxy") {
                continue;
            }

            let input_path = path.to_string_lossy().to_string();
            if existing_inputs.contains(&input_path) {
                summary.skipped += 1;
                continue;
            }

            let output_path = derive_output_path(root, path, rules, &existing_outputs);
            let output_str = output_path.to_string_lossy().to_string();

            match self.enqueue(&input_path, &output_str, profile_id)? {
                EnqueueOutcome::Added(_) => {
                    summary.added += 1;
                    existing_inputs.insert(input_path);
                    existing_outputs.insert(output_str);
                }
                EnqueueOutcome::AlreadyPresent => {
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Overwrite the stored stdout/stderr tails, independent of the
    /// lease-ownership check `update_progress` performs (the progress
    /// handler calls `update_progress` first, which already rejects
    /// stale reports; this just persists the text alongside it).
    pub fn set_job_tails(
        &self,
        job_id: i64,
        stdout_tail: Option<&str>,
        stderr_tail: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET stdout_tail = ?2, stderr_tail = ?3 WHERE id = ?1",
            params![job_id, stdout_tail, stderr_tail],
        )?;
        Ok(())
    }

    // ---- Worker queries ---------------------------------------------

    pub fn get_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM workers WHERE id = ?1", params![id], row_to_worker)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], row_to_worker)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_offline_workers(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM workers WHERE status = 'OFFLINE'", [])?;
        Ok(n as u64)
    }

    /// Create-or-refresh a worker row: sets name/base_url/last_seen=now;
    /// if the worker was OFFLINE, flips it back to ONLINE with
    /// `accept_leases=true`. Used by both the lease and heartbeat
    /// endpoints (spec.md §4.3, §4.4 step 1).
    pub fn upsert_worker(&self, id: &str, name: &str, base_url: &str) -> Result<Worker, StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT OR IGNORE INTO workers (id, name, base_url, last_seen, status, running_job_id, accept_leases)
             VALUES (?1, ?2, ?3, ?4, 'ONLINE', NULL, 1)",
            params![id, name, base_url, now],
        )?;
        conn.execute(
            "UPDATE workers SET name = ?2, base_url = ?3, last_seen = ?4,
                status = CASE WHEN status = 'OFFLINE' THEN 'ONLINE' ELSE status END,
                accept_leases = CASE WHEN status = 'OFFLINE' THEN 1 ELSE accept_leases END
             WHERE id = ?1",
            params![id, name, base_url, now],
        )?;
        fetch_worker(&conn, id)
    }

    pub fn touch_last_seen(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET last_seen = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: WorkerStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET status = ?2 WHERE id = ?1",
            params![id, status.as_db_str()],
        )?;
        Ok(())
    }

    pub fn set_running_job(&self, id: &str, job_id: Option<i64>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET running_job_id = ?2 WHERE id = ?1",
            params![id, job_id],
        )?;
        Ok(())
    }

    pub fn set_accept_leases(&self, id: &str, accept: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET accept_leases = ?2 WHERE id = ?1",
            params![id, accept],
        )?;
        Ok(())
    }

    /// Mark a worker OFFLINE: `accept_leases=false`, `running_job_id=∅`.
    /// Does not itself release the worker's in-flight job — callers
    /// (the worker sweeper) must also call `release_worker`.
    pub fn mark_offline(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET status = 'OFFLINE', accept_leases = 0, running_job_id = NULL
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Completion's conditional status reset (§9 open question):
    /// set `running_job_id=NULL, status=ONLINE` only if the worker is
    /// currently ONLINE or OFFLINE — a worker that was STOPPING or
    /// FORCE_STOPPING at the moment of completion keeps that status.
    pub fn clear_running_job_if_idle(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET running_job_id = NULL,
                status = CASE WHEN status IN ('ONLINE', 'OFFLINE') THEN 'ONLINE' ELSE status END
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn stop_worker(&self, id: &str, force: bool) -> Result<Option<Worker>, StoreError> {
        let conn = self.conn.lock().unwrap();
        if fetch_worker(&conn, id).is_err() {
            return Ok(None);
        }
        let status = if force { WorkerStatus::ForceStopping } else { WorkerStatus::Stopping };
        conn.execute(
            "UPDATE workers SET status = ?2, accept_leases = 0 WHERE id = ?1",
            params![id, status.as_db_str()],
        )?;
        fetch_worker(&conn, id).map(Some)
    }

    pub fn resume_worker(&self, id: &str) -> Result<Option<Worker>, StoreError> {
        let conn = self.conn.lock().unwrap();
        if fetch_worker(&conn, id).is_err() {
            return Ok(None);
        }
        conn.execute(
            "UPDATE workers SET status = 'ONLINE', accept_leases = 1 WHERE id = ?1",
            params![id],
        )?;
        fetch_worker(&conn, id).map(Some)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Store;
    use chrono::{DateTime, Utc};
    use rusqlite::params;

    /// Backdate a worker's `last_seen` for heartbeat-sweeper tests. Only
    /// the real heartbeat path (`upsert_worker`/`touch_last_seen`) should
    /// ever move this field outside of tests.
    pub fn set_last_seen(store: &Store, worker_id: &str, at: DateTime<Utc>) {
        let conn = store.conn.lock().unwrap();
        conn.execute(
            "UPDATE workers SET last_seen = ?2 WHERE id = ?1",
            params![worker_id, at],
        )
        .unwrap();
    }
}

fn fetch_worker(conn: &Connection, id: &str) -> Result<Worker, StoreError> {
    conn.query_row("SELECT * FROM workers WHERE id = ?1", params![id], row_to_worker)
        .map_err(|_| StoreError::WorkerNotFound(id.to_string()))
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Derive a collision-free output path for `input` under `root`,
/// honoring the profile's output subdirectory, naming pattern, and
/// whether the first path component under `root` should be mirrored
/// into the output tree.
fn derive_output_path(
    root: &Path,
    input: &Path,
    rules: &EnqueueRules,
    existing_outputs: &HashSet<String>,
) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let filename = rules.output_pattern.replace("{stem}", stem);

    let mut out_dir = root.join(rules.output_subdir);
    if rules.mirror_first_subdir {
        if let Ok(rel) = input.strip_prefix(root) {
            if let Some(first) = rel.components().next() {
                if rel.components().count() > 1 {
                    out_dir = out_dir.join(first.as_os_str());
                }
            }
        }
    }

    let base = out_dir.join(&filename);
    if !existing_outputs.contains(&base.to_string_lossy().to_string()) && !base.exists() {
        return base;
    }

    let stem_only = Path::new(&filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&filename)
        .to_string();
    let ext = Path::new(&filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("mov");

    for n in 1.. {
        let candidate = out_dir.join(format!("{stem_only}_{n}.{ext}"));
        let candidate_str = candidate.to_string_lossy().to_string();
        if !existing_outputs.contains(&candidate_str) && !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("collision suffix search does not terminate")
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let state_str: String = row.get("state")?;
    let lease_until: Option<DateTime<Utc>> = row.get("lease_until")?;
    Ok(Job {
        id: row.get("id")?,
        input_path: row.get("input_path")?,
        output_path: row.get("output_path")?,
        profile_id: row.get("profile_id")?,
        state: JobState::from_db_str(&state_str).unwrap_or(JobState::Pending),
        worker_id: row.get("worker_id")?,
        lease_until,
        progress: row.get("progress")?,
        attempts: row.get("attempts")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        return_code: row.get("return_code")?,
        stderr_tail: row.get("stderr_tail")?,
        stdout_tail: row.get("stdout_tail")?,
        error_message: row.get("error_message")?,
    })
}

fn row_to_worker(row: &Row) -> rusqlite::Result<Worker> {
    let status_str: String = row.get("status")?;
    Ok(Worker {
        id: row.get("id")?,
        name: row.get("name")?,
        base_url: row.get("base_url")?,
        last_seen: row.get("last_seen")?,
        status: WorkerStatus::from_db_str(&status_str).unwrap_or(WorkerStatus::Offline),
        running_job_id: row.get("running_job_id")?,
        accept_leases: row.get("accept_leases")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_same_input_twice_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let first = store.enqueue("/a.mov", "/out/a.mov", "prores_proxy_1280").unwrap();
        assert!(matches!(first, EnqueueOutcome::Added(_)));
        let second = store.enqueue("/a.mov", "/out/a2.mov", "prores_proxy_1280").unwrap();
        assert!(matches!(second, EnqueueOutcome::AlreadyPresent));
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn reset_failed_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let EnqueueOutcome::Added(id) = store.enqueue("/a.mov", "/out/a.mov", "p").unwrap() else {
            panic!("expected added");
        };
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE jobs SET state = 'FAILED' WHERE id = ?1", params![id])
                .unwrap();
        }
        let first = store.reset_failed().unwrap();
        assert_eq!(first, 1);
        let second = store.reset_failed().unwrap();
        assert_eq!(second, 0);
        assert_eq!(store.get_job(id).unwrap().unwrap().state, JobState::Pending);
    }

    #[test]
    fn upsert_worker_flips_offline_to_online() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_worker("w1", "Worker 1", "").unwrap();
        store.mark_offline("w1").unwrap();
        assert_eq!(store.get_worker("w1").unwrap().unwrap().status, WorkerStatus::Offline);
        let refreshed = store.upsert_worker("w1", "Worker 1", "").unwrap();
        assert_eq!(refreshed.status, WorkerStatus::Online);
        assert!(refreshed.accept_leases);
    }

    #[test]
    fn completion_status_reset_is_conditional_on_idle_status() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_worker("w1", "Worker 1", "").unwrap();
        store.set_status("w1", WorkerStatus::Stopping).unwrap();
        store.set_running_job("w1", Some(1)).unwrap();
        store.clear_running_job_if_idle("w1").unwrap();
        let worker = store.get_worker("w1").unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Stopping);
        assert_eq!(worker.running_job_id, None);
    }

    #[test]
    fn enqueue_folder_applies_the_full_walk_policy() {
        use crate::profile;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("DJI_0001.mov"), b"").unwrap();
        std::fs::write(root.join("DJI_0001_Proxy.mov"), b"").unwrap();
        std::fs::write(root.join("handheld.mov"), b"").unwrap();
        std::fs::write(root.join("notes.txt"), b"").unwrap();
        std::fs::create_dir_all(root.join("dji_drone_prores_standard")).unwrap();
        std::fs::write(root.join("dji_drone_prores_standard").join("stale.mov"), b"").unwrap();

        let store = Store::open_in_memory().unwrap();
        let rules = profile::enqueue_rules("dji_drone_prores_standard").unwrap();
        let subdirs = profile::output_subdirs();
        let summary = store.enqueue_folder(root, "dji_drone_prores_standard", &rules, &subdirs).unwrap();

        // Only DJI_0001.mov matches: the prefix filter drops handheld.mov
        // and notes.txt, the proxy-suffix exclusion drops
        // DJI_0001_Proxy.mov, and the output-subdir skip keeps the walk
        // out of dji_drone_prores_standard/ entirely.
        assert_eq!(summary.added, 1);
        let jobs = store.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].input_path.ends_with("DJI_0001.mov"));
        assert!(jobs[0].output_path.contains("dji_drone_prores_standard"));

        // Re-walking the same root is a no-op: the one match is already enqueued.
        let second = store.enqueue_folder(root, "dji_drone_prores_standard", &rules, &subdirs).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn enqueue_folder_collision_suffixes_output_paths() {
        use crate::profile;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("a").join("clip.mov"), b"").unwrap();
        std::fs::write(root.join("b").join("clip.mov"), b"").unwrap();

        let store = Store::open_in_memory().unwrap();
        let rules = profile::enqueue_rules("prores_proxy_1280").unwrap();
        let subdirs = profile::output_subdirs();
        let summary = store.enqueue_folder(root, "prores_proxy_1280", &rules, &subdirs).unwrap();

        assert_eq!(summary.added, 2);
        let mut outputs: Vec<String> = store.list_jobs().unwrap().into_iter().map(|j| j.output_path).collect();
        outputs.sort();
        assert_ne!(outputs[0], outputs[1], "colliding stems must get distinct output paths");
    }
}
