//! Lease acquisition and release: the FIFO-then-steal selection
//! algorithm and the state transitions that follow from it.
//!
//! Selection order, per job: first the oldest `PENDING` job; if none
//! exists, the oldest job whose lease has strictly expired
//! (`lease_until < now`), stolen back from whatever worker held it.
//! Both checks and the resulting update happen inside one transaction
//! so two workers racing `lease_next` never claim the same job.

use super::{Store, row_to_job};
use crate::error::StoreError;
use crate::models::Job;
use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};

pub enum CompleteOutcome {
    Recorded,
    NotOwner,
}

/// Claim the next available job for `worker_id`, extending its lease
/// `lease_duration_secs` seconds into the future and bumping `attempts`.
/// Returns `None` when no job is eligible.
pub fn lease_next(store: &Store, worker_id: &str, lease_duration_secs: i64) -> Result<Option<Job>, StoreError> {
    let conn = store.conn.lock().unwrap();
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let candidate: Option<i64> = tx
        .query_row(
            "SELECT id FROM jobs WHERE state = 'PENDING' ORDER BY created_at ASC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;

    let candidate = match candidate {
        Some(id) => Some(id),
        None => tx
            .query_row(
                "SELECT id FROM jobs WHERE state IN ('LEASED', 'RUNNING') AND lease_until < ?1
                 ORDER BY lease_until ASC LIMIT 1",
                params![now],
                |r| r.get(0),
            )
            .optional()?,
    };

    let Some(id) = candidate else {
        tx.commit()?;
        return Ok(None);
    };

    let lease_until = now + Duration::seconds(lease_duration_secs);
    tx.execute(
        "UPDATE jobs SET state = 'LEASED', worker_id = ?1, lease_until = ?2, attempts = attempts + 1,
            started_at = COALESCE(started_at, ?4)
         WHERE id = ?3",
        params![worker_id, lease_until, id, now],
    )?;
    let job = tx.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)?;
    tx.commit()?;
    Ok(Some(job))
}

/// Extend an already-held lease. Returns `false` if `worker_id` does
/// not currently hold `job_id` (lost to expiry or another owner).
pub fn renew(store: &Store, job_id: i64, worker_id: &str, lease_duration_secs: i64) -> Result<bool, StoreError> {
    let conn = store.conn.lock().unwrap();
    let lease_until = Utc::now() + Duration::seconds(lease_duration_secs);
    let n = conn.execute(
        "UPDATE jobs SET lease_until = ?1
         WHERE id = ?2 AND worker_id = ?3 AND state IN ('LEASED', 'RUNNING')",
        params![lease_until, job_id, worker_id],
    )?;
    Ok(n > 0)
}

/// First progress report after a lease: flips `LEASED → RUNNING`.
/// `started_at` is already stamped by `lease_next`; the `COALESCE` here
/// only guards against a lease acquired before that column existed. A
/// no-op (but not an error) once already RUNNING.
pub fn mark_running(store: &Store, job_id: i64, worker_id: &str) -> Result<bool, StoreError> {
    let conn = store.conn.lock().unwrap();
    let n = conn.execute(
        "UPDATE jobs SET state = 'RUNNING', started_at = COALESCE(started_at, ?1)
         WHERE id = ?2 AND worker_id = ?3 AND state IN ('LEASED', 'RUNNING')",
        params![Utc::now(), job_id, worker_id],
    )?;
    Ok(n > 0)
}

/// Update the progress fraction (`0.0..=1.0`) reported by the owning
/// worker. Ignored if that worker no longer holds the job.
pub fn update_progress(store: &Store, job_id: i64, worker_id: &str, progress: f64) -> Result<bool, StoreError> {
    let conn = store.conn.lock().unwrap();
    let n = conn.execute(
        "UPDATE jobs SET progress = ?1
         WHERE id = ?2 AND worker_id = ?3 AND state IN ('LEASED', 'RUNNING')",
        params![progress.clamp(0.0, 1.0), job_id, worker_id],
    )?;
    Ok(n > 0)
}

/// Record the terminal outcome of a job. Only applied if `worker_id`
/// still owns the job; otherwise the report is stale (the lease was
/// already stolen) and is dropped.
#[allow(clippy::too_many_arguments)]
pub fn complete(
    store: &Store,
    job_id: i64,
    worker_id: &str,
    success: bool,
    return_code: Option<i32>,
    stdout_tail: Option<&str>,
    stderr_tail: Option<&str>,
    error_message: Option<&str>,
) -> Result<CompleteOutcome, StoreError> {
    let conn = store.conn.lock().unwrap();
    let state = if success { "SUCCEEDED" } else { "FAILED" };
    let progress = if success { 1.0 } else { 0.0 };
    let n = conn.execute(
        "UPDATE jobs SET state = ?1, finished_at = ?2, progress = CASE WHEN ?7 THEN ?3 ELSE progress END,
            return_code = ?4, stdout_tail = ?5, stderr_tail = ?6, error_message = ?8,
            worker_id = NULL, lease_until = NULL
         WHERE id = ?9 AND worker_id = ?10 AND state IN ('LEASED', 'RUNNING')",
        params![
            state,
            Utc::now(),
            progress,
            return_code,
            stdout_tail,
            stderr_tail,
            success,
            error_message,
            job_id,
            worker_id,
        ],
    )?;
    Ok(if n > 0 { CompleteOutcome::Recorded } else { CompleteOutcome::NotOwner })
}

/// Release every job whose lease has strictly expired back to
/// `PENDING`. The lease sweeper's periodic backstop — `lease_next`'s
/// steal path makes this non-essential for correctness, but it keeps
/// queue state visible (a stuck job shows as `PENDING`, not as a
/// phantom `LEASED` job under a worker that vanished) well before
/// another worker happens to poll.
pub fn expire_leases(store: &Store) -> Result<u64, StoreError> {
    let conn = store.conn.lock().unwrap();
    let n = conn.execute(
        "UPDATE jobs SET state = 'PENDING', worker_id = NULL, lease_until = NULL
         WHERE state IN ('LEASED', 'RUNNING') AND lease_until < ?1",
        params![Utc::now()],
    )?;
    Ok(n as u64)
}

/// Release every job leased to `worker_id`, regardless of expiry.
/// Used when a worker is declared OFFLINE by the heartbeat sweeper.
pub fn release_worker(store: &Store, worker_id: &str) -> Result<u64, StoreError> {
    let conn = store.conn.lock().unwrap();
    let n = conn.execute(
        "UPDATE jobs SET state = 'PENDING', worker_id = NULL, lease_until = NULL
         WHERE worker_id = ?1 AND state IN ('LEASED', 'RUNNING')",
        params![worker_id],
    )?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EnqueueOutcome;

    fn job_id(store: &Store, input: &str) -> i64 {
        match store.enqueue(input, &format!("{input}.out"), "prores_proxy_1280").unwrap() {
            EnqueueOutcome::Added(id) => id,
            EnqueueOutcome::AlreadyPresent => panic!("expected a fresh insert"),
        }
    }

    #[test]
    fn lease_next_prefers_oldest_pending() {
        let store = Store::open_in_memory().unwrap();
        let first = job_id(&store, "/a.mov");
        let _second = job_id(&store, "/b.mov");
        let leased = lease_next(&store, "w1", 900).unwrap().unwrap();
        assert_eq!(leased.id, first);
        assert_eq!(leased.attempts, 1);
    }

    #[test]
    fn lease_next_steals_only_strictly_expired_leases() {
        let store = Store::open_in_memory().unwrap();
        let id = job_id(&store, "/a.mov");
        lease_next(&store, "w1", 900).unwrap();
        assert!(lease_next(&store, "w2", 900).unwrap().is_none());

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET lease_until = ?1 WHERE id = ?2",
                params![Utc::now() - Duration::seconds(1), id],
            )
            .unwrap();
        }
        let stolen = lease_next(&store, "w2", 900).unwrap().unwrap();
        assert_eq!(stolen.id, id);
        assert_eq!(stolen.worker_id.as_deref(), Some("w2"));
        assert_eq!(stolen.attempts, 2);
    }

    #[test]
    fn lease_next_stamps_started_at_immediately() {
        let store = Store::open_in_memory().unwrap();
        job_id(&store, "/a.mov");
        let leased = lease_next(&store, "w1", 900).unwrap().unwrap();
        assert!(leased.started_at.is_some(), "attempts >= 1 must imply started_at is set");
    }

    #[test]
    fn complete_clears_worker_id_and_lease_until() {
        let store = Store::open_in_memory().unwrap();
        let id = job_id(&store, "/a.mov");
        lease_next(&store, "w1", 900).unwrap();
        complete(&store, id, "w1", true, Some(0), None, None, None).unwrap();
        let job = store.get_job(id).unwrap().unwrap();
        assert!(job.worker_id.is_none());
        assert!(job.lease_until.is_none());
    }

    #[test]
    fn complete_is_rejected_for_non_owner() {
        let store = Store::open_in_memory().unwrap();
        let id = job_id(&store, "/a.mov");
        lease_next(&store, "w1", 900).unwrap();
        let outcome = complete(&store, id, "w2", true, Some(0), None, None, None).unwrap();
        assert!(matches!(outcome, CompleteOutcome::NotOwner));
        assert_eq!(store.get_job(id).unwrap().unwrap().state, crate::models::JobState::Leased);
    }

    #[test]
    fn complete_success_marks_succeeded_and_full_progress() {
        let store = Store::open_in_memory().unwrap();
        let id = job_id(&store, "/a.mov");
        lease_next(&store, "w1", 900).unwrap();
        mark_running(&store, id, "w1").unwrap();
        let outcome = complete(&store, id, "w1", true, Some(0), Some("done"), None, None).unwrap();
        assert!(matches!(outcome, CompleteOutcome::Recorded));
        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.state, crate::models::JobState::Succeeded);
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn expire_leases_only_touches_strictly_expired_rows() {
        let store = Store::open_in_memory().unwrap();
        let still_valid = job_id(&store, "/a.mov");
        let expired = job_id(&store, "/b.mov");
        lease_next(&store, "w1", 900).unwrap();
        lease_next(&store, "w1", 900).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET lease_until = ?1 WHERE id = ?2",
                params![Utc::now() - Duration::seconds(1), expired],
            )
            .unwrap();
        }
        let n = expire_leases(&store).unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get_job(expired).unwrap().unwrap().state, crate::models::JobState::Pending);
        assert_eq!(store.get_job(still_valid).unwrap().unwrap().state, crate::models::JobState::Leased);
    }
}
