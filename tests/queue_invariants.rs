//! Property tests for the job state machine, per spec.md §8's
//! "Invariants" and "Round-trip laws": generate arbitrary sequences of
//! queue operations and check the §3 data-model invariants hold at
//! every quiescent point, rather than only in the handful of scenarios
//! exercised by `tests/scenarios.rs`.

use ffarm::models::JobState;
use ffarm::store::{EnqueueOutcome, Store};
use proptest::prelude::*;

const PROFILE: &str = "prores_proxy_1280";
const LEASE_SECS: i64 = 900;

#[derive(Debug, Clone, Copy)]
enum Step {
    Lease { worker: u8 },
    Complete { worker: u8, success: bool },
    Expire,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..3).prop_map(|worker| Step::Lease { worker }),
        (0u8..3, any::<bool>()).prop_map(|(worker, success)| Step::Complete { worker, success }),
        Just(Step::Expire),
    ]
}

fn worker_id(n: u8) -> String {
    format!("w{n}")
}

/// `Store::open_in_memory` is `#[cfg(test)]`-only, so it isn't visible
/// from this external integration test binary; use a throwaway on-disk
/// database instead, the same way `ffarm-master` opens one.
fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("ffarm.sqlite3")).unwrap();
    (dir, store)
}

/// Every invariant from spec.md §3 that must hold after *every*
/// committed transaction, checked here after every applied step.
fn assert_invariants(store: &Store) {
    for job in store.list_jobs().unwrap() {
        match job.state {
            JobState::Leased | JobState::Running => {
                assert!(job.worker_id.is_some(), "job {} in {:?} must have a worker_id", job.id, job.state);
                assert!(job.lease_until.is_some(), "job {} in {:?} must have a lease_until", job.id, job.state);
            }
            JobState::Pending | JobState::Succeeded | JobState::Failed => {
                assert!(job.worker_id.is_none(), "job {} in {:?} must not have a worker_id", job.id, job.state);
                assert!(job.lease_until.is_none(), "job {} in {:?} must not have a lease_until", job.id, job.state);
            }
        }
        if job.state == JobState::Succeeded {
            assert_eq!(job.progress, 1.0, "job {} SUCCEEDED must have progress = 1.0", job.id);
        }
        if job.attempts >= 1 {
            assert!(job.started_at.is_some(), "job {} with attempts >= 1 must have started_at", job.id);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For all sequences of lease/complete/expire operations over a
    /// fixed pool of PENDING jobs, the §3 invariants hold after every
    /// step, and at most one worker ever holds a given job at a time.
    #[test]
    fn invariants_hold_across_arbitrary_operation_sequences(steps in prop::collection::vec(step_strategy(), 0..40)) {
        let (_dir, store) = open_store();
        for i in 0..5 {
            store.enqueue(&format!("/in/{i}.mov"), &format!("/out/{i}.mov"), PROFILE).unwrap();
        }

        // Tracks which worker (if any) this test believes owns each
        // leased job, to check mutual exclusion independently of the
        // store's own bookkeeping.
        let mut owner: std::collections::HashMap<i64, u8> = std::collections::HashMap::new();

        for step in steps {
            match step {
                Step::Lease { worker } => {
                    let id = worker_id(worker);
                    if let Some(job) = ffarm::store::lease_next(&store, &id, LEASE_SECS).unwrap() {
                        if let Some(prior) = owner.insert(job.id, worker) {
                            prop_assert_ne!(prior, worker, "a worker re-leased a job it already owned without an intervening steal");
                        }
                    }
                }
                Step::Complete { worker, success } => {
                    let id = worker_id(worker);
                    for job in store.list_jobs().unwrap() {
                        if job.worker_id.as_deref() == Some(id.as_str()) {
                            ffarm::store::complete(&store, job.id, &id, success, Some(0), None, None, None).unwrap();
                            owner.remove(&job.id);
                        }
                    }
                }
                Step::Expire => {
                    ffarm::store::expire_leases(&store).unwrap();
                    // Expiry can reassign ownership on the next lease;
                    // forget our bookkeeping for jobs it reclaimed.
                    owner.retain(|&id, _| {
                        let job = store.get_job(id).unwrap().unwrap();
                        job.state == JobState::Leased || job.state == JobState::Running
                    });
                }
            }
            assert_invariants(&store);
        }
    }

    /// `reset_failed` is idempotent: a second call changes nothing once
    /// the first has already moved every FAILED job back to PENDING.
    #[test]
    fn reset_failed_is_idempotent(fail_count in 0usize..5, other_count in 0usize..5) {
        let (_dir, store) = open_store();
        for i in 0..fail_count {
            let input = format!("/fail/{i}.mov");
            store.enqueue(&input, &format!("{input}.out"), PROFILE).unwrap();
            // Every prior iteration's job has already left PENDING, so
            // this always leases the one just enqueued.
            if let Some(job) = ffarm::store::lease_next(&store, "w1", LEASE_SECS).unwrap() {
                ffarm::store::complete(&store, job.id, "w1", false, Some(1), None, None, None).unwrap();
            }
        }
        for i in 0..other_count {
            store.enqueue(&format!("/other/{i}.mov"), &format!("/other_out/{i}.mov"), PROFILE).unwrap();
        }

        let first = store.reset_failed().unwrap();
        let snapshot_after_first: Vec<_> = store.list_jobs().unwrap().into_iter().map(|j| (j.id, j.state)).collect();
        let second = store.reset_failed().unwrap();
        let snapshot_after_second: Vec<_> = store.list_jobs().unwrap().into_iter().map(|j| (j.id, j.state)).collect();

        prop_assert_eq!(first as usize, fail_count);
        prop_assert_eq!(second, 0, "a second reset_failed must find nothing left to reset");
        prop_assert_eq!(snapshot_after_first, snapshot_after_second);
    }
}

/// Enqueueing the same input twice is a no-op: `skipped == total`.
#[test]
fn enqueueing_the_same_path_twice_adds_no_new_job() {
    let (_dir, store) = open_store();
    let first = store.enqueue("/in/a.mov", "/out/a.mov", PROFILE).unwrap();
    let second = store.enqueue("/in/a.mov", "/out/a.mov", PROFILE).unwrap();
    assert!(matches!(first, EnqueueOutcome::Added(_)));
    assert!(matches!(second, EnqueueOutcome::AlreadyPresent));
    assert_eq!(store.list_jobs().unwrap().len(), 1);
}

/// `stop(id, force=true); resume(id)` returns the worker to
/// `status=ONLINE, accept_leases=true` (spec.md §8 round-trip law).
#[test]
fn force_stop_then_resume_round_trips_to_online() {
    let (_dir, store) = open_store();
    store.upsert_worker("w1", "Worker 1", "").unwrap();
    store.stop_worker("w1", true).unwrap();
    store.resume_worker("w1").unwrap();
    let worker = store.get_worker("w1").unwrap().unwrap();
    assert_eq!(worker.status, ffarm::models::WorkerStatus::Online);
    assert!(worker.accept_leases);
}
