use rusqlite::{Connection, Result};

/// Additive-only migration, run on every open. New columns/tables are
/// added with `IF NOT EXISTS`; existing rows are never rewritten here.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_path TEXT NOT NULL UNIQUE,
            output_path TEXT NOT NULL UNIQUE,
            profile_id TEXT NOT NULL,
            state TEXT NOT NULL CHECK(state IN ('PENDING','LEASED','RUNNING','SUCCEEDED','FAILED')),
            worker_id TEXT,
            lease_until TEXT,
            progress REAL NOT NULL DEFAULT 0.0,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            return_code INTEGER,
            stderr_tail TEXT,
            stdout_tail TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs(state, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_lease_until ON jobs(lease_until);
        CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs(worker_id);

        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL DEFAULT '',
            last_seen TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('ONLINE','STOPPING','FORCE_STOPPING','STOPPED','OFFLINE')),
            running_job_id INTEGER,
            accept_leases INTEGER NOT NULL DEFAULT 1
        );
        ",
    )?;

    Ok(())
}
