use thiserror::Error;

/// Errors surfaced by the Job Store. Most are expected to be logged and
/// folded back into the caller's control loop rather than propagated
/// as a hard failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("transaction conflict, retries exhausted")]
    Conflict,
}

/// Errors from the profile registry (the `Profile` capability).
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown profile: {0}")]
    Unknown(String),
}

/// Errors from mDNS advertisement and lookup. Discovery is a
/// convenience, not a correctness requirement — callers are expected to
/// log these and fall back to an explicit `--master`/config value.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Mdns(#[from] mdns_sd::Error),

    #[error("no local, non-loopback IPv4 address found to advertise")]
    NoAdvertisableAddress,
}

/// Errors from the worker agent's own control loop. Per the error
/// handling design, only unrecoverable startup errors should bubble out
/// of `run()`; everything else is logged and retried on the next tick.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unable to resolve a master URL: set --master, FFARM_MASTER_URL, or enable discovery")]
    NoMaster,

    #[error("encoder executable not found; set FFARM_FFMPEG or add ffmpeg to PATH")]
    EncoderMissing,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
