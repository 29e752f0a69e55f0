//! Shared core for the `ffarm` master and worker binaries.
//!
//! The Job Store, Lease Manager, Heartbeat sweepers, profile registry and
//! discovery glue all live here so that both `ffarm-master` and
//! `ffarm-worker` build on the same durable types and wire contract.

pub mod agent;
pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod pause;
pub mod profile;
pub mod store;
pub mod sweep;

pub use error::{AgentError, DiscoveryError, ProfileError, StoreError};
pub use models::{Job, JobState, Worker, WorkerStatus};
pub use pause::PauseState;
pub use store::Store;
