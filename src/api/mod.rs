//! The Control API: the single HTTP entry point workers use to lease
//! jobs, report progress, report completion, and heartbeat. Built on
//! axum, following the router/`AppState`/`TraceLayer` shape of the
//! ZVault server example this deployment is patterned on.

pub mod types;

use crate::models::WorkerStatus;
use crate::pause::PauseState;
use crate::profile;
use crate::store::{self, CompleteOutcome, Store};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use types::*;

pub struct AppState {
    pub store: Arc<Store>,
    pub pause: PauseState,
    pub lease_duration_secs: i64,
}

/// A `Json<T>` extractor that rejects malformed bodies with 422 rather
/// than axum's default 400, to match spec.md §6's status code table.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err(into_422(rejection)),
        }
    }
}

fn into_422(rejection: JsonRejection) -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()).into_response()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let jobs = Router::new()
        .route("/lease", post(lease))
        .route("/{id}/progress", post(progress))
        .route("/{id}/complete", post(complete))
        .route("/clear-all", post(clear_all_jobs))
        .route("/", get(list_jobs));

    let workers = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/", get(list_workers))
        .route("/{id}/stop", post(stop_worker))
        .route("/{id}/force_stop", post(force_stop_worker))
        .route("/{id}/resume", post(resume_worker))
        .route("/clear_offline", post(clear_offline_workers));

    // Not part of the worker-facing wire contract in spec.md §4.4 — the
    // desktop control surface the spec treats as out of scope drove the
    // pause flag and enqueue walk through direct, in-process calls in the
    // original. Exposed here over the same HTTP surface since this
    // deployment has no in-process admin UI to call them from instead.
    let admin = Router::new()
        .route("/pause", post(set_pause))
        .route("/enqueue", post(enqueue));

    Router::new()
        .nest("/api/v1/jobs", jobs)
        .nest("/api/v1/workers", workers)
        .nest("/api/v1/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn lease(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<LeaseRequest>,
) -> Result<Json<LeaseResponse>, ApiError> {
    let worker = state.store.upsert_worker(&req.worker_id, &req.name, &req.base_url)?;
    let mut response = LeaseResponse { accept_leases: worker.accept_leases, ..Default::default() };

    if worker.status == WorkerStatus::ForceStopping {
        response.action = Some("force_stop".to_string());
        return Ok(Json(response));
    }
    if worker.status == WorkerStatus::Stopping {
        response.action = Some("stop".to_string());
        return Ok(Json(response));
    }
    if state.pause.is_paused() {
        response.accept_leases = false;
        return Ok(Json(response));
    }
    if !worker.accept_leases {
        return Ok(Json(response));
    }

    if let Some(job) = store::lease_next(&state.store, &req.worker_id, state.lease_duration_secs)? {
        let argv = profile::materialize(&job.profile_id, &job.input_path, &job.output_path)?;
        response.job_id = Some(job.id);
        response.profile = Some(job.profile_id);
        response.input_path = Some(job.input_path);
        response.output_path = Some(job.output_path);
        response.encoder_argv = argv;
    }
    Ok(Json(response))
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ValidatedJson(req): ValidatedJson<ProgressRequest>,
) -> Result<Json<StatusOk>, ApiError> {
    // A progress report is also a liveness signal: renew the lease so an
    // actively-running job doesn't expire and get stolen out from under
    // its worker mid-encode (spec.md's `renew` semantics).
    store::renew(&state.store, id, &req.worker_id, state.lease_duration_secs)?;
    store::mark_running(&state.store, id, &req.worker_id)?;
    store::update_progress(&state.store, id, &req.worker_id, req.progress)?;
    update_tails(&state.store, id, &req.worker_id, req.stdout_tail.as_deref(), req.stderr_tail.as_deref())?;
    Ok(Json(StatusOk::ok()))
}

fn update_tails(
    store: &Store,
    job_id: i64,
    worker_id: &str,
    stdout_tail: Option<&str>,
    stderr_tail: Option<&str>,
) -> Result<(), crate::error::StoreError> {
    // Only the owning worker's tails are accepted; a stale report from a
    // worker that lost the lease is ignored like every other lease-scoped
    // mutation (spec.md §4.2).
    if let Some(job) = store.get_job(job_id)? {
        if job.worker_id.as_deref() == Some(worker_id) {
            store.set_job_tails(job_id, stdout_tail, stderr_tail)?;
        }
    }
    Ok(())
}

async fn complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ValidatedJson(req): ValidatedJson<CompletionReport>,
) -> Result<Json<StatusOk>, ApiError> {
    let outcome = store::complete(
        &state.store,
        id,
        &req.worker_id,
        req.success,
        req.return_code,
        req.stdout_tail.as_deref(),
        req.stderr_tail.as_deref(),
        req.error_message.as_deref(),
    )?;
    if matches!(outcome, CompleteOutcome::Recorded) {
        state.store.clear_running_job_if_idle(&req.worker_id)?;
    }
    Ok(Json(StatusOk::ok()))
}

async fn clear_all_jobs(State(state): State<Arc<AppState>>) -> Result<Json<DeletedCount>, ApiError> {
    let deleted = state.store.delete_all_jobs()?;
    Ok(Json(DeletedCount { deleted }))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(state.store.list_jobs()?))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    // The heartbeat body's `status` is informational only — the worker's
    // own view of itself, which may simply be stale ONLINE if it hasn't
    // learned about a master-issued stop/force_stop yet. The master is
    // authoritative on STOPPING/FORCE_STOPPING/OFFLINE; the only
    // heartbeat-driven transition is OFFLINE -> ONLINE, already applied
    // by `upsert_worker`. Never let a self-report clobber it back.
    let worker = state.store.upsert_worker(&req.worker_id, &req.name, &req.base_url)?;
    state.store.touch_last_seen(&req.worker_id)?;
    state.store.set_running_job(&req.worker_id, req.running_job_id)?;
    Ok(Json(HeartbeatResponse { accept_leases: worker.accept_leases, status: worker.status }))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<WorkerView>>, ApiError> {
    Ok(Json(state.store.list_workers()?))
}

async fn stop_worker(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<WorkerView>, ApiError> {
    state.store.stop_worker(&id, false)?.map(Json).ok_or(ApiError::NotFound)
}

async fn force_stop_worker(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<WorkerView>, ApiError> {
    state.store.stop_worker(&id, true)?.map(Json).ok_or(ApiError::NotFound)
}

async fn resume_worker(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<WorkerView>, ApiError> {
    state.store.resume_worker(&id)?.map(Json).ok_or(ApiError::NotFound)
}

async fn clear_offline_workers(State(state): State<Arc<AppState>>) -> Result<Json<DeletedCount>, ApiError> {
    let deleted = state.store.delete_offline_workers()?;
    Ok(Json(DeletedCount { deleted }))
}

async fn set_pause(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<PauseRequest>,
) -> Json<PauseResponse> {
    state.pause.set(req.paused);
    Json(PauseResponse { paused: req.paused })
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let rules = profile::enqueue_rules(&req.profile_id)?;
    let subdirs = profile::output_subdirs();
    let summary = state
        .store
        .enqueue_folder(std::path::Path::new(&req.root), &req.profile_id, &rules, &subdirs)?;
    Ok(Json(EnqueueResponse { added: summary.added, skipped: summary.skipped }))
}

pub enum ApiError {
    Store(crate::error::StoreError),
    Profile(crate::error::ProfileError),
    NotFound,
}

impl From<crate::error::StoreError> for ApiError {
    fn from(e: crate::error::StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<crate::error::ProfileError> for ApiError {
    fn from(e: crate::error::ProfileError) -> Self {
        ApiError::Profile(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "worker not found".to_string()).into_response(),
            ApiError::Profile(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response(),
            ApiError::Store(err) => {
                tracing::error!(%err, "store error handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}
