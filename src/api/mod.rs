//! JSON HTTP surface over the scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::{
    retry_on_conflict, Incompatibility, Machine, MachineId, MachineSnapshot, MachineStatus,
    QueueEntry, Rejection, RequirementSpec, Scheduler, Selection, SubmitRequest,
};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    /// Attempts for mutations that hit a busy machine queue.
    pub retries: u32,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let retries = scheduler.config().conflict_retries;
        Self { scheduler, retries }
    }
}

/// A scheduler error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejections: Option<Vec<Rejection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incompatibility: Option<Incompatibility>,
}

pub fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::NoMatch(_) | SchedulerError::IncompatibleReassignment { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SchedulerError::Conflict { .. } => StatusCode::CONFLICT,
        SchedulerError::InvalidPosition { .. }
        | SchedulerError::InvalidRequest(_)
        | SchedulerError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::EntryNotFound(_) | SchedulerError::MachineNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Scheduler invariant violated");
        }
        let (rejections, incompatibility) = match &err {
            SchedulerError::NoMatch(no_match) => (Some(no_match.rejections.clone()), None),
            SchedulerError::IncompatibleReassignment { reason, .. } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        let body = ErrorResponse {
            error: err.kind(),
            message: err.to_string(),
            rejections,
            incompatibility,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct StatusChangeRequest {
    status: MachineStatus,
    #[serde(default = "default_available")]
    available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Deserialize)]
struct CancelRequest {
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Deserialize)]
struct PositionRequest {
    position: u32,
}

#[derive(Deserialize)]
struct ReassignRequest {
    machine_id: MachineId,
}

#[derive(Deserialize)]
struct RushRequest {
    justification: String,
}

#[derive(Serialize)]
struct RepairResponse {
    machine_id: MachineId,
    changed: bool,
}

#[derive(Serialize)]
struct CompatibleResponse {
    machine_ids: Vec<MachineId>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/machines", get(list_machines_handler))
        .route("/api/machines/:id", get(get_machine_handler))
        .route("/api/machines/:id/status", put(machine_status_handler))
        .route("/api/machines/:id/repair", post(repair_handler))
        .route("/api/entries", post(submit_handler))
        .route("/api/entries/:id", get(get_entry_handler))
        .route("/api/entries/:id/cancel", post(cancel_handler))
        .route("/api/entries/:id/move-up", post(move_up_handler))
        .route("/api/entries/:id/move-down", post(move_down_handler))
        .route("/api/entries/:id/position", put(set_position_handler))
        .route("/api/entries/:id/reassign", post(reassign_handler))
        .route("/api/entries/:id/check-in", post(check_in_handler))
        .route("/api/entries/:id/check-out", post(check_out_handler))
        .route("/api/entries/:id/undo-check-in", post(undo_check_in_handler))
        .route("/api/entries/:id/rush", post(request_rush_handler))
        .route("/api/entries/:id/rush/approve", post(approve_rush_handler))
        .route("/api/entries/:id/rush/reject", post(reject_rush_handler))
        .route("/api/preview", post(preview_handler))
        .route("/api/compatible", post(compatible_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let graceful = async move { shutdown.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
    tracing::info!("API server stopped");
}

async fn list_machines_handler(State(state): State<ApiState>) -> Json<Vec<MachineSnapshot>> {
    Json(
        state
            .scheduler
            .snapshots()
            .iter()
            .map(|snapshot| MachineSnapshot::clone(snapshot))
            .collect(),
    )
}

async fn get_machine_handler(
    State(state): State<ApiState>,
    Path(id): Path<MachineId>,
) -> ApiResult<MachineSnapshot> {
    let snapshot = state.scheduler.snapshot(id)?;
    Ok(Json(MachineSnapshot::clone(&snapshot)))
}

async fn machine_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<MachineId>,
    Json(payload): Json<StatusChangeRequest>,
) -> ApiResult<Machine> {
    let scheduler = &state.scheduler;
    let machine = retry_on_conflict(state.retries, || {
        scheduler.on_machine_status_changed(id, payload.status, payload.available)
    })
    .await?;
    Ok(Json(machine))
}

async fn repair_handler(
    State(state): State<ApiState>,
    Path(id): Path<MachineId>,
) -> ApiResult<RepairResponse> {
    let scheduler = &state.scheduler;
    let changed = retry_on_conflict(state.retries, || scheduler.repair_queue(id)).await?;
    Ok(Json(RepairResponse {
        machine_id: id,
        changed,
    }))
}

async fn submit_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<QueueEntry>), ApiError> {
    let scheduler = &state.scheduler;
    let entry = retry_on_conflict(state.retries, || scheduler.submit(payload.clone())).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_entry_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    Ok(Json(state.scheduler.entry(id).await?))
}

async fn cancel_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> ApiResult<QueueEntry> {
    let actor = payload.actor.unwrap_or_else(|| "api".to_string());
    let scheduler = &state.scheduler;
    let entry = retry_on_conflict(state.retries, || scheduler.cancel(id, &actor)).await?;
    Ok(Json(entry))
}

async fn move_up_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.move_up(id)).await?,
    ))
}

async fn move_down_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.move_down(id)).await?,
    ))
}

async fn set_position_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PositionRequest>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    let entry = retry_on_conflict(state.retries, || {
        scheduler.set_position(id, payload.position)
    })
    .await?;
    Ok(Json(entry))
}

async fn reassign_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReassignRequest>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    let entry = retry_on_conflict(state.retries, || {
        scheduler.reassign(id, payload.machine_id)
    })
    .await?;
    Ok(Json(entry))
}

async fn check_in_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.check_in(id)).await?,
    ))
}

async fn check_out_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.check_out(id)).await?,
    ))
}

async fn undo_check_in_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.undo_check_in(id)).await?,
    ))
}

async fn request_rush_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RushRequest>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    let entry = retry_on_conflict(state.retries, || {
        scheduler.request_rush(id, &payload.justification)
    })
    .await?;
    Ok(Json(entry))
}

async fn approve_rush_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.approve_rush(id)).await?,
    ))
}

async fn reject_rush_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<QueueEntry> {
    let scheduler = &state.scheduler;
    Ok(Json(
        retry_on_conflict(state.retries, || scheduler.reject_rush(id)).await?,
    ))
}

async fn preview_handler(
    State(state): State<ApiState>,
    Json(payload): Json<RequirementSpec>,
) -> ApiResult<Selection> {
    Ok(Json(state.scheduler.preview(&payload)?))
}

async fn compatible_handler(
    State(state): State<ApiState>,
    Json(payload): Json<RequirementSpec>,
) -> ApiResult<CompatibleResponse> {
    let machine_ids = state.scheduler.compatible_machines(&payload)?;
    Ok(Json(CompatibleResponse { machine_ids }))
}
