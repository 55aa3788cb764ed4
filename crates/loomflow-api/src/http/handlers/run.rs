//! Run lifecycle handlers for the REST API.
//!
//! Starting a run and every decision that lets a run move on hand the drive
//! off to a background task; the response carries the run as persisted when
//! the decision was recorded.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use loomflow_types::approval::ReviewVerdict;
use loomflow_types::phase::{PhaseEvent, PhaseRecord};
use loomflow_types::run::{Run, RunSnapshot};

use crate::http::error::AppError;
use crate::http::extractors::query::RunListQuery;
use crate::http::extractors::tenant::Tenant;
use crate::http::response::ApiResponse;
use crate::state::AppState;

const DEFAULT_ACTOR: &str = "api";

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub pipeline: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decisions: BTreeMap<String, ReviewVerdict>,
    pub actor: Option<String>,
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

fn run_href(run_id: Uuid) -> String {
    format!("/api/v1/runs/{run_id}")
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the run sub-router, mounted at `/api/v1` by the main router.
pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run).delete(cancel_run))
        .route("/runs/{id}/approve", post(approve_run))
        .route("/runs/{id}/reject", post(reject_run))
        .route("/runs/{id}/review", post(review_run))
        .route("/runs/{id}/retry/{step}", post(retry_step))
        .route("/runs/{id}/resume/{step}", post(resume_run))
        .route("/runs/{id}/steps/{step}/phase", post(submit_phase_event))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// POST /api/v1/runs - Create a run and drive it in the background.
pub async fn create_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(body): Json<CreateRunRequest>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let pipeline = state.catalog.get(&body.pipeline)?;
    let run = state
        .coordinator
        .create_run(&tenant, pipeline, body.input)
        .await?;
    state.coordinator.spawn_drive(run.id);

    let elapsed = start.elapsed().as_millis() as u64;
    let href = run_href(run.id);
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &href),
    ))
}

/// GET /api/v1/runs - List the tenant's runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Query(query): Query<RunListQuery>,
) -> Result<Json<ApiResponse<Vec<Run>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let runs = state
        .coordinator
        .list_runs(&tenant, query.effective_limit())
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(runs, request_id, elapsed).with_link("self", "/api/v1/runs"),
    ))
}

/// GET /api/v1/runs/{id} - Full run snapshot.
pub async fn get_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<RunSnapshot>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let snapshot = state.coordinator.snapshot(id, &tenant).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let mut resp = ApiResponse::success(snapshot, request_id, elapsed).with_link("self", &run_href(id));
    if let Some(source) = resp.data.as_ref().and_then(|s| s.run.forked_from) {
        resp = resp.with_link("forked_from", &run_href(source));
    }
    Ok(Json(resp))
}

/// DELETE /api/v1/runs/{id} - Cancel a run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state.coordinator.cancel(id, &tenant).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &run_href(id)),
    ))
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// POST /api/v1/runs/{id}/approve - Approve the gate the run waits on.
pub async fn approve_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let actor = actor_or_default(body.and_then(|Json(b)| b.actor));
    let run = state.coordinator.approve(id, &tenant, &actor).await?;
    state.coordinator.spawn_drive(run.id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &run_href(id)),
    ))
}

/// POST /api/v1/runs/{id}/reject - Reject the gate and re-run its targets.
pub async fn reject_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectRequest>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let actor = actor_or_default(body.actor);
    let run = state
        .coordinator
        .reject(id, &tenant, &body.reason, &actor)
        .await?;
    state.coordinator.spawn_drive(run.id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &run_href(id)),
    ))
}

/// POST /api/v1/runs/{id}/review - Per-step decisions for a reviewed group.
pub async fn review_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<Uuid>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    if body.decisions.is_empty() {
        return Err(AppError::Validation(
            "review needs at least one decision".to_string(),
        ));
    }
    let actor = actor_or_default(body.actor);
    let run = state
        .coordinator
        .review_group(id, &tenant, body.decisions, &actor)
        .await?;
    state.coordinator.spawn_drive(run.id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &run_href(id)),
    ))
}

/// POST /api/v1/runs/{id}/steps/{step}/phase - Apply a sub-workflow event.
pub async fn submit_phase_event(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((id, step)): Path<(Uuid, String)>,
    Json(event): Json<PhaseEvent>,
) -> Result<Json<ApiResponse<PhaseRecord>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let record = state
        .coordinator
        .submit_phase_event(id, &tenant, &step, event)
        .await?;
    state.coordinator.spawn_drive(id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(record, request_id, elapsed).with_link("run", &run_href(id)),
    ))
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// POST /api/v1/runs/{id}/retry/{step} - Re-run a step under a new revision.
pub async fn retry_step(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((id, step)): Path<(Uuid, String)>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let run = state.coordinator.retry_step(id, &tenant, &step).await?;
    state.coordinator.spawn_drive(run.id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(run, request_id, elapsed).with_link("self", &run_href(id)),
    ))
}

/// POST /api/v1/runs/{id}/resume/{step} - Fork a new run starting at `step`.
pub async fn resume_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((id, step)): Path<(Uuid, String)>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let forked = state.coordinator.resume(id, &tenant, &step).await?;
    state.coordinator.spawn_drive(forked.id);

    let elapsed = start.elapsed().as_millis() as u64;
    let href = run_href(forked.id);
    Ok(Json(
        ApiResponse::success(forked, request_id, elapsed)
            .with_link("self", &href)
            .with_link("forked_from", &run_href(id)),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
