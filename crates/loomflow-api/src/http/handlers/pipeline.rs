//! Pipeline catalog handlers.

use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use loomflow_types::pipeline::{PipelineDefinition, SegmentDefinition};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// List entry for a loaded pipeline.
#[derive(Debug, Serialize)]
pub struct PipelineSummary {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub segments: usize,
    pub steps: usize,
}

impl From<&PipelineDefinition> for PipelineSummary {
    fn from(def: &PipelineDefinition) -> Self {
        let steps = def
            .segments
            .iter()
            .map(|segment| match segment {
                SegmentDefinition::Step(_) | SegmentDefinition::Phased(_) => 1,
                SegmentDefinition::Parallel { steps, .. } => steps.len(),
                SegmentDefinition::Approval(_) => 0,
            })
            .sum();
        Self {
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            segments: def.segments.len(),
            steps,
        }
    }
}

/// Build the pipeline sub-router, mounted at `/api/v1`.
pub fn pipeline_routes() -> Router<AppState> {
    Router::new()
        .route("/pipelines", get(list_pipelines))
        .route("/pipelines/{name}", get(get_pipeline))
}

/// GET /api/v1/pipelines - List loaded pipelines.
pub async fn list_pipelines(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<PipelineSummary>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let pipelines: Vec<PipelineSummary> = state.catalog.list().map(PipelineSummary::from).collect();

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(pipelines, request_id, elapsed).with_link("self", "/api/v1/pipelines"),
    ))
}

/// GET /api/v1/pipelines/{name} - Full pipeline definition.
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<PipelineDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state.catalog.get(&name)?.clone();

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(
        ApiResponse::success(def, request_id, elapsed)
            .with_link("self", &format!("/api/v1/pipelines/{name}")),
    ))
}
