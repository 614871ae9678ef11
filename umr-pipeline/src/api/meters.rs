//! Meter administration API
//!
//! - POST   /meters/:name/run
//! - GET    /meters/:name/archive?limit=N
//! - POST   /meters/:name/archive/:id/reanalyze
//! - DELETE /meters/:name/archive/:id
//! - GET    /meters/:name/rotation
//! - PUT    /meters/:name/rotation
//! - GET    /stats
//!
//! Every mutating route goes through the orchestrator, which serializes it
//! with scheduled runs of the same meter.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::types::ArchivedSnapshot;
use crate::workflow::{MeterStats, RunReport};
use crate::AppState;

/// Default number of archive entries returned by the listing
const DEFAULT_ARCHIVE_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ArchiveListResponse {
    pub meter: String,
    pub entries: Vec<ArchivedSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RotationBody {
    pub rotation: u16,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub meter: String,
    pub archive_id: String,
    pub deleted: bool,
}

/// POST /meters/:name/run
///
/// On-demand pipeline run. Returns the run report, or the failure reason
/// with a non-2xx status.
pub async fn run_meter(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<RunReport>> {
    info!(meter = %name, "On-demand run requested");
    match state.orchestrator.run(&name).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            *state.last_error.write().await = Some(format!("{}: {}", name, e));
            Err(ApiError::from(e))
        }
    }
}

/// GET /meters/:name/archive
pub async fn list_archive(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> ApiResult<Json<ArchiveListResponse>> {
    state.orchestrator.meter(&name)?;
    let limit = query.limit.unwrap_or(DEFAULT_ARCHIVE_LIMIT);
    let entries = state.orchestrator.archive().list(&name, Some(limit)).await?;
    Ok(Json(ArchiveListResponse {
        meter: name,
        entries,
    }))
}

/// POST /meters/:name/archive/:id/reanalyze
pub async fn reanalyze(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<ArchivedSnapshot>> {
    info!(meter = %name, archive_id = %id, "Re-analysis requested");
    Ok(Json(state.orchestrator.reanalyze(&name, &id).await?))
}

/// DELETE /meters/:name/archive/:id
pub async fn delete_entry(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    state.orchestrator.delete(&name, &id).await?;
    Ok(Json(DeleteResponse {
        meter: name,
        archive_id: id,
        deleted: true,
    }))
}

/// GET /meters/:name/rotation
pub async fn get_rotation(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<RotationBody>> {
    let rotation = state.orchestrator.get_rotation(&name).await?;
    Ok(Json(RotationBody {
        rotation: rotation.degrees(),
    }))
}

/// PUT /meters/:name/rotation
pub async fn set_rotation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RotationBody>,
) -> ApiResult<(StatusCode, Json<RotationBody>)> {
    let rotation = state.orchestrator.set_rotation(&name, body.rotation).await?;
    Ok((
        StatusCode::OK,
        Json(RotationBody {
            rotation: rotation.degrees(),
        }),
    ))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<HashMap<String, MeterStats>> {
    Json(state.orchestrator.stats().await)
}

/// Build meter administration routes
pub fn meter_routes() -> Router<AppState> {
    Router::new()
        .route("/meters/:name/run", post(run_meter))
        .route("/meters/:name/archive", get(list_archive))
        .route("/meters/:name/archive/:id", axum::routing::delete(delete_entry))
        .route("/meters/:name/archive/:id/reanalyze", post(reanalyze))
        .route("/meters/:name/rotation", get(get_rotation).put(set_rotation))
        .route("/stats", get(stats))
}
