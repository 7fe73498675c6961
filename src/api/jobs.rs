//! `GET,POST /api/jobs`, `GET /api/jobs/{id}` (§6.1).

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::{clamp_limit, HandlerResult};
use crate::config::JobOverrides;
use crate::error::AppError;
use crate::jobs::CreateJobPayload;
use crate::AppState;

/// Maximum accepted `POST /api/jobs` body size (§4.9).
const MAX_JOB_BODY_BYTES: usize = 1_048_576;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    input: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    overrides: JobOverrides,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    limit: Option<i64>,
}

async fn create_job(
    State(state): State<AppState>,
    crate::api::ValidJson(payload): crate::api::ValidJson<CreateJobRequest>,
) -> HandlerResult<(StatusCode, Json<Value>)> {
    payload.overrides.validate()?;
    let job = state
        .jobs
        .create_job(CreateJobPayload {
            input: payload.input,
            force: payload.force,
            overrides: payload.overrides,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "job": job }))))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Json<Value> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let jobs = state.jobs.list_jobs(limit as usize).await;
    Json(json!({ "jobs": jobs }))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> HandlerResult<Json<Value>> {
    let job = state
        .jobs
        .get_job(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no such job '{id}'")))?;
    Ok(Json(json!({ "job": job })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .layer(DefaultBodyLimit::max(MAX_JOB_BODY_BYTES))
}
