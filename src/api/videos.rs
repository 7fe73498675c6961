//! `GET /api/videos`, `POST /api/videos/{id}/retry`, `DELETE /api/videos/{id}` (§6.1).

use std::path::{Path as StdPath, PathBuf};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::{clamp_limit, validate_video_id, HandlerResult};
use crate::config::{Engine, EnhancementConfig, JobOverrides};
use crate::db::models::{Video, VideoStatus};
use crate::error::AppError;
use crate::jobs::CreateJobPayload;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct ListVideosQuery {
    limit: Option<i64>,
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListVideosQuery>,
) -> HandlerResult<Response> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let videos = state.store.list_videos(None, limit, 0).await?;
    Ok(Json(json!({ "videos": videos })).into_response())
}

fn parse_engine(raw: &str) -> Option<Engine> {
    match raw {
        "whisperx" => Some(Engine::Whisperx),
        "tafrigh" => Some(Engine::Tafrigh),
        _ => None,
    }
}

/// Carries over language/model/output-format/enhancement settings from the
/// video's last run, so a retry reproduces the prior configuration unless
/// the caller supplies fresh overrides (§4.9 retry contract).
fn overrides_from_video(video: &Video) -> JobOverrides {
    let mut overrides = JobOverrides::default();
    overrides.engine = video.engine.as_deref().and_then(parse_engine);
    overrides.language = video.language.clone().filter(|l| !l.is_empty());
    overrides.model_path = video.model_path.clone();
    if !video.output_formats.is_empty() {
        overrides.output_formats = Some(video.output_formats.clone());
    }
    if let Some(cfg) = video
        .enhancement_config
        .as_ref()
        .and_then(|v| serde_json::from_value::<EnhancementConfig>(v.clone()).ok())
    {
        overrides.enhancement_mode = Some(cfg.mode);
        overrides.source_class = Some(cfg.source_class);
        overrides.dereverb_mode = Some(cfg.dereverb_mode);
        overrides.atten_lim_db = Some(cfg.atten_lim_db);
        overrides.snr_skip_threshold_db = Some(cfg.snr_skip_threshold_db);
    }
    overrides
}

async fn retry_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Response> {
    validate_video_id(&id)?;
    let video = state
        .store
        .get_video(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no such video '{id}'")))?;

    if !matches!(
        video.status,
        VideoStatus::Error | VideoStatus::Failed | VideoStatus::Processing
    ) {
        return Err(AppError::Conflict(format!(
            "video '{id}' is not in a retryable state"
        )));
    }

    if video.status == VideoStatus::Processing
        && state.jobs.find_active_job_by_input(&video.source_uri).await.is_some()
    {
        return Err(AppError::Conflict(format!(
            "video '{id}' already has an active job"
        )));
    }

    if matches!(video.source_kind, crate::db::models::SourceKind::File)
        && !tokio::fs::try_exists(&video.source_uri).await.unwrap_or(false)
    {
        return Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": format!("source file for video '{id}' no longer exists") })),
        )
            .into_response());
    }

    let overrides = overrides_from_video(&video);
    let job = state
        .jobs
        .create_job(CreateJobPayload {
            input: video.source_uri.clone(),
            force: true,
            overrides,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "job": job }))).into_response())
}

fn is_within(data_dir: &StdPath, candidate: &StdPath) -> bool {
    candidate.starts_with(data_dir)
}

/// Paths a delete is allowed to remove: known artifacts, the URL-source local
/// file, the per-video transcripts/enhance working directories, and any
/// `<id>.*` entry under `source_audio/`/`audio/` — all restricted to the
/// configured data directory (§4.9 delete contract).
async fn collect_cleanup_paths(state: &AppState, video: &Video) -> anyhow::Result<Vec<PathBuf>> {
    let data_dir = &state.config.data_dir;
    let mut paths = Vec::new();

    for artifact in state.store.get_artifacts(&video.video_id).await? {
        let p = PathBuf::from(&artifact.uri);
        if is_within(data_dir, &p) {
            paths.push(p);
        }
    }

    if matches!(video.source_kind, crate::db::models::SourceKind::Url) {
        if let Some(local_path) = &video.local_path {
            let p = PathBuf::from(local_path);
            if is_within(data_dir, &p) {
                paths.push(p);
            }
        }
    }

    paths.push(data_dir.join("transcripts").join(&video.video_id));
    paths.push(data_dir.join("enhance").join(&video.video_id));

    for subdir in ["source_audio", "audio"] {
        let dir = data_dir.join(subdir);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let prefix = format!("{}.", video.video_id);
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                paths.push(entry.path());
            }
        }
    }

    Ok(paths)
}

async fn remove_path(path: &StdPath) {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return,
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove cleanup path");
    }
}

async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Response> {
    validate_video_id(&id)?;
    let video = state
        .store
        .get_video(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no such video '{id}'")))?;

    if state.jobs.find_active_job_by_input(&video.source_uri).await.is_some() {
        return Err(AppError::Conflict(format!(
            "video '{id}' has an active job"
        )));
    }

    let cleanup_paths = collect_cleanup_paths(&state, &video).await?;
    for path in &cleanup_paths {
        remove_path(path).await;
    }

    state.store.delete_video_fully(&id).await?;

    Ok(Json(json!({ "deleted": true, "videoId": id })).into_response())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{id}/retry", post(retry_video))
        .route("/api/videos/{id}", axum::routing::delete(delete_video))
}
