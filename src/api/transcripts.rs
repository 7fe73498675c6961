//! `GET /api/transcripts`, `GET /api/transcripts/{id}` (§6.1).

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::media::resolve_audio;
use crate::api::{clamp_limit, validate_video_id, HandlerResult};
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct ListTranscriptsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    q: Option<String>,
    channel_id: Option<String>,
}

async fn list_transcripts(
    State(state): State<AppState>,
    Query(query): Query<ListTranscriptsQuery>,
) -> HandlerResult<Json<Value>> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let offset = clamp_limit(query.offset, 0, 0, i64::MAX);
    let q = query.q.as_deref().filter(|s| !s.trim().is_empty());
    let channel_id = query.channel_id.as_deref().filter(|s| !s.is_empty());

    let transcripts = state.store.list_transcripts(limit, offset, q, channel_id).await?;
    Ok(Json(json!({ "transcripts": transcripts })))
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    validate_video_id(&id)?;
    let video = state
        .store
        .get_video(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no such video '{id}'")))?;
    let transcript = state
        .store
        .get_transcript(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no transcript for video '{id}'")))?;

    let resolved = resolve_audio(&state.store, &id).await?;
    let (audio_url, audio_kind, has_audio) = match resolved {
        Some(r) => (Some(format!("/api/media/audio/{id}")), Some(r.kind), true),
        None => (None, None, false),
    };

    Ok(Json(json!({
        "transcript": {
            "videoId": video.video_id,
            "title": video.title,
            "uploader": video.uploader,
            "channelId": video.channel_id,
            "language": transcript.language,
            "durationMs": video.duration_ms,
            "status": video.status,
            "model": transcript.model,
            "text": transcript.text,
            "compactJson": transcript.compact_json,
            "createdAt": transcript.created_at,
            "audioUrl": audio_url,
            "audioKind": audio_kind,
            "hasAudio": has_audio,
        }
    })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/transcripts", get(list_transcripts))
        .route("/api/transcripts/{id}", get(get_transcript))
}
