//! `GET /api/stats` — headline counters for the dashboard's top bar.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::HandlerResult;
use crate::AppState;

async fn stats(State(state): State<AppState>) -> HandlerResult<Json<Value>> {
    let transcripts_total = state.store.count_transcripts().await?;
    let videos_total = state.store.count_videos().await?;
    let audio_backed_transcripts = state.store.count_audio_backed_transcripts().await?;
    let active_jobs = state.jobs.count_active_jobs().await;

    Ok(Json(json!({
        "stats": {
            "transcriptsTotal": transcripts_total,
            "videosTotal": videos_total,
            "audioBackedTranscripts": audio_backed_transcripts,
            "activeJobs": active_jobs,
        }
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/stats", get(stats))
}
