//! `GET /api/analytics` — read-only aggregates for the dashboard's charts
//! (§6.5). Every series is computed fresh per request; nothing here is
//! cached, since the underlying counts change with every pipeline run.

use std::collections::HashMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::api::HandlerResult;
use crate::AppState;

const DAILY_WINDOW_DAYS: i64 = 30;
const SERIES_LIMIT: i64 = 200;

fn duration_bucket_labels() -> [&'static str; 5] {
    ["<5m", "5-15m", "15-30m", "30-60m", "60m+"]
}

async fn analytics(State(state): State<AppState>) -> HandlerResult<Json<Value>> {
    let store = &state.store;

    let transcripts_total = store.count_transcripts().await?;
    let videos_total = store.count_videos().await?;
    let transcribed_hours = store.total_duration_ms().await? as f64 / 3_600_000.0;

    let last_7 = store.daily_video_counts(Utc::now() - Duration::days(7)).await?;
    let average_per_day_last_7 =
        last_7.iter().map(|(_, c)| *c).sum::<i64>() as f64 / 7.0;

    let since = Utc::now() - Duration::days(DAILY_WINDOW_DAYS);
    let mut by_day: HashMap<String, i64> = store.daily_video_counts(since).await?.into_iter().collect();
    let mut daily = Vec::with_capacity(DAILY_WINDOW_DAYS as usize);
    for offset in (0..DAILY_WINDOW_DAYS).rev() {
        let day = (Utc::now() - Duration::days(offset)).format("%Y-%m-%d").to_string();
        let count = by_day.remove(&day).unwrap_or(0);
        daily.push(json!({ "date": day, "count": count }));
    }

    let languages = store.language_distribution().await?;
    let source_kinds = store.source_kind_distribution().await?;
    let statuses = store.count_videos_by_status().await?;
    let enhancement_outcomes = store.enhancement_outcome_distribution().await?;

    let buckets = store.duration_buckets().await?;
    let duration_buckets: Vec<Value> = duration_bucket_labels()
        .iter()
        .zip(buckets.iter())
        .map(|(label, count)| json!({ "bucket": label, "count": count }))
        .collect();

    let wallclock = store.job_wallclock_series(SERIES_LIMIT).await?;
    let job_wallclock_series: Vec<Value> = wallclock
        .into_iter()
        .map(|(video_id, ms)| json!({ "videoId": video_id, "ms": ms }))
        .collect();

    let runs = store.list_enhancement_runs(SERIES_LIMIT).await?;
    let mut speech_ratio_sum = 0.0;
    let mut speech_ratio_count = 0u32;
    let enhancement_series: Vec<Value> = runs
        .iter()
        .map(|run| {
            let speech_ratio = run
                .metrics
                .as_ref()
                .and_then(|m| m.get("speechRatio"))
                .and_then(Value::as_f64);
            if let Some(r) = speech_ratio {
                speech_ratio_sum += r;
                speech_ratio_count += 1;
            }
            json!({
                "videoId": run.video_id,
                "startedAt": run.started_at.to_rfc3339(),
                "processingMs": run.processing_ms,
                "snrDb": run.snr_db,
                "speechRatio": speech_ratio,
            })
        })
        .collect();

    let average_speech_ratio = if speech_ratio_count > 0 {
        speech_ratio_sum / speech_ratio_count as f64
    } else {
        0.0
    };
    let signal_noise_pie = json!([
        { "label": "speech", "value": average_speech_ratio },
        { "label": "noise", "value": (1.0 - average_speech_ratio).max(0.0) },
    ]);

    Ok(Json(json!({
        "analytics": {
            "summary": {
                "transcriptsTotal": transcripts_total,
                "videosTotal": videos_total,
                "transcribedHours": transcribed_hours,
                "averagePerDayLast7": average_per_day_last_7,
            },
            "daily": daily,
            "distributions": {
                "language": languages.into_iter().map(|(k, v)| json!({"key": k, "count": v})).collect::<Vec<_>>(),
                "sourceKind": source_kinds.into_iter().map(|(k, v)| json!({"key": k, "count": v})).collect::<Vec<_>>(),
                "status": statuses,
                "enhancementOutcome": enhancement_outcomes.into_iter().map(|(k, v)| json!({"key": k, "count": v})).collect::<Vec<_>>(),
            },
            "durationBuckets": duration_buckets,
            "jobWallclockSeries": job_wallclock_series,
            "enhancementSeries": enhancement_series,
            "signalNoisePie": signal_noise_pie,
        }
    })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/analytics", get(analytics))
}
