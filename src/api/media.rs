//! `GET,HEAD /api/media/audio/{id}` — byte-range audio streaming (§4.9).
//!
//! Axum answers `HEAD` requests against a `GET` route automatically by
//! running the handler and discarding the body, so there's no separate HEAD
//! handler here.

use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use axum_extra::headers::{Header, Range};
use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::api::{validate_video_id, HandlerResult};
use crate::db::models::ArtifactKind;
use crate::db::Store;
use crate::error::AppError;
use crate::AppState;

const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: usize = 5_000;

#[derive(Debug, Clone)]
pub struct ResolvedAudio {
    pub path: PathBuf,
    pub kind: &'static str,
}

struct CacheEntry {
    value: Option<ResolvedAudio>,
    cached_at: Instant,
}

struct AudioCache {
    entries: HashMap<String, CacheEntry>,
    order: std::collections::VecDeque<String>,
}

static AUDIO_CACHE: Lazy<Mutex<AudioCache>> = Lazy::new(|| {
    Mutex::new(AudioCache {
        entries: HashMap::new(),
        order: std::collections::VecDeque::new(),
    })
});

fn cache_get(video_id: &str) -> Option<Option<ResolvedAudio>> {
    let cache = AUDIO_CACHE.lock().unwrap();
    cache.entries.get(video_id).and_then(|entry| {
        if entry.cached_at.elapsed() < CACHE_TTL {
            Some(entry.value.clone())
        } else {
            None
        }
    })
}

fn cache_put(video_id: &str, value: Option<ResolvedAudio>) {
    let mut cache = AUDIO_CACHE.lock().unwrap();
    if !cache.entries.contains_key(video_id) {
        cache.order.push_back(video_id.to_string());
        if cache.order.len() > CACHE_CAPACITY {
            if let Some(oldest) = cache.order.pop_front() {
                cache.entries.remove(&oldest);
            }
        }
    }
    cache.entries.insert(video_id.to_string(), CacheEntry { value, cached_at: Instant::now() });
}

#[cfg(test)]
pub(crate) fn reset_audio_cache_for_tests() {
    let mut cache = AUDIO_CACHE.lock().unwrap();
    cache.entries.clear();
    cache.order.clear();
}

async fn resolve_audio_uncached(store: &Store, video_id: &str) -> anyhow::Result<Option<ResolvedAudio>> {
    for (kind, label) in [
        (ArtifactKind::SourceAudio, "source_audio"),
        (ArtifactKind::AudioWavEnhanced, "audio_wav_enhanced"),
        (ArtifactKind::AudioWav, "audio_wav"),
    ] {
        if let Some(artifact) = store.get_artifact_by_kind(video_id, kind).await? {
            return Ok(Some(ResolvedAudio { path: PathBuf::from(artifact.uri), kind: label }));
        }
    }

    if let Some(video) = store.get_video(video_id).await? {
        if let Some(local_path) = video.local_path {
            return Ok(Some(ResolvedAudio { path: PathBuf::from(local_path), kind: "local_path" }));
        }
    }

    Ok(None)
}

/// Resolves the best audio source for `video_id` (§4.9 priority order),
/// memoized for 30s in a 5000-entry bounded cache shared with the HTTP
/// streaming handler.
pub async fn resolve_audio(store: &Store, video_id: &str) -> anyhow::Result<Option<ResolvedAudio>> {
    if let Some(cached) = cache_get(video_id) {
        return Ok(cached);
    }
    let resolved = resolve_audio_uncached(store, video_id).await?;
    cache_put(video_id, resolved.clone());
    Ok(resolved)
}

fn guess_mime(path: &StdPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

fn unsatisfiable_response(total_len: u64) -> Response {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{total_len}"))
        .body(Body::empty())
        .unwrap()
}

async fn get_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult<Response> {
    validate_video_id(&id)?;
    let resolved = resolve_audio(&state.store, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no audio for video '{id}'")))?;

    let metadata = tokio::fs::metadata(&resolved.path)
        .await
        .map_err(|_| AppError::NotFound(format!("audio file missing for video '{id}'")))?;
    let total_len = metadata.len();

    let range_value = headers.get(header::RANGE);
    let range: Option<Range> = match range_value {
        None => None,
        Some(value) => {
            let mut values = std::iter::once(value);
            match Range::decode(&mut values) {
                Ok(r) => Some(r),
                Err(_) => return Ok(unsatisfiable_response(total_len)),
            }
        }
    };

    let (status, start, end) = match &range {
        None => (StatusCode::OK, 0u64, total_len.saturating_sub(1)),
        Some(range) => {
            let satisfiable: Vec<(Bound<u64>, Bound<u64>)> =
                range.satisfiable_ranges(total_len).collect();
            match satisfiable.first() {
                Some((Bound::Included(s), Bound::Included(e))) => {
                    (StatusCode::PARTIAL_CONTENT, *s, (*e).min(total_len.saturating_sub(1)))
                }
                Some((Bound::Included(s), Bound::Unbounded)) => {
                    (StatusCode::PARTIAL_CONTENT, *s, total_len.saturating_sub(1))
                }
                _ => return Ok(unsatisfiable_response(total_len)),
            }
        }
    };

    if start > end || start >= total_len.max(1) {
        return Ok(unsatisfiable_response(total_len));
    }

    let len = end - start + 1;
    let mut file = tokio::fs::File::open(&resolved.path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let stream = ReaderStream::new(file.take(len));
    let body = Body::from_stream(stream);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, guess_mime(&resolved.path))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, len.to_string());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total_len}"));
    }

    Ok(builder.body(body).unwrap())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/media/audio/{id}", get(get_audio))
}
