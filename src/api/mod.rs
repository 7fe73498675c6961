//! The HTTP surface (§4.9/§6.1): one module per route group, assembled here
//! into a single `Router<AppState>` for `main.rs` to mount and layer.

pub mod analytics;
pub mod channels;
pub mod health;
pub mod jobs;
pub mod media;
pub mod options;
pub mod stats;
pub mod transcripts;
pub mod videos;

use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use axum::Router;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::error::{AppError, Result};
use crate::AppState;

static VIDEO_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// A `Json<T>` extractor whose rejection is an [AppError::BadInput] carrying
/// `{error}` JSON instead of axum's default plain-text body (§6.1 `POST
/// /api/jobs`: "Invalid body → 400 with `{error}`").
pub(crate) struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::BadInput(rejection.body_text()))?;
        Ok(ValidJson(value))
    }
}

/// `video_id` path segments must match `^[A-Za-z0-9_-]+$` (§4.9 "Parameter parsing").
pub(crate) fn validate_video_id(id: &str) -> Result<()> {
    if VIDEO_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(AppError::BadInput(format!("invalid video id '{id}'")))
    }
}

/// Clamp a user-supplied `limit` query param into `[min, max]`, defaulting to
/// `default` when absent or unparsable (§4.9 "limit parsers accept positive
/// or non-negative integers depending on the endpoint").
pub(crate) fn clamp_limit(raw: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    raw.unwrap_or(default).clamp(min, max)
}

/// Every route here returns JSON, so the whole group gets
/// `Cache-Control: no-store` (§4.9); the media routes are mounted separately
/// since they serve audio bytes, not JSON.
pub fn router() -> Router<AppState> {
    let json_routes = Router::new()
        .merge(health::router())
        .merge(options::router())
        .merge(stats::router())
        .merge(analytics::router())
        .merge(jobs::router())
        .merge(videos::router())
        .merge(transcripts::router())
        .merge(channels::router())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    Router::new().merge(json_routes).merge(media::router())
}

pub(crate) type HandlerResult<T = Response> = Result<T>;
