//! Domain error taxonomy shared by the pipeline, the store, and the HTTP API.
//!
//! Every kind here maps to exactly one HTTP status code (see [AppError::status_code])
//! and is constructed with a human-readable message; callers attach context with
//! `anyhow::Context` further down the stack and convert to the nearest kind at the
//! boundary where the distinction actually matters (store, subprocess, HTTP).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidRange(String),

    #[error("{0}")]
    InvalidQuery(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("incomplete download: {0}")]
    IncompleteDownload(String),

    #[error("interrupted")]
    Interrupted,

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("enhancement failed: {0}")]
    EnhancementFailed(String),

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AppError::DownloadFailed(_)
            | AppError::IncompleteDownload(_)
            | AppError::Interrupted
            | AppError::TranscodeFailed(_)
            | AppError::EnhancementFailed(_)
            | AppError::TranscriptionFailed(_)
            | AppError::StoreError(_)
            | AppError::ConfigError(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::StoreError(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::BadInput(e.to_string())
    }
}

/// Handlers that hit an unexpected error path return `anyhow::Error`; the HTTP
/// boundary logs the original message and responds with a generic 500, per
/// the catch-all propagation rule.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "unhandled error");
        AppError::Internal("Internal server error".to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            return (status, Json(json!({ "error": "Internal server error" }))).into_response();
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
