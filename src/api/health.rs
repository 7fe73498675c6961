//! `GET /api/health` — liveness probe.

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "time": Utc::now().to_rfc3339() }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
