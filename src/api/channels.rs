//! `GET /api/channels` (§6.1).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::HandlerResult;
use crate::AppState;

async fn channels(State(state): State<AppState>) -> HandlerResult<Json<Value>> {
    let channels = state.store.list_channels().await?;
    Ok(Json(json!({ "channels": channels })))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/channels", get(channels))
}
