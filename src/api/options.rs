//! `GET /api/options` — UI-facing descriptive metadata: the current
//! effective defaults plus the closed enum sets job overrides draw from.
//!
//! `models`/`languages` aren't closed sets anywhere else in the system
//! (WhisperX accepts any model name or BCP-47 code); this endpoint's lists
//! are a curated convenience for a picker, not validated against elsewhere.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::config::VALID_OUTPUT_FORMATS;
use crate::AppState;

const MODELS: &[&str] = &["tiny", "base", "small", "medium", "large-v2", "large-v3", "turbo"];
const LANGUAGES: &[&str] = &[
    "auto", "en", "es", "fr", "de", "it", "pt", "nl", "ru", "zh", "ja", "ko", "ar", "hi", "tr",
];

async fn options(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "defaults": &*state.config,
        "enhancementModes": ["off", "auto", "on", "analyze-only"],
        "dereverbModes": ["off", "auto", "on"],
        "sourceClasses": ["auto", "studio", "podium", "far-field", "cassette"],
        "models": MODELS,
        "languages": LANGUAGES,
        "outputFormats": VALID_OUTPUT_FORMATS,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/options", get(options))
}
