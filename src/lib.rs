//! A local-first transcription pipeline orchestrator: given a heterogeneous
//! input (local file, directory, URL, playlist, or channel), produces a
//! searchable, timestamped transcript in a single embedded database, with
//! per-video audio artifacts and telemetry. A small HTTP API exposes job
//! submission, retry, deletion, analytics, and audio streaming.

pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod downloader;
pub mod enhance;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod subprocess;
pub mod transcode;
pub mod transcribe;

use std::sync::Arc;

use crate::config::RunConfig;
use crate::db::Store;
use crate::jobs::JobManager;

/// Shared state for every HTTP handler: the run configuration, the
/// persistence handle, and the job manager. Cheaply `Clone`-able — each
/// field is itself a cheap handle (`Arc`, or a struct wrapping a connection
/// pool), matching the lineage's `AppState` shape.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RunConfig>,
    pub store: Store,
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(config: RunConfig, store: Store) -> Self {
        let jobs = JobManager::new(store.clone(), config.clone());
        Self {
            config: Arc::new(config),
            store,
            jobs,
        }
    }
}
