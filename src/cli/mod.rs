//! Command-line entry points: `run` (batch transcription over paths/URLs) and
//! `search` (full-text query against persisted segments), plus the default
//! HTTP-serve mode when no subcommand is given (§6.2).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crate::config::{
    ComputeType, DereverbMode, EnhancementMode, Engine, FailPolicy, JobOverrides, RunConfig,
    SourceClass,
};
use crate::db::Store;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::pipeline::{AbortSignal, InputExpander, Pipeline};

#[derive(Debug, Parser)]
#[command(name = "transcriptor", version, about = "Local-first transcription pipeline orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Transcribe one or more local paths/URLs (§6.2).
    Run(RunArgs),
    /// Full-text search over persisted transcript segments (§6.2).
    Search(SearchArgs),
    /// Start the HTTP API server (the default when no subcommand is given).
    Serve,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Local file or directory path to transcribe (repeatable).
    #[arg(long = "paths")]
    pub paths: Vec<PathBuf>,

    /// A file containing one URL per line (blank/`#`-prefixed lines skipped).
    #[arg(long = "urls")]
    pub urls_file: Option<PathBuf>,

    /// A remote URL to transcribe (repeatable).
    #[arg(long = "url")]
    pub url: Vec<String>,

    #[arg(long, value_enum)]
    pub engine: Option<CliEngine>,

    #[arg(long)]
    pub language: Option<String>,

    #[arg(long = "model")]
    pub model_path: Option<String>,

    #[arg(long = "whisperx-compute-type", value_enum)]
    pub whisperx_compute_type: Option<CliComputeType>,

    #[arg(long = "whisperx-batch-size")]
    pub whisperx_batch_size: Option<u32>,

    #[arg(long = "auto-download-model")]
    pub auto_download_model: Option<bool>,

    #[arg(long = "model-download-url")]
    pub model_download_url: Option<String>,

    /// Comma-separated `{json,txt,srt,vtt,tsv}`.
    #[arg(long = "output-formats", value_delimiter = ',')]
    pub output_formats: Vec<String>,

    #[arg(long = "jobs")]
    pub jobs: Option<usize>,

    #[arg(long = "keep-wav")]
    pub keep_wav: bool,

    #[arg(long = "keep-source-audio")]
    pub keep_source_audio: Option<bool>,

    /// Download the original video container instead of audio-only.
    #[arg(long = "download-video")]
    pub download_video: bool,

    /// Reprocess videos even if a transcript already exists.
    #[arg(long)]
    pub force: bool,

    /// Expand and print the resolved input list, then exit without running the pipeline.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Comma-separated WIT.ai API keys.
    #[arg(long = "wit-ai-api-keys", value_delimiter = ',')]
    pub wit_ai_api_keys: Vec<String>,

    #[arg(long = "enhance-mode", value_enum)]
    pub enhance_mode: Option<CliEnhancementMode>,

    #[arg(long = "enhance-source-class", value_enum)]
    pub enhance_source_class: Option<CliSourceClass>,

    #[arg(long = "enhance-dereverb-mode", value_enum)]
    pub enhance_dereverb_mode: Option<CliDereverbMode>,

    #[arg(long = "enhance-atten-lim-db")]
    pub enhance_atten_lim_db: Option<f64>,

    #[arg(long = "enhance-snr-skip-threshold-db")]
    pub enhance_snr_skip_threshold_db: Option<f64>,

    #[arg(long = "enhance-fail-policy", value_enum)]
    pub enhance_fail_policy: Option<CliFailPolicy>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliEngine {
    Whisperx,
    Tafrigh,
}

impl From<CliEngine> for Engine {
    fn from(e: CliEngine) -> Self {
        match e {
            CliEngine::Whisperx => Engine::Whisperx,
            CliEngine::Tafrigh => Engine::Tafrigh,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliEnhancementMode {
    Off,
    Auto,
    On,
    AnalyzeOnly,
}

impl From<CliEnhancementMode> for EnhancementMode {
    fn from(m: CliEnhancementMode) -> Self {
        match m {
            CliEnhancementMode::Off => EnhancementMode::Off,
            CliEnhancementMode::Auto => EnhancementMode::Auto,
            CliEnhancementMode::On => EnhancementMode::On,
            CliEnhancementMode::AnalyzeOnly => EnhancementMode::AnalyzeOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliComputeType {
    Int8,
    Float16,
    Float32,
}

impl From<CliComputeType> for ComputeType {
    fn from(c: CliComputeType) -> Self {
        match c {
            CliComputeType::Int8 => ComputeType::Int8,
            CliComputeType::Float16 => ComputeType::Float16,
            CliComputeType::Float32 => ComputeType::Float32,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliSourceClass {
    Auto,
    Studio,
    Podium,
    FarField,
    Cassette,
}

impl From<CliSourceClass> for SourceClass {
    fn from(c: CliSourceClass) -> Self {
        match c {
            CliSourceClass::Auto => SourceClass::Auto,
            CliSourceClass::Studio => SourceClass::Studio,
            CliSourceClass::Podium => SourceClass::Podium,
            CliSourceClass::FarField => SourceClass::FarField,
            CliSourceClass::Cassette => SourceClass::Cassette,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliDereverbMode {
    Off,
    Auto,
    On,
}

impl From<CliDereverbMode> for DereverbMode {
    fn from(m: CliDereverbMode) -> Self {
        match m {
            CliDereverbMode::Off => DereverbMode::Off,
            CliDereverbMode::Auto => DereverbMode::Auto,
            CliDereverbMode::On => DereverbMode::On,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliFailPolicy {
    FallbackRaw,
    Fail,
}

impl From<CliFailPolicy> for FailPolicy {
    fn from(p: CliFailPolicy) -> Self {
        match p {
            CliFailPolicy::FallbackRaw => FailPolicy::FallbackRaw,
            CliFailPolicy::Fail => FailPolicy::Fail,
        }
    }
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// FTS5 query string.
    pub query: String,

    #[arg(long, default_value_t = 20)]
    pub limit: i64,
}

impl RunArgs {
    /// `JobOverrides` covers every per-run field it has a slot for; the
    /// remaining flags (`jobs`, `keepWav`, `keepSourceAudio`,
    /// `whisperxComputeType`/`whisperxBatchSize`, `autoDownloadModel`,
    /// `modelDownloadUrl`) are applied directly to the base config in
    /// [RunArgs::apply], since [JobOverrides] is scoped to what `POST
    /// /api/jobs` accepts (§6.1) and those fields aren't part of that surface.
    fn overrides(&self) -> JobOverrides {
        JobOverrides {
            engine: self.engine.map(Into::into),
            wit_ai_api_keys: if self.wit_ai_api_keys.is_empty() {
                None
            } else {
                Some(self.wit_ai_api_keys.clone())
            },
            language: self.language.clone(),
            model_path: self.model_path.clone(),
            output_formats: if self.output_formats.is_empty() {
                None
            } else {
                Some(self.output_formats.clone())
            },
            enhancement_mode: self.enhance_mode.map(Into::into),
            source_class: self.enhance_source_class.map(Into::into),
            dereverb_mode: self.enhance_dereverb_mode.map(Into::into),
            atten_lim_db: self.enhance_atten_lim_db,
            snr_skip_threshold_db: self.enhance_snr_skip_threshold_db,
            fail_policy: self.enhance_fail_policy.map(Into::into),
        }
    }

    fn apply(&self, base_config: &RunConfig) -> RunConfig {
        let mut config = base_config.with_overrides(&self.overrides());
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if self.keep_wav {
            config.keep_wav = true;
        }
        if let Some(keep) = self.keep_source_audio {
            config.keep_source_audio = keep;
        }
        if let Some(compute_type) = self.whisperx_compute_type {
            config.whisperx_compute_type = compute_type.into();
        }
        if let Some(batch_size) = self.whisperx_batch_size {
            config.whisperx_batch_size = batch_size;
        }
        if let Some(auto_download) = self.auto_download_model {
            config.auto_download_model = auto_download;
        }
        if let Some(url) = &self.model_download_url {
            config.model_download_url = Some(url.clone());
        }
        config
    }
}

/// Runs `run`, waiting for completion and returning the process exit code
/// (§6.2: 0 all succeeded, 1 at least one item failed, 130 interrupted).
/// `--dry-run` stops after input expansion and prints the resolved list.
/// `--download-video` is accepted for flag-surface parity but the pipeline's
/// per-item download options aren't parameterized by it yet (see DESIGN.md).
async fn run_command(args: RunArgs, base_config: &RunConfig, store: Store) -> i32 {
    let config = args.apply(base_config);
    let downloader = Downloader::new();
    let expander = InputExpander::new(&downloader);

    let mut inputs = expander.expand_paths(&args.paths);
    if !args.url.is_empty() || args.urls_file.is_some() {
        match expander
            .expand_urls(args.urls_file.as_deref(), &args.url)
            .await
        {
            Ok(expanded) => inputs.extend(expanded),
            Err(e) => {
                error!(error = %e, "failed to expand url inputs");
                return 1;
            }
        }
    }

    if inputs.is_empty() {
        error!("no inputs resolved from the given paths/urls");
        return 1;
    }

    if args.download_video {
        warn!("--download-video has no effect yet: downloads always use the default audio-first format ladder");
    }

    if args.dry_run {
        for input in &inputs {
            match input {
                crate::pipeline::Input::Path(p) => println!("path\t{}", p.display()),
                crate::pipeline::Input::Url(u) => println!("url\t{u}"),
            }
        }
        return 0;
    }

    let abort = AbortSignal::new();
    let interrupt_abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current item before stopping");
            interrupt_abort.trigger();
        }
    });

    let pipeline = Pipeline::new(store);
    match pipeline.run_batch(inputs, &config, args.force, abort.clone()).await {
        Ok(report) => {
            for result in &report.results {
                if let Some(error) = &result.error {
                    error!(input = %result.input_label, error = %error, "item failed");
                } else if result.skipped {
                    info!(input = %result.input_label, "item skipped (already transcribed)");
                } else {
                    info!(input = %result.input_label, video_id = ?result.video_id, "item done");
                }
            }
            if abort.is_triggered() {
                130
            } else if report.any_failed() {
                1
            } else {
                0
            }
        }
        Err(e) => {
            error!(error = %e, "batch run failed");
            1
        }
    }
}

/// Renders a millisecond offset as `HH:MM:SS`, matching §6.2's search output.
fn format_timecode(ms: i64) -> String {
    let total_seconds = ms.max(0) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

async fn search_command(args: SearchArgs, store: Store) -> Result<i32> {
    let hits = store.search_segments(&args.query, args.limit).await?;
    if hits.is_empty() {
        println!("no matches");
        return Ok(0);
    }
    for hit in hits {
        println!(
            "{} [{} - {}] {}",
            hit.video_id,
            format_timecode(hit.start_ms),
            format_timecode(hit.end_ms),
            hit.text
        );
    }
    Ok(0)
}

/// Dispatches a parsed [Cli]; returns the process exit code. `Serve`/`None`
/// is handled by `main.rs` itself since it owns the axum server lifecycle.
pub async fn dispatch(command: Command, config: &RunConfig, store: Store) -> i32 {
    match command {
        Command::Run(args) => run_command(args, config, store).await,
        Command::Search(args) => match search_command(args, store).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "search failed");
                1
            }
        },
        Command::Serve => unreachable!("Serve is handled by main.rs"),
    }
}
