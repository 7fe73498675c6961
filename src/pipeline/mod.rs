//! Per-item state machine, input expansion, concurrency fan-out, and
//! transactional persistence (§4.7).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::RunConfig;
use crate::db::models::{
    Artifact, ArtifactKind, Chapter, EnhancementRun, EnhancementSegment, EnhancementStatus,
    Segment, SourceKind, Transcript, Video, VideoStatus,
};
use crate::db::Store;
use crate::downloader::{DownloadOptions, Downloader};
use crate::enhance::EnhancementOrchestrator;
use crate::error::{AppError, Result};
use crate::transcode::Transcoder;
use crate::transcribe::TranscriptionAdapter;

const MAX_WALK_DEPTH: usize = 10;
const MAX_WALK_FILES: usize = 10_000;

/// A fully-resolved work item for the pipeline's per-item algorithm.
#[derive(Debug, Clone)]
pub enum Input {
    Path(PathBuf),
    Url(String),
}

/// Expands `paths`/`urls` seeds into a flat, deduplicated list of [Input]
/// (§4.7 "Input expansion").
pub struct InputExpander<'a> {
    downloader: &'a Downloader,
}

impl<'a> InputExpander<'a> {
    pub fn new(downloader: &'a Downloader) -> Self {
        Self { downloader }
    }

    /// `paths`: resolved to absolute, directories walked to depth 10 / 10 000
    /// files, symlinks skipped, non-existent paths warned-and-skipped.
    pub fn expand_paths(&self, paths: &[PathBuf]) -> Vec<Input> {
        let mut out = Vec::new();
        let mut count = 0usize;

        for p in paths {
            let abs = if p.is_absolute() {
                p.clone()
            } else {
                std::env::current_dir().unwrap_or_default().join(p)
            };

            if !abs.exists() {
                warn!(path = %abs.display(), "input path does not exist, skipping");
                continue;
            }

            if abs.is_file() {
                out.push(Input::Path(abs));
                count += 1;
                continue;
            }

            let walker = WalkDir::new(&abs)
                .max_depth(MAX_WALK_DEPTH)
                .follow_links(false);
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if entry.path_is_symlink() || !entry.file_type().is_file() {
                    continue;
                }
                if count >= MAX_WALK_FILES {
                    warn!(
                        max = MAX_WALK_FILES,
                        "input path expansion overflow, truncating"
                    );
                    break;
                }
                out.push(Input::Path(entry.path().to_path_buf()));
                count += 1;
            }
        }
        out
    }

    /// `urls`: a seed file (one per line, trimmed, blank/`#`-prefixed dropped)
    /// plus repeated `--url` flags; each seed expands via playlist detection;
    /// results deduplicated preserving order across all seeds.
    pub async fn expand_urls(&self, seed_file: Option<&Path>, urls: &[String]) -> Result<Vec<Input>> {
        let mut seeds = Vec::new();
        if let Some(path) = seed_file {
            let text = tokio::fs::read_to_string(path).await?;
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                seeds.push(line.to_string());
            }
        }
        seeds.extend(urls.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for seed in seeds {
            let expanded = self.downloader.expand(&seed).await?;
            for url in expanded {
                if seen.insert(url.clone()) {
                    out.push(Input::Url(url));
                }
            }
        }
        Ok(out)
    }
}

/// Derives the 32-hex-character video id for a local file: a prefix of
/// `SHA-256(basename + "-" + size + "-" + floor(mtime_ms))` (§3.1).
pub fn derive_local_video_id(path: &Path, size: u64, mtime_ms: i64) -> Result<String> {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::BadInput(format!("path has no file name: {}", path.display())))?;
    let input = format!("{basename}-{size}-{mtime_ms}");
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Ok(hex[..32].to_string())
}

async fn file_identity(path: &Path) -> Result<(u64, i64)> {
    let metadata = tokio::fs::metadata(path).await?;
    let size = metadata.len();
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok((size, mtime_ms))
}

/// Cooperative abort signal, checked between items (§4.7 "Cancellation").
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub input_label: String,
    pub video_id: Option<String>,
    pub skipped: bool,
    pub error: Option<String>,
}

pub struct BatchReport {
    pub results: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn any_failed(&self) -> bool {
        self.results.iter().any(|r| r.error.is_some())
    }
}

/// Orchestrates one full run over an expanded input list, sharing a claim
/// counter across `max(1, min(config.jobs, len(inputs)))` workers (§4.7, §5).
pub struct Pipeline {
    store: Store,
    downloader: Downloader,
    transcoder: Transcoder,
    enhancer: EnhancementOrchestrator,
    transcriber: TranscriptionAdapter,
}

impl Pipeline {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            downloader: Downloader::new(),
            transcoder: Transcoder::new(),
            enhancer: EnhancementOrchestrator::new(),
            transcriber: TranscriptionAdapter::new(),
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Runs the full batch over `inputs`, fanning out to
    /// `max(1, min(config.jobs, len(inputs)))` cooperative workers.
    pub async fn run_batch(
        &self,
        inputs: Vec<Input>,
        config: &RunConfig,
        force: bool,
        abort: AbortSignal,
    ) -> Result<BatchReport> {
        if inputs.is_empty() {
            return Err(AppError::BadInput("no inputs to process".to_string()));
        }

        let worker_count = (config.jobs.max(1)).min(inputs.len());
        let inputs = Arc::new(inputs);
        let next_index = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let inputs = inputs.clone();
            let next_index = next_index.clone();
            let abort = abort.clone();
            let config = config.clone();
            // Workers interleave on the current executor via their own await
            // points (matching the lineage's `process_concurrent` idiom);
            // `self`'s Store/adapter handles are shared, not cloned per task.
            workers.push(self.worker_loop(inputs, next_index, abort, config, force));
        }

        let results = futures::future::join_all(workers)
            .await
            .into_iter()
            .flatten()
            .collect();

        Ok(BatchReport { results })
    }

    async fn worker_loop(
        &self,
        inputs: Arc<Vec<Input>>,
        next_index: Arc<AtomicUsize>,
        abort: AbortSignal,
        config: RunConfig,
        force: bool,
    ) -> Vec<ItemOutcome> {
        let mut results = Vec::new();
        loop {
            if abort.is_triggered() {
                break;
            }
            let idx = next_index.fetch_add(1, Ordering::SeqCst);
            if idx >= inputs.len() {
                break;
            }
            let input = &inputs[idx];
            let label = match input {
                Input::Path(p) => p.to_string_lossy().into_owned(),
                Input::Url(u) => u.clone(),
            };
            let outcome = match self.process_item(input, &config, force).await {
                Ok(outcome) => outcome,
                Err(e) => ItemOutcome {
                    input_label: label,
                    video_id: None,
                    skipped: false,
                    error: Some(e.to_string()),
                },
            };
            results.push(outcome);
        }
        results
    }

    /// Steps 1-13 of the per-item algorithm.
    async fn process_item(
        &self,
        input: &Input,
        config: &RunConfig,
        force: bool,
    ) -> Result<ItemOutcome> {
        let label = match input {
            Input::Path(p) => p.to_string_lossy().into_owned(),
            Input::Url(u) => u.clone(),
        };

        // Step 1-2: classify + derive video_id.
        let (source_kind, source_uri, video_id, resolved_url) = match input {
            Input::Path(path) => {
                let (size, mtime_ms) = file_identity(path).await?;
                let video_id = derive_local_video_id(path, size, mtime_ms)?;
                (
                    SourceKind::File,
                    path.to_string_lossy().into_owned(),
                    video_id,
                    None,
                )
            }
            Input::Url(url) => {
                let id = self.downloader.resolve_id(url).await?;
                (SourceKind::Url, url.clone(), id, Some(url.clone()))
            }
        };

        // Step 3: dedupe-skip.
        if !force && self.store.has_transcript(&video_id).await? {
            info!(video_id = %video_id, "skipping (already transcribed)");
            return Ok(ItemOutcome {
                input_label: label,
                video_id: Some(video_id),
                skipped: true,
                error: None,
            });
        }

        // Step 4: force re-entry.
        if force {
            self.store.delete_video_data(&video_id).await?;
        }

        let now = Utc::now();
        let enhancement_json = serde_json::to_value(&config.enhancement).ok();

        // Step 5: upsert as processing.
        self.store
            .upsert_video(&Video {
                video_id: video_id.clone(),
                source_kind,
                source_uri: source_uri.clone(),
                title: None,
                description: None,
                uploader: None,
                channel_id: None,
                duration_ms: None,
                upload_timestamp: None,
                raw_metadata: None,
                local_path: match input {
                    Input::Path(p) => Some(p.to_string_lossy().into_owned()),
                    Input::Url(_) => None,
                },
                language: Some(config.language.clone()),
                engine: Some(enum_as_str(&config.engine)),
                engine_version: None,
                model_path: Some(config.model_path.clone()),
                output_formats: config.output_formats.clone(),
                enhancement_config: enhancement_json.clone(),
                status: VideoStatus::Processing,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let process_result = self
            .process_item_inner(&video_id, input, resolved_url.as_deref(), config)
            .await;

        match process_result {
            Ok(()) => Ok(ItemOutcome {
                input_label: label,
                video_id: Some(video_id),
                skipped: false,
                error: None,
            }),
            Err(e) => {
                // Step 13: record error, continue the batch.
                self.store
                    .update_video_status(&video_id, VideoStatus::Error, Some(&e.to_string()))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn process_item_inner(
        &self,
        video_id: &str,
        input: &Input,
        resolved_url: Option<&str>,
        config: &RunConfig,
    ) -> Result<()> {
        let source_audio_path = match input {
            Input::Path(p) => p.clone(),
            Input::Url(_) => {
                let dir = config.data_dir.join("source_audio");
                let result = self
                    .downloader
                    .download(
                        resolved_url.expect("url input has resolved_url"),
                        video_id,
                        &dir,
                        &DownloadOptions::default(),
                    )
                    .await?;

                let chapters: Vec<Chapter> = result
                    .chapters
                    .iter()
                    .map(|(start, end, title)| Chapter {
                        video_id: video_id.to_string(),
                        start_ms: *start,
                        end_ms: *end,
                        title: title.clone(),
                    })
                    .collect();
                if !chapters.is_empty() {
                    self.store.replace_chapters(video_id, &chapters).await?;
                }

                self.store
                    .upsert_video(&Video {
                        video_id: video_id.to_string(),
                        source_kind: SourceKind::Url,
                        source_uri: resolved_url.unwrap().to_string(),
                        title: result.title.clone(),
                        description: result.description.clone(),
                        uploader: result.uploader.clone(),
                        channel_id: result.channel_id.clone(),
                        duration_ms: result.duration_ms,
                        upload_timestamp: result.upload_timestamp.clone(),
                        raw_metadata: Some(result.raw_metadata.clone()),
                        local_path: Some(result.media_path.to_string_lossy().into_owned()),
                        language: Some(config.language.clone()),
                        engine: Some(enum_as_str(&config.engine)),
                        engine_version: None,
                        model_path: Some(config.model_path.clone()),
                        output_formats: config.output_formats.clone(),
                        enhancement_config: serde_json::to_value(&config.enhancement).ok(),
                        status: VideoStatus::Processing,
                        error: None,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    })
                    .await?;

                self.store
                    .insert_artifact(&Artifact {
                        video_id: video_id.to_string(),
                        kind: ArtifactKind::SourceAudio,
                        uri: result.media_path.to_string_lossy().into_owned(),
                        size_bytes: tokio::fs::metadata(&result.media_path)
                            .await
                            .ok()
                            .map(|m| m.len() as i64),
                        created_at: Utc::now(),
                    })
                    .await?;
                self.store
                    .insert_artifact(&Artifact {
                        video_id: video_id.to_string(),
                        kind: ArtifactKind::SourceInfoJson,
                        uri: result.info_json_path.to_string_lossy().into_owned(),
                        size_bytes: None,
                        created_at: Utc::now(),
                    })
                    .await?;

                result.media_path
            }
        };

        // Step 7: transcode.
        let wav_path = config.data_dir.join("audio").join(format!("{video_id}.wav"));
        self.transcoder.transcode(&source_audio_path, &wav_path).await?;

        // Step 8: enhancement.
        let enhance_work_dir = config.data_dir.join("enhance").join(video_id);
        let mut enhancement_outcome = None;
        let mut enhancement_error_run = None;
        if config.enhancement.mode != crate::config::EnhancementMode::Off {
            match self
                .enhancer
                .run(video_id, &wav_path, &enhance_work_dir, &config.enhancement)
                .await
            {
                Ok(outcome) => enhancement_outcome = Some(outcome),
                Err(e) => match config.enhancement.fail_policy {
                    crate::config::FailPolicy::Fail => return Err(e),
                    crate::config::FailPolicy::FallbackRaw => {
                        warn!(video_id, error = %e, "enhancement failed, falling back to raw audio");
                        let now = Utc::now();
                        enhancement_error_run = Some(EnhancementRun {
                            id: None,
                            video_id: video_id.to_string(),
                            status: EnhancementStatus::Error,
                            applied: false,
                            mode: enum_as_str(&config.enhancement.mode),
                            source_class: Some(enum_as_str(&config.enhancement.source_class)),
                            snr_db: None,
                            regime_count: None,
                            analysis_duration_ms: None,
                            processing_ms: None,
                            metrics: None,
                            versions: None,
                            config: serde_json::to_value(&config.enhancement).ok(),
                            started_at: now,
                            finished_at: now,
                            skip_reason: None,
                            error: Some(e.to_string()),
                        });
                    }
                },
            }
        }

        let transcription_wav = enhancement_outcome
            .as_ref()
            .map(|o| o.wav_path.clone())
            .unwrap_or_else(|| wav_path.clone());

        // Step 9: transcription.
        let transcript_dir = config.data_dir.join("transcripts").join(video_id);
        let engine_output = match config.engine {
            crate::config::Engine::Whisperx => {
                self.transcriber
                    .transcribe_whisperx(
                        &transcription_wav,
                        video_id,
                        &transcript_dir,
                        video_id,
                        config,
                    )
                    .await?
            }
            crate::config::Engine::Tafrigh => {
                self.transcriber
                    .transcribe_tafrigh(&transcription_wav, video_id, config)
                    .await?
            }
        };

        // Step 10: compact transcript JSON.
        let compact = json!({
            "language": engine_output.language,
            "words": engine_output
                .words
                .iter()
                .map(|w| json!({"b": w.start_ms, "e": w.end_ms, "w": w.word}))
                .collect::<Vec<_>>(),
        });
        let text = engine_output
            .segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        // Step 11: gather everything to persist, then commit it in one
        // transaction (transcript, segments, artifacts, enhancement
        // telemetry, and the `done` status transition).
        let transcript = Transcript {
            video_id: video_id.to_string(),
            model: Some(config.model_path.clone()),
            language: Some(engine_output.language.clone()),
            text,
            compact_json: compact,
            created_at: Utc::now(),
        };
        let segments = to_segments(video_id, &engine_output.segments);

        let mut artifacts = Vec::new();
        if let Some(json_path) = &engine_output.engine_json_path {
            artifacts.push(Artifact {
                video_id: video_id.to_string(),
                kind: ArtifactKind::TranscriptJson,
                uri: json_path.to_string_lossy().into_owned(),
                size_bytes: tokio::fs::metadata(json_path).await.ok().map(|m| m.len() as i64),
                created_at: Utc::now(),
            });
        }

        let mut enhancement_run = enhancement_error_run;
        let mut enhancement_segments = Vec::new();

        if let Some(outcome) = &enhancement_outcome {
            enhancement_run = Some(EnhancementRun {
                id: None,
                video_id: video_id.to_string(),
                status: if outcome.applied {
                    EnhancementStatus::Completed
                } else {
                    EnhancementStatus::Skipped
                },
                applied: outcome.applied,
                mode: enum_as_str(&outcome.mode),
                source_class: Some(enum_as_str(&config.enhancement.source_class)),
                snr_db: outcome.analysis.as_ref().and_then(|a| a.snr_db),
                regime_count: outcome.analysis.as_ref().map(|a| a.regime_count),
                analysis_duration_ms: outcome.analysis.as_ref().map(|a| a.analysis_duration_ms),
                processing_ms: outcome.processing_result.as_ref().map(|r| r.processing_ms),
                metrics: outcome.analysis.as_ref().map(|a| {
                    serde_json::json!({
                        "speechRatio": a.speech_ratio,
                        "regimeCount": a.regime_count,
                    })
                }),
                versions: outcome
                    .processing_result
                    .as_ref()
                    .map(|r| serde_json::to_value(&r.versions).unwrap_or_default()),
                config: serde_json::to_value(&config.enhancement).ok(),
                started_at: outcome.started_at,
                finished_at: outcome.finished_at,
                skip_reason: outcome.skip_reason.clone(),
                error: None,
            });

            if let Some(result) = &outcome.processing_result {
                let analysis_regimes = outcome.analysis.as_ref().map(|a| &a.regimes);
                enhancement_segments = result
                    .segments
                    .iter()
                    .map(|s| {
                        let regime = analysis_regimes
                            .and_then(|regimes| regimes.iter().find(|r| r.index == s.segment_index));
                        EnhancementSegment {
                            run_id: 0,
                            segment_index: s.segment_index,
                            start_ms: s.start_ms,
                            end_ms: s.end_ms,
                            dereverb_applied: s.dereverb_applied,
                            denoise_applied: s.denoise_applied,
                            atten_lim_db: s.atten_lim_db,
                            processing_ms: s.processing_ms,
                            noise_rms_db: regime.and_then(|r| r.noise_rms_db),
                            spectral_centroid_hz: regime.and_then(|r| r.spectral_centroid_hz),
                            // Always null: see DESIGN.md for the open question
                            // on `speech_ratio` persistence (§9).
                            speech_ratio: None,
                        }
                    })
                    .collect();
            }

            for artifact in &outcome.artifacts {
                if let Some(kind) = crate::db::models::ArtifactKind::from_str(artifact.kind) {
                    artifacts.push(Artifact {
                        video_id: video_id.to_string(),
                        kind,
                        uri: artifact.path.to_string_lossy().into_owned(),
                        size_bytes: tokio::fs::metadata(&artifact.path)
                            .await
                            .ok()
                            .map(|m| m.len() as i64),
                        created_at: Utc::now(),
                    });
                }
            }
        }

        self.store
            .finalize_transcription(
                video_id,
                &transcript,
                &segments,
                &artifacts,
                enhancement_run.as_ref(),
                &enhancement_segments,
            )
            .await?;

        // Step 12: cleanup.
        if !config.keep_wav {
            tokio::fs::remove_file(&wav_path).await.ok();
        }
        if let Some(outcome) = &enhancement_outcome {
            if outcome.applied && !config.keep_intermediate {
                tokio::fs::remove_file(&outcome.wav_path).await.ok();
            }
        }
        if matches!(input, Input::Url(_)) && !config.keep_source_audio {
            tokio::fs::remove_file(&source_audio_path).await.ok();
        }

        Ok(())
    }
}

/// Renders a serde-tagged enum using its own rename rules (kebab-case,
/// lowercase, …) instead of `{:?}`'s Rust-identifier casing.
fn enum_as_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

fn to_segments(
    video_id: &str,
    normalized: &[crate::transcribe::NormalizedSegment],
) -> Vec<Segment> {
    normalized
        .iter()
        .map(|s| Segment {
            video_id: video_id.to_string(),
            start_ms: s.start_ms,
            end_ms: s.end_ms,
            text: s.text.clone(),
            avg_logprob: None,
            no_speech_prob: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_local_video_id_is_32_hex_chars_and_deterministic() {
        let path = Path::new("video.mp4");
        let a = derive_local_video_id(path, 1024, 1_700_000_000_000).unwrap();
        let b = derive_local_video_id(path, 1024, 1_700_000_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_local_video_id_differs_on_size_change() {
        let path = Path::new("video.mp4");
        let a = derive_local_video_id(path, 1024, 1_700_000_000_000).unwrap();
        let b = derive_local_video_id(path, 2048, 1_700_000_000_000).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn expand_paths_skips_missing_and_finds_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.wav");
        tokio::fs::write(&file_path, b"x").await.unwrap();

        let downloader = Downloader::new();
        let expander = InputExpander::new(&downloader);
        let inputs = expander.expand_paths(&[file_path.clone(), dir.path().join("missing.wav")]);
        assert_eq!(inputs.len(), 1);
        match &inputs[0] {
            Input::Path(p) => assert_eq!(p, &file_path),
            _ => panic!("expected Path"),
        }
    }

    #[tokio::test]
    async fn expand_urls_reads_seed_file_and_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let seed_file = dir.path().join("seeds.txt");
        tokio::fs::write(&seed_file, "# comment\nhttps://example.com/a\n\n  \n")
            .await
            .unwrap();

        let downloader = Downloader::new();
        let expander = InputExpander::new(&downloader);
        // `yt-dlp` may be absent on the test host; either outcome is
        // acceptable here as long as the seed file's comment/blank lines
        // never reach the downloader. When `yt-dlp` is missing the call
        // surfaces as a DownloadFailed error rather than silently
        // succeeding with garbage input.
        match expander.expand_urls(Some(&seed_file), &[]).await {
            Ok(inputs) => assert_eq!(inputs.len(), 1),
            Err(AppError::DownloadFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn abort_signal_round_trips() {
        let signal = AbortSignal::new();
        assert!(!signal.is_triggered());
        signal.trigger();
        assert!(signal.is_triggered());
    }
}
