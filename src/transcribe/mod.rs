//! Invokes the selected transcription engine (local WhisperX CLI or cloud
//! tafrigh) and normalizes its output to `{language, segments[], words[]}`
//! (§4.6).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::config::{ComputeType, RunConfig};
use crate::error::{AppError, Result};
use crate::subprocess::Runner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedWord {
    pub start_ms: i64,
    pub end_ms: i64,
    pub word: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSegment {
    pub video_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub language: String,
    pub segments: Vec<NormalizedSegment>,
    pub words: Vec<NormalizedWord>,
    /// Path to the engine's own JSON output file (used to derive the compact
    /// transcript JSON and, when plain text is missing, the stored text).
    pub engine_json_path: Option<PathBuf>,
}

/// Whisperx binary selection is cached process-wide once resolved (§9).
static WHISPERX_BIN_CACHE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Resets the whisperx-binary resolution cache. Test-only hook (§9).
#[cfg(test)]
pub fn reset_whisperx_bin_cache_for_tests() {
    *WHISPERX_BIN_CACHE.lock().unwrap() = None;
}

const KNOWN_VENV_PATHS: &[&str] = &[
    "/opt/whisperx/bin/whisperx",
    "/usr/local/whisperx/venv/bin/whisperx",
];

fn tighten_punct_re() -> &'static Regex {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([,.;:!?،؟'\")\]}])").unwrap());
    &RE
}

fn tighten_open_bracket_re() -> &'static Regex {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\[({])\s+").unwrap());
    &RE
}

/// Reconstructs segment text from its word list, then tightens whitespace
/// around punctuation/brackets (§4.6).
pub fn tighten_text(words: &[&str]) -> String {
    let joined = words.join(" ");
    let joined = tighten_punct_re().replace_all(&joined, "$1");
    let joined = tighten_open_bracket_re().replace_all(&joined, "$1");
    joined.trim().to_string()
}

fn ms_round(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

pub struct TranscriptionAdapter {
    runner: Runner,
}

impl Default for TranscriptionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptionAdapter {
    pub fn new() -> Self {
        Self { runner: Runner::new() }
    }

    async fn resolve_whisperx_bin(&self) -> Result<String> {
        if let Some(cached) = WHISPERX_BIN_CACHE.lock().unwrap().clone() {
            return Ok(cached);
        }

        if let Ok(env_path) = std::env::var("WHISPERX_BIN") {
            if !env_path.trim().is_empty() {
                *WHISPERX_BIN_CACHE.lock().unwrap() = Some(env_path.clone());
                return Ok(env_path);
            }
        }

        let on_path = self
            .runner
            .capture("whisperx", &["--help"])
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        if on_path {
            *WHISPERX_BIN_CACHE.lock().unwrap() = Some("whisperx".to_string());
            return Ok("whisperx".to_string());
        }

        for candidate in KNOWN_VENV_PATHS {
            if Path::new(candidate).exists() {
                *WHISPERX_BIN_CACHE.lock().unwrap() = Some((*candidate).to_string());
                return Ok((*candidate).to_string());
            }
        }

        Err(AppError::TranscriptionFailed(
            "no working whisperx candidate found".to_string(),
        ))
    }

    /// Runs `whisperx` over `wav`, renames requested-format outputs to
    /// `<output_base>.<ext>`, and returns the normalized transcription.
    pub async fn transcribe_whisperx(
        &self,
        wav: &Path,
        video_id: &str,
        output_dir: &Path,
        output_base: &str,
        config: &RunConfig,
    ) -> Result<TranscriptionOutput> {
        let bin = self.resolve_whisperx_bin().await?;
        tokio::fs::create_dir_all(output_dir).await?;

        let compute_type = match config.whisperx_compute_type {
            ComputeType::Int8 => "int8",
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
        };

        let mut args = vec![
            wav.to_string_lossy().into_owned(),
            "--model".to_string(),
            config.model_path.clone(),
            "--output_dir".to_string(),
            output_dir.to_string_lossy().into_owned(),
            "--output_format".to_string(),
            "all".to_string(),
            "--compute_type".to_string(),
            compute_type.to_string(),
            "--batch_size".to_string(),
            config.whisperx_batch_size.max(1).to_string(),
            "--vad_method".to_string(),
            "silero".to_string(),
            "--print_progress".to_string(),
            "True".to_string(),
        ];

        let lang = config.language.trim();
        if !lang.is_empty() && !lang.eq_ignore_ascii_case("auto") {
            args.push("--language".to_string());
            args.push(lang.to_string());
        }

        let runner = self.runner.clone().with_env(
            "PYTHONWARNINGS",
            "ignore::UserWarning:pyannote.audio.core.io",
        );

        let out = runner
            .stream(&bin, &args)
            .await
            .map_err(|e| AppError::TranscriptionFailed(e.to_string()))?;
        if !out.success() {
            return Err(AppError::TranscriptionFailed(out.stderr_tail));
        }

        let stem = wav
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let json_src = output_dir.join(format!("{stem}.json"));
        let json_dst = output_dir.join(format!("{output_base}.json"));
        if json_src != json_dst {
            tokio::fs::rename(&json_src, &json_dst).await.ok();
        }

        for fmt in ["txt", "srt", "vtt", "tsv"] {
            let src = output_dir.join(format!("{stem}.{fmt}"));
            if !src.exists() {
                continue;
            }
            if config.output_formats.iter().any(|f| f == fmt) {
                let dst = output_dir.join(format!("{output_base}.{fmt}"));
                tokio::fs::rename(&src, &dst).await.ok();
            } else {
                tokio::fs::remove_file(&src).await.ok();
            }
        }

        let text = tokio::fs::read_to_string(&json_dst)
            .await
            .map_err(|e| AppError::TranscriptionFailed(format!("reading engine output: {e}")))?;
        let raw: Json = serde_json::from_str(&text)
            .map_err(|e| AppError::TranscriptionFailed(format!("parsing engine output: {e}")))?;

        let mut output = normalize_engine_json(&raw, video_id);
        output.engine_json_path = Some(json_dst);
        Ok(output)
    }

    /// Submits `wav` to the tafrigh cloud engine. Requires a non-empty API
    /// key list.
    pub async fn transcribe_tafrigh(
        &self,
        wav: &Path,
        video_id: &str,
        config: &RunConfig,
    ) -> Result<TranscriptionOutput> {
        if config.wit_ai_api_keys.is_empty() {
            return Err(AppError::BadInput(
                "tafrigh requires at least one wit.ai api key".to_string(),
            ));
        }

        let keys_csv = config.wit_ai_api_keys.join(",");
        let out = self
            .runner
            .capture(
                "tafrigh",
                &[
                    "--wit_api_keys".to_string(),
                    keys_csv,
                    "--output_formats".to_string(),
                    "json".to_string(),
                    wav.to_string_lossy().into_owned(),
                ],
            )
            .await
            .map_err(|e| AppError::TranscriptionFailed(e.to_string()))?;

        if !out.success() {
            return Err(AppError::TranscriptionFailed(out.stderr.trim().to_string()));
        }

        let raw: Json = serde_json::from_str(&out.stdout)
            .map_err(|e| AppError::TranscriptionFailed(format!("parsing tafrigh output: {e}")))?;
        Ok(normalize_engine_json(&raw, video_id))
    }
}

/// Tolerates either `segments[]` or the legacy `transcription[]` top-level
/// array, and per-segment either numeric `start`/`end` (seconds) or an
/// `offsets.{from,to}` (ms) object; malformed segments are dropped rather
/// than failing the whole transcript (§9).
fn normalize_engine_json(raw: &Json, video_id: &str) -> TranscriptionOutput {
    let language = raw
        .get("language")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string();

    let entries = raw
        .get("segments")
        .or_else(|| raw.get("transcription"))
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();

    let mut segments = Vec::new();
    let mut words = Vec::new();

    for entry in &entries {
        let (start_ms, end_ms) = match segment_bounds_ms(entry) {
            Some(bounds) => bounds,
            None => continue,
        };
        if end_ms < start_ms || start_ms < 0 {
            continue;
        }

        let mut segment_words: Vec<NormalizedWord> = entry
            .get("words")
            .and_then(Json::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|w| {
                        let (ws, we) = word_bounds_ms(w)?;
                        let text = w.get("word").and_then(Json::as_str)?.trim().to_string();
                        if text.is_empty() || we < ws || ws < 0 {
                            return None;
                        }
                        Some(NormalizedWord { start_ms: ws, end_ms: we, word: text })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if segment_words.is_empty() {
            if let Some(text) = entry.get("text").and_then(Json::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    segment_words.push(NormalizedWord {
                        start_ms,
                        end_ms,
                        word: trimmed.to_string(),
                    });
                }
            }
        }

        let word_refs: Vec<&str> = segment_words.iter().map(|w| w.word.as_str()).collect();
        let text = tighten_text(&word_refs);
        if text.trim().is_empty() {
            continue;
        }

        words.extend(segment_words);
        segments.push(NormalizedSegment {
            video_id: video_id.to_string(),
            start_ms,
            end_ms,
            text,
        });
    }

    words.sort_by_key(|w| w.start_ms);

    TranscriptionOutput {
        language,
        segments,
        words,
        engine_json_path: None,
    }
}

fn segment_bounds_ms(entry: &Json) -> Option<(i64, i64)> {
    if let (Some(start), Some(end)) = (entry.get("start"), entry.get("end")) {
        let start = start.as_f64()?;
        let end = end.as_f64()?;
        if !start.is_finite() || !end.is_finite() {
            return None;
        }
        return Some((ms_round(start), ms_round(end)));
    }
    if let Some(offsets) = entry.get("offsets") {
        let from = offsets.get("from")?.as_f64()?;
        let to = offsets.get("to")?.as_f64()?;
        if !from.is_finite() || !to.is_finite() {
            return None;
        }
        return Some((from.round() as i64, to.round() as i64));
    }
    None
}

fn word_bounds_ms(entry: &Json) -> Option<(i64, i64)> {
    let start = entry.get("start")?.as_f64()?;
    let end = entry.get("end")?.as_f64()?;
    if !start.is_finite() || !end.is_finite() {
        return None;
    }
    Some((ms_round(start), ms_round(end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tighten_text_removes_space_before_punctuation() {
        let words = vec!["Hello", ",", "world", "!"];
        assert_eq!(tighten_text(&words), "Hello, world!");
    }

    #[test]
    fn tighten_text_removes_space_after_opening_bracket() {
        let words = vec!["say", "(", "hi", ")"];
        assert_eq!(tighten_text(&words), "say (hi)");
    }

    #[test]
    fn normalize_handles_seconds_based_segments() {
        let raw = json!({
            "language": "ar",
            "segments": [
                {"start": 0.0, "end": 0.6, "text": "Assalamu alaikum",
                 "words": [
                    {"start": 0.0, "end": 0.3, "word": "Assalamu"},
                    {"start": 0.3, "end": 0.6, "word": "alaikum"}
                 ]}
            ]
        });
        let out = normalize_engine_json(&raw, "v1");
        assert_eq!(out.language, "ar");
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].start_ms, 0);
        assert_eq!(out.segments[0].end_ms, 600);
        assert_eq!(out.words.len(), 2);
        assert_eq!(out.words[0].end_ms, 300);
    }

    #[test]
    fn normalize_handles_legacy_transcription_array_and_offsets() {
        let raw = json!({
            "language": "en",
            "transcription": [
                {"offsets": {"from": 0, "to": 500}, "text": "hello"}
            ]
        });
        let out = normalize_engine_json(&raw, "v1");
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].end_ms, 500);
    }

    #[test]
    fn normalize_drops_malformed_segments_without_failing() {
        let raw = json!({
            "language": "en",
            "segments": [
                {"start": "bad", "end": 1.0, "text": "broken"},
                {"start": 0.0, "end": 1.0, "text": "ok"}
            ]
        });
        let out = normalize_engine_json(&raw, "v1");
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].text, "ok");
    }

    #[test]
    fn normalize_drops_pure_whitespace_segments() {
        let raw = json!({
            "language": "en",
            "segments": [
                {"start": 0.0, "end": 1.0, "text": "   "}
            ]
        });
        let out = normalize_engine_json(&raw, "v1");
        assert!(out.segments.is_empty());
    }
}
