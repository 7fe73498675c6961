//! Audio enhancement orchestrator: analyze-or-load a plan, gate on SNR, apply
//! source-class overrides, invoke the processor, and collect telemetry (§4.5).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::config::{DereverbMode, EnhancementConfig, EnhancementMode, SourceClass};
use crate::error::{AppError, Result};
use crate::subprocess::Runner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseReference {
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommended {
    pub dereverb: bool,
    pub denoise: bool,
    pub atten_lim_db: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regime {
    pub index: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub noise_rms_db: Option<f64>,
    pub spectral_centroid_hz: Option<f64>,
    pub noise_reference: Option<NoiseReference>,
    pub recommended: Recommended,
}

/// The analyzer's output file contract (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub version: String,
    pub input_path: String,
    pub duration_ms: i64,
    pub sample_rate: i64,
    pub snr_db: Option<f64>,
    pub speech_ratio: Option<f64>,
    pub regime_count: i64,
    pub regimes: Vec<Regime>,
    #[serde(default)]
    pub silence_spans: Vec<Json>,
    #[serde(default)]
    pub speech_spans: Vec<Json>,
    pub analysis_duration_ms: i64,
    #[serde(default)]
    pub versions: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSegment {
    pub segment_index: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub dereverb_applied: bool,
    pub denoise_applied: bool,
    pub atten_lim_db: f64,
    pub processing_ms: i64,
}

/// The processor's output file contract (§6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub version: String,
    pub input_path: String,
    pub output_path: String,
    pub duration_ms: i64,
    pub processing_ms: i64,
    pub segments: Vec<ProcessingSegment>,
    #[serde(default)]
    pub versions: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct EnhancementArtifact {
    pub kind: &'static str,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EnhancementOutcome {
    pub wav_path: PathBuf,
    pub applied: bool,
    pub mode: EnhancementMode,
    pub skip_reason: Option<String>,
    pub analysis: Option<Analysis>,
    pub processing_result: Option<ProcessingResult>,
    pub artifacts: Vec<EnhancementArtifact>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Memoization key for [checkEnhancementAvailable]: resolved paths whose
/// identity determines whether a prior probe still applies (§4.5, §9).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AvailabilityKey {
    python_bin: PathBuf,
    deep_filter_bin: PathBuf,
    analyze_only: bool,
}

static AVAILABILITY_CACHE: Lazy<Mutex<Option<(AvailabilityKey, bool)>>> =
    Lazy::new(|| Mutex::new(None));

/// Resets the enhancement-availability memoization cache. Test-only hook (§9).
#[cfg(test)]
pub fn reset_availability_cache_for_tests() {
    *AVAILABILITY_CACHE.lock().unwrap() = None;
}

pub struct EnhancementOrchestrator {
    runner: Runner,
}

impl Default for EnhancementOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnhancementOrchestrator {
    pub fn new() -> Self {
        Self { runner: Runner::new() }
    }

    /// Verifies the Python runtime, helper scripts, a health-check import, and
    /// (unless `analyze-only`) the deep-filter binary's `--version`. Memoized
    /// by the tuple of resolved paths; any change bypasses the cache.
    pub async fn check_available(&self, config: &EnhancementConfig) -> Result<bool> {
        let key = AvailabilityKey {
            python_bin: config.python_bin.clone(),
            deep_filter_bin: config.deep_filter_bin.clone(),
            analyze_only: config.mode == EnhancementMode::AnalyzeOnly,
        };

        if let Some((cached_key, result)) = AVAILABILITY_CACHE.lock().unwrap().clone() {
            if cached_key == key {
                return Ok(result);
            }
        }

        let python_ok = self
            .runner
            .capture(&config.python_bin.to_string_lossy(), &["--version"])
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        let health_ok = if python_ok {
            self.runner
                .capture(
                    &config.python_bin.to_string_lossy(),
                    &["-c", "import numpy, scipy, soundfile"],
                )
                .await
                .map(|o| o.success())
                .unwrap_or(false)
        } else {
            false
        };

        let deep_filter_ok = if key.analyze_only {
            true
        } else {
            self.runner
                .capture(&config.deep_filter_bin.to_string_lossy(), &["--version"])
                .await
                .map(|o| o.success())
                .unwrap_or(false)
        };

        let available = python_ok && health_ok && deep_filter_ok;
        *AVAILABILITY_CACHE.lock().unwrap() = Some((key, available));
        Ok(available)
    }

    /// The 8-step algorithm of §4.5.
    pub async fn run(
        &self,
        video_id: &str,
        raw_wav_path: &Path,
        work_dir: &Path,
        config: &EnhancementConfig,
    ) -> Result<EnhancementOutcome> {
        let started_at = Utc::now();

        if config.mode == EnhancementMode::Off {
            return Ok(EnhancementOutcome {
                wav_path: raw_wav_path.to_path_buf(),
                applied: false,
                mode: config.mode,
                skip_reason: Some("enhancement_disabled".to_string()),
                analysis: None,
                processing_result: None,
                artifacts: vec![],
                started_at,
                finished_at: Utc::now(),
            });
        }

        tokio::fs::create_dir_all(work_dir).await?;

        let mut artifacts = Vec::new();
        let analysis_path = work_dir.join("analysis.json");

        let mut analysis = if let Some(plan_in_dir) = &config.plan_in_dir {
            let candidate = plan_in_dir.join(format!("{video_id}.json"));
            if candidate.exists() {
                let text = tokio::fs::read_to_string(&candidate).await?;
                let analysis: Analysis = serde_json::from_str(&text)?;
                tokio::fs::write(&analysis_path, &text).await?;
                Some(analysis)
            } else {
                None
            }
        } else {
            None
        };

        if analysis.is_none() {
            analysis = Some(self.analyze(raw_wav_path, &analysis_path, config).await?);
        }
        let mut analysis = analysis.expect("resolved above");
        artifacts.push(EnhancementArtifact {
            kind: "enhancement_analysis_json",
            path: analysis_path.clone(),
        });

        if let Some(plan_out_dir) = &config.plan_out_dir {
            tokio::fs::create_dir_all(plan_out_dir).await?;
            let out_path = plan_out_dir.join(format!("{video_id}.json"));
            tokio::fs::write(&out_path, serde_json::to_string_pretty(&analysis)?).await?;
            artifacts.push(EnhancementArtifact {
                kind: "enhancement_plan_json",
                path: out_path,
            });
        }

        if config.mode == EnhancementMode::AnalyzeOnly {
            return Ok(EnhancementOutcome {
                wav_path: raw_wav_path.to_path_buf(),
                applied: false,
                mode: config.mode,
                skip_reason: Some("analyze_only_mode".to_string()),
                analysis: Some(analysis),
                processing_result: None,
                artifacts,
                started_at,
                finished_at: Utc::now(),
            });
        }

        if config.mode == EnhancementMode::Auto {
            if let Some(snr) = analysis.snr_db {
                if snr >= config.snr_skip_threshold_db {
                    return Ok(EnhancementOutcome {
                        wav_path: raw_wav_path.to_path_buf(),
                        applied: false,
                        mode: config.mode,
                        skip_reason: Some(format!(
                            "snr_above_threshold ({snr:.1} >= {})",
                            format_threshold(config.snr_skip_threshold_db)
                        )),
                        analysis: Some(analysis),
                        processing_result: None,
                        artifacts,
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
            }
        }

        for regime in &mut analysis.regimes {
            regime.recommended.atten_lim_db = config.atten_lim_db;
            if matches!(config.source_class, SourceClass::FarField | SourceClass::Podium) {
                regime.recommended.dereverb = true;
            }
        }
        tokio::fs::write(&analysis_path, serde_json::to_string_pretty(&analysis)?).await?;

        let enhanced_path = work_dir.join("enhanced.wav");
        let result_path = work_dir.join("result.json");
        let processing_result = self
            .process(
                raw_wav_path,
                &analysis_path,
                &enhanced_path,
                &result_path,
                config,
            )
            .await?;

        artifacts.push(EnhancementArtifact {
            kind: "audio_wav_enhanced",
            path: enhanced_path.clone(),
        });
        artifacts.push(EnhancementArtifact {
            kind: "enhancement_result_json",
            path: result_path,
        });

        Ok(EnhancementOutcome {
            wav_path: enhanced_path,
            applied: true,
            mode: config.mode,
            skip_reason: None,
            analysis: Some(analysis),
            processing_result: Some(processing_result),
            artifacts,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn analyze(
        &self,
        input_wav: &Path,
        output_path: &Path,
        config: &EnhancementConfig,
    ) -> Result<Analysis> {
        let out = self
            .runner
            .capture(
                &config.python_bin.to_string_lossy(),
                &[
                    "-m".to_string(),
                    "analyze_audio".to_string(),
                    input_wav.to_string_lossy().into_owned(),
                    "--output".to_string(),
                    output_path.to_string_lossy().into_owned(),
                    "--vad-threshold".to_string(),
                    config.vad_threshold.to_string(),
                    "--min-silence-ms".to_string(),
                    config.min_silence_ms.to_string(),
                    "--max-regimes".to_string(),
                    config.max_regimes.to_string(),
                ],
            )
            .await
            .map_err(|e| AppError::EnhancementFailed(e.to_string()))?;

        if !out.success() {
            return Err(AppError::EnhancementFailed(out.stderr.trim().to_string()));
        }

        let text = tokio::fs::read_to_string(output_path)
            .await
            .map_err(|e| AppError::EnhancementFailed(format!("reading analysis output: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::EnhancementFailed(format!("parsing analysis output: {e}")))
    }

    async fn process(
        &self,
        input_wav: &Path,
        analysis_path: &Path,
        output_wav: &Path,
        result_path: &Path,
        config: &EnhancementConfig,
    ) -> Result<ProcessingResult> {
        let dereverb_flag = match config.dereverb_mode {
            DereverbMode::Off => "off",
            DereverbMode::Auto => "auto",
            DereverbMode::On => "on",
        };

        let out = self
            .runner
            .capture(
                &config.python_bin.to_string_lossy(),
                &[
                    "-m".to_string(),
                    "process_audio".to_string(),
                    input_wav.to_string_lossy().into_owned(),
                    "--analysis".to_string(),
                    analysis_path.to_string_lossy().into_owned(),
                    "--output".to_string(),
                    output_wav.to_string_lossy().into_owned(),
                    "--result".to_string(),
                    result_path.to_string_lossy().into_owned(),
                    "--atten-lim-db".to_string(),
                    config.atten_lim_db.to_string(),
                    "--dereverb".to_string(),
                    dereverb_flag.to_string(),
                    "--overlap-ms".to_string(),
                    "50".to_string(),
                    "--deep-filter-bin".to_string(),
                    config.deep_filter_bin.to_string_lossy().into_owned(),
                ],
            )
            .await
            .map_err(|e| AppError::EnhancementFailed(e.to_string()))?;

        if !out.success() {
            return Err(AppError::EnhancementFailed(out.stderr.trim().to_string()));
        }

        let text = tokio::fs::read_to_string(result_path)
            .await
            .map_err(|e| AppError::EnhancementFailed(format!("reading result output: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::EnhancementFailed(format!("parsing result output: {e}")))
    }
}

/// Matches the `/^snr_above_threshold \(20\.0 >= 15\)$/` shape in §8 scenario
/// 3: the threshold renders without a trailing `.0` when it's a whole number,
/// matching how the reference analyzer formats its own thresholds.
fn format_threshold(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_skip_reason_short_circuits() {
        // Covered in integration tests under tests/ via EnhancementOrchestrator::run;
        // this module-local test only checks the threshold formatter used by the
        // SNR gate message.
        assert_eq!(format_threshold(15.0), "15");
        assert_eq!(format_threshold(14.9), "14.9");
    }

    #[tokio::test]
    async fn off_mode_returns_raw_wav_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.wav");
        tokio::fs::write(&raw, b"fake").await.unwrap();
        let orchestrator = EnhancementOrchestrator::new();
        let mut config = EnhancementConfig::default();
        config.mode = EnhancementMode::Off;
        let outcome = orchestrator
            .run("vid1", &raw, dir.path(), &config)
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.skip_reason.as_deref(), Some("enhancement_disabled"));
        assert_eq!(outcome.wav_path, raw);
    }

    #[tokio::test]
    async fn snr_gate_skips_when_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.wav");
        tokio::fs::write(&raw, b"fake").await.unwrap();

        let plan_dir = dir.path().join("plans");
        tokio::fs::create_dir_all(&plan_dir).await.unwrap();
        let analysis = Analysis {
            version: "1".into(),
            input_path: raw.to_string_lossy().into_owned(),
            duration_ms: 1000,
            sample_rate: 16000,
            snr_db: Some(20.0),
            speech_ratio: Some(0.8),
            regime_count: 1,
            regimes: vec![Regime {
                index: 0,
                start_ms: 0,
                end_ms: 1000,
                noise_rms_db: Some(-40.0),
                spectral_centroid_hz: Some(1200.0),
                noise_reference: None,
                recommended: Recommended {
                    dereverb: false,
                    denoise: true,
                    atten_lim_db: 30.0,
                },
            }],
            silence_spans: vec![],
            speech_spans: vec![],
            analysis_duration_ms: 5,
            versions: Default::default(),
        };
        tokio::fs::write(
            plan_dir.join("vid1.json"),
            serde_json::to_string(&analysis).unwrap(),
        )
        .await
        .unwrap();

        let orchestrator = EnhancementOrchestrator::new();
        let mut config = EnhancementConfig::default();
        config.mode = EnhancementMode::Auto;
        config.snr_skip_threshold_db = 15.0;
        config.plan_in_dir = Some(plan_dir);

        let outcome = orchestrator
            .run("vid1", &raw, dir.path(), &config)
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(
            outcome.skip_reason.as_deref(),
            Some("snr_above_threshold (20.0 >= 15)")
        );
    }
}
