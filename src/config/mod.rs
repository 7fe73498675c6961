//! Typed run configuration: loading from a JSON file, environment overlay, and
//! validation (§4.10/§6.6/§6.7).
//!
//! `RunConfig` is a plain value passed down the call stack; nothing mutates it in
//! place. Overrides (job-level or CLI-level) always construct a new value via
//! [RunConfig::with_overrides].

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Whisperx,
    Tafrigh,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Whisperx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeType {
    Int8,
    Float16,
    Float32,
}

impl Default for ComputeType {
    fn default() -> Self {
        ComputeType::Int8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnhancementMode {
    Off,
    Auto,
    On,
    AnalyzeOnly,
}

impl Default for EnhancementMode {
    fn default() -> Self {
        EnhancementMode::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceClass {
    Auto,
    Studio,
    Podium,
    FarField,
    Cassette,
}

impl Default for SourceClass {
    fn default() -> Self {
        SourceClass::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DereverbMode {
    Off,
    Auto,
    On,
}

impl Default for DereverbMode {
    fn default() -> Self {
        DereverbMode::Auto
    }
}

/// What to do when the enhancement orchestrator itself fails (§4.5/§4.7 step 8):
/// `fallback_raw` swallows the error and continues with the unenhanced WAV,
/// `fail` propagates it as [crate::error::AppError::EnhancementFailed].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    FallbackRaw,
    Fail,
}

impl Default for FailPolicy {
    fn default() -> Self {
        FailPolicy::FallbackRaw
    }
}

/// One of `{json, txt, srt, vtt, tsv}`. Parsed case-insensitively; duplicates
/// collapse on normalization (see [RunConfig::normalize_output_formats]).
pub const VALID_OUTPUT_FORMATS: &[&str] = &["json", "txt", "srt", "vtt", "tsv"];

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/transcriptor.db")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_jobs() -> usize {
    1
}

fn default_model_path() -> String {
    "turbo".to_string()
}

fn default_output_formats() -> Vec<String> {
    vec!["json".to_string()]
}

fn default_batch_size() -> u32 {
    8
}

fn default_vad_threshold() -> f64 {
    0.5
}

fn default_min_silence_ms() -> u64 {
    300
}

fn default_max_regimes() -> u32 {
    8
}

fn default_atten_lim_db() -> f64 {
    30.0
}

fn default_snr_skip_threshold_db() -> f64 {
    15.0
}

fn default_python_bin() -> PathBuf {
    PathBuf::from("python3")
}

fn default_deep_filter_bin() -> PathBuf {
    PathBuf::from("deep-filter")
}

/// Nested, immutable enhancement configuration (§4.5). Source-class overrides
/// mutate only the analysis payload produced at runtime, never this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementConfig {
    #[serde(default)]
    pub mode: EnhancementMode,
    #[serde(default)]
    pub source_class: SourceClass,
    #[serde(default)]
    pub dereverb_mode: DereverbMode,
    #[serde(default = "default_atten_lim_db")]
    pub atten_lim_db: f64,
    #[serde(default = "default_snr_skip_threshold_db")]
    pub snr_skip_threshold_db: f64,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,
    #[serde(default = "default_max_regimes")]
    pub max_regimes: u32,
    #[serde(default = "default_python_bin")]
    pub python_bin: PathBuf,
    #[serde(default = "default_deep_filter_bin")]
    pub deep_filter_bin: PathBuf,
    #[serde(default)]
    pub plan_in_dir: Option<PathBuf>,
    #[serde(default)]
    pub plan_out_dir: Option<PathBuf>,
    #[serde(default)]
    pub fail_policy: FailPolicy,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            mode: EnhancementMode::default(),
            source_class: SourceClass::default(),
            dereverb_mode: DereverbMode::default(),
            atten_lim_db: default_atten_lim_db(),
            snr_skip_threshold_db: default_snr_skip_threshold_db(),
            vad_threshold: default_vad_threshold(),
            min_silence_ms: default_min_silence_ms(),
            max_regimes: default_max_regimes(),
            python_bin: default_python_bin(),
            deep_filter_bin: default_deep_filter_bin(),
            plan_in_dir: None,
            plan_out_dir: None,
            fail_policy: FailPolicy::default(),
        }
    }
}

/// The typed configuration threaded through the CLI, the job manager, and the
/// pipeline engine (§4.10). Mirrors `RunConfig` from the distilled spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub language: String,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default)]
    pub whisperx_compute_type: ComputeType,
    #[serde(default = "default_batch_size")]
    pub whisperx_batch_size: u32,
    #[serde(default)]
    pub auto_download_model: bool,
    #[serde(default)]
    pub model_download_url: Option<String>,
    #[serde(default = "default_output_formats")]
    pub output_formats: Vec<String>,
    #[serde(default)]
    pub keep_wav: bool,
    #[serde(default)]
    pub keep_intermediate: bool,
    #[serde(default)]
    pub keep_source_audio: bool,
    #[serde(default)]
    pub wit_ai_api_keys: Vec<String>,
    #[serde(default)]
    pub enhancement: EnhancementConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            host: default_host(),
            port: default_port(),
            jobs: default_jobs(),
            engine: Engine::default(),
            language: String::new(),
            model_path: default_model_path(),
            whisperx_compute_type: ComputeType::default(),
            whisperx_batch_size: default_batch_size(),
            auto_download_model: false,
            model_download_url: None,
            output_formats: default_output_formats(),
            keep_wav: false,
            keep_intermediate: false,
            keep_source_audio: false,
            wit_ai_api_keys: Vec::new(),
            enhancement: EnhancementConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from a JSON config file, resolving relative filesystem paths against
    /// the file's parent directory, then apply the environment overlay (§6.7).
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::ConfigError(format!("reading {}: {e}", path.display())))?;
        let mut config: RunConfig = serde_json::from_str(&text)
            .map_err(|e| AppError::ConfigError(format!("parsing {}: {e}", path.display())))?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.data_dir = resolve_against(&base, &config.data_dir);
        config.db_path = resolve_against(&base, &config.db_path);
        config.enhancement.python_bin = resolve_against(&base, &config.enhancement.python_bin);
        config.enhancement.deep_filter_bin =
            resolve_against(&base, &config.enhancement.deep_filter_bin);

        config.apply_env_overlay();
        config.normalize_output_formats();
        config.validate()?;
        Ok(config)
    }

    /// Resolve `BPB_CONFIG_PATH` or a platform config default; fall back to
    /// built-in defaults with the environment overlay applied if no file exists.
    /// A missing file is not a [AppError::ConfigError]; only failed validation is.
    pub fn load() -> Result<Self> {
        let path = env::var("BPB_CONFIG_PATH").ok().map(PathBuf::from).or_else(|| {
            dirs::config_dir().map(|d| d.join("transcriptor").join("config.json"))
        });

        match path {
            Some(p) if p.exists() => Self::from_file(&p),
            _ => {
                let mut config = RunConfig::default();
                config.apply_env_overlay();
                config.normalize_output_formats();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn apply_env_overlay(&mut self) {
        if let Ok(v) = env::var("BPB_WEB_API_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = env::var("BPB_WEB_API_HOST") {
            if !v.trim().is_empty() {
                self.host = v;
            }
        }
        if let Ok(v) = env::var("BPB_WEB_JOB_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.jobs = n;
            }
        }
        if self.wit_ai_api_keys.is_empty() {
            if let Ok(v) = env::var("WIT_AI_API_KEYS") {
                // Intentional: split on literal whitespace, not the `/\s+/` escaping
                // accident documented in DESIGN.md.
                self.wit_ai_api_keys = v
                    .split_whitespace()
                    .map(str::to_string)
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
    }

    fn normalize_output_formats(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.output_formats = self
            .output_formats
            .iter()
            .map(|f| f.to_lowercase())
            .filter(|f| VALID_OUTPUT_FORMATS.contains(&f.as_str()))
            .filter(|f| seen.insert(f.clone()))
            .collect();
    }

    /// Validation rules of §6.6, verbatim.
    pub fn validate(&mut self) -> Result<()> {
        if self.jobs < 1 {
            self.jobs = 1;
        }
        if self.model_path.trim().is_empty() {
            return Err(AppError::ConfigError("modelPath must be non-empty".into()));
        }
        if self.whisperx_batch_size < 1 {
            return Err(AppError::ConfigError(
                "whisperxBatchSize must be >= 1".into(),
            ));
        }
        if self.output_formats.is_empty() {
            return Err(AppError::ConfigError(
                "outputFormats must be non-empty".into(),
            ));
        }
        let e = &self.enhancement;
        if !(0.0..=1.0).contains(&e.vad_threshold) {
            return Err(AppError::ConfigError("vadThreshold must be in [0,1]".into()));
        }
        if e.max_regimes < 1 {
            return Err(AppError::ConfigError("maxRegimes must be >= 1".into()));
        }
        if !e.atten_lim_db.is_finite() {
            return Err(AppError::ConfigError("attenLimDb must be finite".into()));
        }
        if !e.snr_skip_threshold_db.is_finite() {
            return Err(AppError::ConfigError(
                "snrSkipThresholdDb must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Construct a new value with `overrides` applied; never mutates `self`.
    pub fn with_overrides(&self, overrides: &JobOverrides) -> RunConfig {
        let mut next = self.clone();
        if let Some(engine) = overrides.engine {
            next.engine = engine;
        }
        if let Some(keys) = &overrides.wit_ai_api_keys {
            next.wit_ai_api_keys = keys.clone();
        }
        if let Some(lang) = &overrides.language {
            next.language = lang.clone();
        }
        if let Some(model) = &overrides.model_path {
            next.model_path = model.clone();
        }
        if let Some(formats) = &overrides.output_formats {
            next.output_formats = formats.clone();
            next.normalize_output_formats();
        }
        if let Some(mode) = overrides.enhancement_mode {
            next.enhancement.mode = mode;
        }
        if let Some(class) = overrides.source_class {
            next.enhancement.source_class = class;
        }
        if let Some(mode) = overrides.dereverb_mode {
            next.enhancement.dereverb_mode = mode;
        }
        if let Some(v) = overrides.atten_lim_db {
            next.enhancement.atten_lim_db = v;
        }
        if let Some(v) = overrides.snr_skip_threshold_db {
            next.enhancement.snr_skip_threshold_db = v;
        }
        if let Some(policy) = overrides.fail_policy {
            next.enhancement.fail_policy = policy;
        }
        next
    }
}

fn resolve_against(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Per-job overrides accepted on `POST /api/jobs` (§6.1's `CreateJobRequest.overrides`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOverrides {
    pub engine: Option<Engine>,
    pub wit_ai_api_keys: Option<Vec<String>>,
    pub language: Option<String>,
    pub model_path: Option<String>,
    pub output_formats: Option<Vec<String>>,
    pub enhancement_mode: Option<EnhancementMode>,
    pub source_class: Option<SourceClass>,
    pub dereverb_mode: Option<DereverbMode>,
    pub atten_lim_db: Option<f64>,
    pub snr_skip_threshold_db: Option<f64>,
    pub fail_policy: Option<FailPolicy>,
}

impl JobOverrides {
    /// Range checks from §6.1's `CreateJobRequest`: `attenLimDb ∈ [0, 60]`,
    /// `snrSkipThresholdDb ∈ [-20, 60]`. Enum fields are already validated at
    /// JSON-deserialization time since they're closed `serde` enums.
    pub fn validate(&self) -> Result<()> {
        if let Some(v) = self.atten_lim_db {
            if !(0.0..=60.0).contains(&v) {
                return Err(AppError::BadInput("attenLimDb must be in [0, 60]".into()));
            }
        }
        if let Some(v) = self.snr_skip_threshold_db {
            if !(-20.0..=60.0).contains(&v) {
                return Err(AppError::BadInput(
                    "snrSkipThresholdDb must be in [-20, 60]".into(),
                ));
            }
        }
        if let Some(formats) = &self.output_formats {
            if formats.is_empty() {
                return Err(AppError::BadInput("outputFormats must be non-empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut config = RunConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn jobs_below_one_is_clamped() {
        let mut config = RunConfig::default();
        config.jobs = 0;
        config.validate().unwrap();
        assert_eq!(config.jobs, 1);
    }

    #[test]
    fn empty_model_path_is_config_error() {
        let mut config = RunConfig::default();
        config.model_path = "  ".to_string();
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn vad_threshold_out_of_range_is_config_error() {
        let mut config = RunConfig::default();
        config.enhancement.vad_threshold = 1.5;
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn output_formats_normalize_dedupe_and_drop_unknown() {
        let mut config = RunConfig::default();
        config.output_formats = vec!["JSON".into(), "json".into(), "bogus".into(), "srt".into()];
        config.normalize_output_formats();
        assert_eq!(config.output_formats, vec!["json".to_string(), "srt".to_string()]);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let base = Path::new("/etc/transcriptor");
        let resolved = resolve_against(base, Path::new("data"));
        assert_eq!(resolved, PathBuf::from("/etc/transcriptor/data"));
        let abs = resolve_against(base, Path::new("/abs/data"));
        assert_eq!(abs, PathBuf::from("/abs/data"));
    }

    #[test]
    fn with_overrides_does_not_mutate_base() {
        let base = RunConfig::default();
        let overrides = JobOverrides {
            model_path: Some("large-v3".to_string()),
            ..Default::default()
        };
        let next = base.with_overrides(&overrides);
        assert_eq!(base.model_path, "turbo");
        assert_eq!(next.model_path, "large-v3");
    }
}
