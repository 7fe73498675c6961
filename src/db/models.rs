//! Persisted entity types (§3.1). These are plain Rust values; the Store is the
//! only thing that knows how they map onto SQLite rows (see [super::sqlite_helpers]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    File,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::File => "file",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "url" => SourceKind::Url,
            _ => SourceKind::File,
        }
    }
}

/// `new → processing → done`, or `new → processing → error`. `error`/`failed` are
/// retryable; the retry entry point is the only non-monotone transition (§3.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    New,
    Processing,
    Done,
    Error,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::New => "new",
            VideoStatus::Processing => "processing",
            VideoStatus::Done => "done",
            VideoStatus::Error => "error",
            VideoStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => VideoStatus::Processing,
            "done" => VideoStatus::Done,
            "error" => VideoStatus::Error,
            "failed" => VideoStatus::Failed,
            _ => VideoStatus::New,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, VideoStatus::Error | VideoStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub video_id: String,
    pub source_kind: SourceKind,
    pub source_uri: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub channel_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub upload_timestamp: Option<String>,
    pub raw_metadata: Option<Json>,
    pub local_path: Option<String>,
    pub language: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
    pub model_path: Option<String>,
    pub output_formats: Vec<String>,
    pub enhancement_config: Option<Json>,
    pub status: VideoStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub video_id: String,
    pub model: Option<String>,
    pub language: Option<String>,
    pub text: String,
    pub compact_json: Json,
    pub created_at: DateTime<Utc>,
}

/// `end_ms >= start_ms >= 0` (§3.2 invariant 3 / §8 universal invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub video_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub avg_logprob: Option<f64>,
    pub no_speech_prob: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub video_id: String,
    pub start_ms: i64,
    pub end_ms: Option<i64>,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    AudioWav,
    AudioWavEnhanced,
    SourceAudio,
    SourceInfoJson,
    TranscriptTxt,
    TranscriptJson,
    EnhancementAnalysisJson,
    EnhancementPlanJson,
    EnhancementResultJson,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::AudioWav => "audio_wav",
            ArtifactKind::AudioWavEnhanced => "audio_wav_enhanced",
            ArtifactKind::SourceAudio => "source_audio",
            ArtifactKind::SourceInfoJson => "source_info_json",
            ArtifactKind::TranscriptTxt => "transcript_txt",
            ArtifactKind::TranscriptJson => "transcript_json",
            ArtifactKind::EnhancementAnalysisJson => "enhancement_analysis_json",
            ArtifactKind::EnhancementPlanJson => "enhancement_plan_json",
            ArtifactKind::EnhancementResultJson => "enhancement_result_json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "audio_wav" => ArtifactKind::AudioWav,
            "audio_wav_enhanced" => ArtifactKind::AudioWavEnhanced,
            "source_audio" => ArtifactKind::SourceAudio,
            "source_info_json" => ArtifactKind::SourceInfoJson,
            "transcript_txt" => ArtifactKind::TranscriptTxt,
            "transcript_json" => ArtifactKind::TranscriptJson,
            "enhancement_analysis_json" => ArtifactKind::EnhancementAnalysisJson,
            "enhancement_plan_json" => ArtifactKind::EnhancementPlanJson,
            "enhancement_result_json" => ArtifactKind::EnhancementResultJson,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub video_id: String,
    pub kind: ArtifactKind,
    pub uri: String,
    pub size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementStatus {
    Completed,
    Skipped,
    Error,
}

impl EnhancementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancementStatus::Completed => "completed",
            EnhancementStatus::Skipped => "skipped",
            EnhancementStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => EnhancementStatus::Completed,
            "error" => EnhancementStatus::Error,
            _ => EnhancementStatus::Skipped,
        }
    }
}

/// `applied=1` implies `status=completed`; `skipped` implies `applied=0` with a
/// non-null `skip_reason` (§3.1 EnhancementRun invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementRun {
    pub id: Option<i64>,
    pub video_id: String,
    pub status: EnhancementStatus,
    pub applied: bool,
    pub mode: String,
    pub source_class: Option<String>,
    pub snr_db: Option<f64>,
    pub regime_count: Option<i64>,
    pub analysis_duration_ms: Option<i64>,
    pub processing_ms: Option<i64>,
    pub metrics: Option<Json>,
    pub versions: Option<Json>,
    pub config: Option<Json>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
}

/// One row per analysis regime actually processed. `speech_ratio` is always
/// persisted `null` — see DESIGN.md for why that open question isn't "fixed".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementSegment {
    pub run_id: i64,
    pub segment_index: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub dereverb_applied: bool,
    pub denoise_applied: bool,
    pub atten_lim_db: f64,
    pub processing_ms: i64,
    pub noise_rms_db: Option<f64>,
    pub spectral_centroid_hz: Option<f64>,
    pub speech_ratio: Option<f64>,
}

/// One row of `GET /api/transcripts` (§6.1): a video joined with its
/// transcript, trimmed to what the dashboard's list view actually renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptListItem {
    pub video_id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel_id: Option<String>,
    pub language: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: VideoStatus,
    pub model: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One row of `GET /api/channels` (§6.1): a distinct uploader/channel pair
/// with how many videos reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: Option<String>,
    pub uploader: Option<String>,
    pub video_count: i64,
}

/// Result row of [crate::db::store::Store::search_segments] (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub video_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub score: f64,
}
