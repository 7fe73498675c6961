//! Drives `yt-dlp`/`ffprobe`: resolves a canonical ID, expands playlists and
//! channels, downloads media through a fallback ladder, and validates the
//! result against its `.info.json` sidecar (§4.3).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::subprocess::Runner;

const COMMON_ARGS: &[&str] = &[
    "--retries",
    "5",
    "--fragment-retries",
    "5",
    "--file-access-retries",
    "10",
    "--retry-sleep",
    "3",
    "--socket-timeout",
    "30",
    "--concurrent-fragments",
    "1",
    "--force-ipv4",
    "--write-info-json",
    "--continue",
    "--part",
];

/// `aria2c` availability is probed once per process and cached (§5 "shared
/// resources", §9 "global mutable state"). `0` = unknown, `1` = available,
/// `2` = unavailable.
static ARIA2C_STATE: AtomicU8 = AtomicU8::new(0);

/// Resets the `aria2c` availability cache. Test-only hook (§9).
#[cfg(test)]
pub fn reset_aria2c_probe_for_tests() {
    ARIA2C_STATE.store(0, Ordering::SeqCst);
}

fn webpage_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://").unwrap())
}

fn interrupt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)interrupted by user|keyboardinterrupt").unwrap())
}

/// One row of `<id>.info.json`, tolerant of the fields we actually need.
#[derive(Debug, Deserialize)]
struct InfoJson {
    id: String,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    filesize: Option<f64>,
    #[serde(default)]
    filesize_approx: Option<f64>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    chapters: Option<Json>,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub id: String,
    pub media_path: PathBuf,
    pub info_json_path: PathBuf,
    pub title: Option<String>,
    pub description: Option<String>,
    pub uploader: Option<String>,
    pub channel_id: Option<String>,
    pub upload_timestamp: Option<String>,
    pub duration_ms: Option<i64>,
    pub raw_metadata: Json,
    pub chapters: Vec<(i64, Option<i64>, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub requested_format: Option<String>,
    pub force_overwrites: bool,
}

pub struct Downloader {
    runner: Runner,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self { runner: Runner::new() }
    }

    /// Calls `yt-dlp --no-playlist --skip-download --print %(id)s <url>` and
    /// takes the last non-empty stdout line.
    pub async fn resolve_id(&self, url: &str) -> Result<String> {
        let out = self
            .runner
            .capture(
                "yt-dlp",
                &["--no-playlist", "--skip-download", "--print", "%(id)s", url],
            )
            .await
            .map_err(|e| AppError::DownloadFailed(e.to_string()))?;

        let id = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string);

        match id {
            Some(id) if out.success() => Ok(id),
            _ => Err(AppError::BadInput(format!(
                "could not resolve id for '{url}'"
            ))),
        }
    }

    /// Expands a playlist/channel URL into its constituent webpage URLs,
    /// deduplicated while preserving order. Falls back to `[url]` when
    /// nothing matches `^https?://`.
    pub async fn expand(&self, url: &str) -> Result<Vec<String>> {
        let out = self
            .runner
            .capture(
                "yt-dlp",
                &[
                    "--yes-playlist",
                    "--flat-playlist",
                    "--print",
                    "%(webpage_url)s",
                    url,
                ],
            )
            .await
            .map_err(|e| AppError::DownloadFailed(e.to_string()))?;

        let re = webpage_url_re();
        let mut seen = std::collections::HashSet::new();
        let urls: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| re.is_match(l))
            .filter(|l| seen.insert(l.to_string()))
            .map(str::to_string)
            .collect();

        if urls.is_empty() {
            Ok(vec![url.to_string()])
        } else {
            Ok(urls)
        }
    }

    async fn probe_aria2c(&self) -> bool {
        match ARIA2C_STATE.load(Ordering::SeqCst) {
            1 => return true,
            2 => return false,
            _ => {}
        }
        let available = self
            .runner
            .capture("aria2c", &["--version"])
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        ARIA2C_STATE.store(if available { 1 } else { 2 }, Ordering::SeqCst);
        available
    }

    /// Builds the ordered fallback ladder of argument variants (§4.3).
    async fn ladder(&self, opts: &DownloadOptions) -> Vec<Vec<String>> {
        let mut rungs = Vec::new();

        let requested = opts
            .requested_format
            .clone()
            .unwrap_or_else(|| "bestaudio/best".to_string());
        rungs.push(vec!["-f".to_string(), requested]);

        rungs.push(vec![
            "-f".to_string(),
            "bestaudio[ext=opus]/bestaudio".to_string(),
        ]);
        rungs.push(vec![
            "-f".to_string(),
            "worstaudio[ext=opus]/worstaudio".to_string(),
        ]);

        if self.probe_aria2c().await {
            rungs.push(vec![
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "--downloader".to_string(),
                "aria2c".to_string(),
                "--downloader-args".to_string(),
                "aria2c:-x16 -s16 -k1M".to_string(),
            ]);
        }

        rungs.push(vec![
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "--downloader".to_string(),
            "ffmpeg".to_string(),
            "--downloader-args".to_string(),
            "ffmpeg_i:-reconnect 1 -reconnect_streamed 1 -reconnect_delay_max 5".to_string(),
        ]);

        rungs.push(vec!["-f".to_string(), "best".to_string()]);

        rungs
    }

    /// Attempts the fallback ladder in order; the first exit-0 attempt wins.
    pub async fn download(
        &self,
        url: &str,
        id: &str,
        output_dir: &Path,
        opts: &DownloadOptions,
    ) -> Result<DownloadResult> {
        tokio::fs::create_dir_all(output_dir).await?;
        let output_template = output_dir.join("%(id)s.%(ext)s");

        let mut last_err: Option<String> = None;
        for (rung_index, rung_args) in self.ladder(opts).await.into_iter().enumerate() {
            let mut args: Vec<String> = rung_args;
            for a in COMMON_ARGS {
                args.push((*a).to_string());
            }
            if opts.force_overwrites {
                args.push("--force-overwrites".to_string());
            }
            args.push("-o".to_string());
            args.push(output_template.to_string_lossy().into_owned());
            args.push(url.to_string());

            debug!(rung_index, "attempting download rung");
            let out = self
                .runner
                .stream("yt-dlp", &args)
                .await
                .map_err(|e| AppError::DownloadFailed(e.to_string()))?;

            if interrupt_re().is_match(&out.combined_tail()) {
                return Err(AppError::Interrupted);
            }

            if out.success() {
                info!(rung_index, "download succeeded");
                return self.validate(id, output_dir).await;
            }
            last_err = Some(out.stderr_tail);
        }

        Err(AppError::DownloadFailed(format!(
            "all fallback rungs exhausted: {}",
            last_err.unwrap_or_default()
        )))
    }

    async fn validate(&self, id: &str, output_dir: &Path) -> Result<DownloadResult> {
        let info_path = output_dir.join(format!("{id}.info.json"));
        let info_text = tokio::fs::read_to_string(&info_path)
            .await
            .map_err(|e| AppError::IncompleteDownload(format!("missing info.json: {e}")))?;
        let raw: Json = serde_json::from_str(&info_text)
            .map_err(|e| AppError::IncompleteDownload(format!("invalid info.json: {e}")))?;
        let info: InfoJson = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::IncompleteDownload(format!("invalid info.json: {e}")))?;

        if info.id.trim().is_empty() {
            return Err(AppError::IncompleteDownload("empty id in info.json".into()));
        }

        let ext = info.ext.clone().unwrap_or_else(|| "webm".to_string());
        let media_path = output_dir.join(format!("{id}.{ext}"));

        let metadata = tokio::fs::metadata(&media_path)
            .await
            .map_err(|_| AppError::IncompleteDownload(format!("missing media file {}", media_path.display())))?;

        let declared_size = info.filesize.or(info.filesize_approx);
        if let Some(declared) = declared_size {
            if declared > 0.0 && (metadata.len() as f64) < declared * 0.95 {
                return Err(AppError::IncompleteDownload(format!(
                    "file size {} below 95% of declared {}",
                    metadata.len(),
                    declared
                )));
            }
        }

        if let Some(declared_duration) = info.duration {
            if let Ok(actual) = self.ffprobe_duration(&media_path).await {
                if actual < declared_duration * 0.95 {
                    return Err(AppError::IncompleteDownload(format!(
                        "duration {actual} below 95% of declared {declared_duration}"
                    )));
                }
            } else {
                warn!("ffprobe duration check failed; treating as unknown, not fatal");
            }
        }

        let chapters = info
            .chapters
            .as_ref()
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        let start = c.get("start_time")?.as_f64()?;
                        let end = c.get("end_time").and_then(Json::as_f64);
                        let title = c
                            .get("title")
                            .and_then(Json::as_str)
                            .filter(|t| !t.trim().is_empty())
                            .unwrap_or("Chapter")
                            .to_string();
                        Some((
                            (start * 1000.0).round() as i64,
                            end.map(|e| (e * 1000.0).round() as i64),
                            title,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(DownloadResult {
            id: info.id,
            media_path,
            info_json_path: info_path,
            title: info.title,
            description: info.description,
            uploader: info.uploader,
            channel_id: info.channel_id,
            upload_timestamp: info.upload_date,
            duration_ms: info.duration.map(|d| (d * 1000.0).round() as i64),
            raw_metadata: raw,
            chapters,
        })
    }

    async fn ffprobe_duration(&self, path: &Path) -> anyhow::Result<f64> {
        let out = self
            .runner
            .capture(
                "ffprobe",
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    &path.to_string_lossy(),
                ],
            )
            .await?;
        if !out.success() {
            anyhow::bail!("ffprobe exited non-zero");
        }
        out.stdout.trim().parse::<f64>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_regex_matches_case_insensitively() {
        assert!(interrupt_re().is_match("ERROR: Interrupted by user"));
        assert!(interrupt_re().is_match("KeyboardInterrupt"));
        assert!(!interrupt_re().is_match("download complete"));
    }

    #[test]
    fn webpage_url_regex_filters_non_urls() {
        let re = webpage_url_re();
        assert!(re.is_match("https://example.com/watch?v=1"));
        assert!(re.is_match("http://example.com/x"));
        assert!(!re.is_match("not a url"));
    }

    #[tokio::test]
    async fn ladder_includes_aria2c_rung_only_when_probed_available() {
        reset_aria2c_probe_for_tests();
        let d = Downloader::new();
        let rungs = d.ladder(&DownloadOptions::default()).await;
        // `aria2c` is unlikely to be on the test host; the ladder must still
        // produce at least the baseline rungs.
        assert!(rungs.len() >= 4);
    }
}
