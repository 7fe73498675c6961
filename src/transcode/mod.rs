//! Normalizes any media file to 16 kHz mono 16-bit PCM WAV via `ffmpeg` (§4.4).

use std::path::Path;

use tracing::debug;

use crate::error::{AppError, Result};
use crate::subprocess::Runner;

pub struct Transcoder {
    runner: Runner,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self { runner: Runner::new() }
    }

    /// `ffmpeg -y -hide_banner -loglevel error -i IN -vn -ar 16000 -ac 1 -c:a pcm_s16le OUT`
    pub async fn transcode(&self, input: &Path, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(input = %input.display(), output = %output.display(), "transcoding to wav");

        let out = self
            .runner
            .capture(
                "ffmpeg",
                &[
                    "-y",
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-i",
                    &input.to_string_lossy(),
                    "-vn",
                    "-ar",
                    "16000",
                    "-ac",
                    "1",
                    "-c:a",
                    "pcm_s16le",
                    &output.to_string_lossy(),
                ],
            )
            .await
            .map_err(|e| AppError::TranscodeFailed(e.to_string()))?;

        if !out.success() {
            return Err(AppError::TranscodeFailed(out.stderr.trim().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn transcode_failure_surfaces_stderr_tail() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("missing.mp4");
        let output = dir.path().join("out.wav");
        let transcoder = Transcoder::new();
        let result = transcoder.transcode(&input, &output).await;
        assert!(matches!(result, Err(AppError::TranscodeFailed(_))));
    }
}
