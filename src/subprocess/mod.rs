//! Spawns external CLIs with an explicit argv vector — never a shell — in either
//! a captured or a streamed mode (§4.2). Every suspend point here goes through
//! `tokio::process`/`tokio::io`, so a stuck child never blocks the runtime.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Bound on the rolling tail kept per stream in streamed mode (§4.2).
pub const MAX_TAIL_BYTES: usize = 64 * 1024;

/// Output of a [Runner::capture] call.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output of a [Runner::stream] call: the bounded tail of each stream, not the
/// full transcript (§4.2).
#[derive(Debug, Clone)]
pub struct StreamedOutput {
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub exit_code: i32,
}

impl StreamedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined tail, used by callers that grep both streams for a marker
    /// (e.g. the downloader's interrupt detection).
    pub fn combined_tail(&self) -> String {
        format!("{}\n{}", self.stdout_tail, self.stderr_tail)
    }
}

/// A bounded ring of UTF-8 text: keeps only the last `cap` bytes, dropping the
/// oldest content as new content arrives. Used to cap streamed-mode memory use
/// without losing the error message that usually lands at the very end.
#[derive(Default)]
struct RollingTail {
    buf: String,
    cap: usize,
}

impl RollingTail {
    fn new(cap: usize) -> Self {
        Self { buf: String::new(), cap }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let drop_to = self.buf.len() - self.cap;
            // Find the nearest char boundary at or after drop_to so we never
            // split a multi-byte UTF-8 sequence.
            let mut start = drop_to;
            while start < self.buf.len() && !self.buf.is_char_boundary(start) {
                start += 1;
            }
            self.buf.drain(..start);
        }
    }

    fn into_string(self) -> String {
        self.buf
    }
}

async fn pump_lines<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    mut forward: impl FnMut(&str) + Send + 'static,
) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = RollingTail::new(MAX_TAIL_BYTES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                forward(&line);
                tail.push_line(&line);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    tail.into_string()
}

/// Spawns commands with an optional working directory and environment overlay
/// merged over the inherited process environment.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    cwd: Option<std::path::PathBuf>,
    env: HashMap<String, String>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build(&self, program: &str, args: &[impl AsRef<std::ffi::OsStr>]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Captured mode: read stdout/stderr to completion, return the full text.
    pub async fn capture(
        &self,
        program: &str,
        args: &[impl AsRef<std::ffi::OsStr>],
    ) -> Result<CapturedOutput> {
        debug!(program, "spawning (captured)");
        let output = self
            .build(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to spawn '{program}'"))?;

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Streamed mode: forward each line of stdout/stderr to the host's own
    /// standard streams as it arrives, while keeping a bounded rolling tail of
    /// each (§4.2). Used for long-running, progress-emitting children like
    /// `yt-dlp` and `whisperx`.
    pub async fn stream(
        &self,
        program: &str,
        args: &[impl AsRef<std::ffi::OsStr>],
    ) -> Result<StreamedOutput> {
        debug!(program, "spawning (streamed)");
        let mut child = self
            .build(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{program}'"))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stdout_task = tokio::spawn(pump_lines(stdout, |line| println!("{line}")));
        let stderr_task = tokio::spawn(pump_lines(stderr, |line| eprintln!("{line}")));

        let status = child.wait().await.context("child process wait failed")?;
        let stdout_tail = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        Ok(StreamedOutput {
            stdout_tail,
            stderr_tail,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_reports_exit_code_and_stdout() {
        let runner = Runner::new();
        let out = runner.capture("echo", &["hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn capture_reports_nonzero_exit() {
        let runner = Runner::new();
        let out = runner.capture("false", &[] as &[&str]).await.unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn stream_keeps_bounded_tail() {
        let runner = Runner::new();
        // `yes` would run forever; use a small bounded producer instead.
        let out = runner
            .stream("sh", &["-c", "for i in $(seq 1 5); do echo line$i; done"])
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout_tail.contains("line5"));
    }

    #[tokio::test]
    async fn env_overlay_is_visible_to_child() {
        let runner = Runner::new().with_env("TRANSCRIPTOR_TEST_VAR", "present");
        let out = runner
            .capture("sh", &["-c", "echo $TRANSCRIPTOR_TEST_VAR"])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "present");
    }

    #[test]
    fn rolling_tail_drops_oldest_bytes_past_cap() {
        let mut tail = RollingTail::new(16);
        for i in 0..10 {
            tail.push_line(&format!("x{i}"));
        }
        let s = tail.into_string();
        assert!(s.len() <= 16 + "x9\n".len());
        assert!(s.contains("x9"));
    }
}
