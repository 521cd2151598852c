//! Encoder process wrapper.
//!
//! Owns one launched FFmpeg child: a stdout worker scans for segment
//! filename announcements, a stderr worker forwards diagnostics to the log,
//! and a supervise worker reaps the process and records its exit. Pause and
//! resume are delivered as job-control signals; kill is a one-shot message to
//! the supervise worker followed by waiting for the reap, which makes it both
//! synchronous and idempotent.

use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::transcode::ServeError;

/// Exit code recorded when the process was ended by a signal.
pub const EXIT_SIGNALED: i32 = -1;

pub struct Encoder {
    /// Chunk id of the first segment this encoder emits.
    pub start_id: u32,
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl Encoder {
    /// Launch the encoder and its three workers. Segment ids parsed from
    /// stdout are delivered on `announce_tx`, deduplicated, in announcement
    /// order; the channel closes when stdout does.
    pub fn spawn(
        ffmpeg: &str,
        args: &[String],
        start_id: u32,
        quality: &str,
        label: String,
        announce_tx: mpsc::UnboundedSender<u32>,
    ) -> Result<Arc<Self>, ServeError> {
        tracing::debug!("{}: {} {}", label, ffmpeg, args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ServeError::Spawn)?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let encoder = Arc::new(Self {
            start_id,
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        });

        if let Some(stdout) = stdout {
            tokio::spawn(scan_stdout(
                stdout,
                quality.to_string(),
                label.clone(),
                announce_tx,
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, label.clone()));
        }

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(EXIT_SIGNALED),
                Err(e) => {
                    tracing::error!("{}: failed to reap encoder: {}", label, e);
                    EXIT_SIGNALED
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(encoder)
    }

    /// Ask the encoder to stop producing. A hint only; on platforms without
    /// job-control signals this is a no-op and correctness relies on
    /// kill-then-reap alone.
    #[cfg(unix)]
    pub fn pause(&self) {
        self.signal(libc::SIGSTOP);
    }

    /// Wake a paused encoder. Resuming a running process is harmless.
    #[cfg(unix)]
    pub fn resume(&self) {
        self.signal(libc::SIGCONT);
    }

    #[cfg(not(unix))]
    pub fn pause(&self) {}

    #[cfg(not(unix))]
    pub fn resume(&self) {}

    #[cfg(unix)]
    fn signal(&self, sig: i32) {
        if self.exit_rx.borrow().is_some() {
            return;
        }
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }

    /// Terminate the process and wait until it is reaped. Idempotent; once
    /// this returns no further announcements will be delivered for this
    /// epoch.
    pub async fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
        self.wait_exited().await;
    }

    /// Wait for process exit and return its code (`EXIT_SIGNALED` when ended
    /// by a signal).
    pub async fn wait_exited(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                // The supervise worker never drops its sender before
                // publishing, but don't spin if it somehow did
                return EXIT_SIGNALED;
            }
        }
    }
}

async fn scan_stdout(
    stdout: ChildStdout,
    quality: String,
    label: String,
    announce_tx: mpsc::UnboundedSender<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut seen = std::collections::HashSet::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(id) = parse_segment_id(&line, &quality) else {
                    continue;
                };
                if !seen.insert(id) {
                    continue;
                }
                tracing::debug!("{}: recv {}", label, line);
                if announce_tx.send(id).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("{}: encoder stdout read failed: {}", label, e);
                return;
            }
        }
    }
}

pub(crate) async fn forward_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("{}: ffmpeg: {}", label, line);
    }
}

/// Extract a chunk id from an encoder stdout line.
///
/// The only contract with the encoder is that the line contains the segment
/// filename, `<quality>-<6 digits>.<ts|mp4>`; everything around it (paths,
/// playlist syntax) is ignored.
pub fn parse_segment_id(line: &str, quality: &str) -> Option<u32> {
    let needle = format!("{}-", quality);
    let start = line.rfind(&needle)? + needle.len();
    let digits = line.get(start..start + 6)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = &line[start + 6..];
    if !(rest.starts_with(".ts") || rest.starts_with(".mp4")) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_id_plain() {
        assert_eq!(parse_segment_id("720p-000003.ts", "720p"), Some(3));
        assert_eq!(parse_segment_id("max-000120.mp4", "max"), Some(120));
    }

    #[test]
    fn test_parse_segment_id_with_path() {
        assert_eq!(
            parse_segment_id("/tmp/vodforge/abc-12345678/720p-000042.ts", "720p"),
            Some(42)
        );
    }

    #[test]
    fn test_parse_segment_id_rejects_noise() {
        assert_eq!(parse_segment_id("frame=100 fps=30", "720p"), None);
        assert_eq!(parse_segment_id("720p-00001.ts", "720p"), None);
        assert_eq!(parse_segment_id("720p-abc123.ts", "720p"), None);
        assert_eq!(parse_segment_id("720p-000001.m3u8", "720p"), None);
        // Wrong quality does not match
        assert_eq!(parse_segment_id("480p-000001.ts", "720p"), None);
    }

    #[test]
    fn test_parse_segment_id_uses_last_occurrence() {
        // A path component that itself contains the quality label
        assert_eq!(
            parse_segment_id("/data/720p-videos/720p-000007.ts", "720p"),
            Some(7)
        );
    }
}
