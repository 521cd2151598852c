//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which writes stub `ffmpeg`/`ffprobe` executables
//! and a fake source file into a tempdir, so the full engine (process spawn,
//! stdout announcements, pause/resume signals, kill-and-reap) runs without
//! real tools. The [`with_server`] constructor additionally starts Axum on a
//! random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use vodforge::config::{Config, TranscodeConfig};
use vodforge::server::{create_router, AppContext};
use vodforge::state::ManagerRegistry;
use vodforge::transcode::SourceManager;

/// Default encoder stub: behaves like ffmpeg's HLS muxer from the engine's
/// point of view. It reads `-hls_segment_filename` and `-start_number` from
/// its argv, then writes segment files and announces each on stdout. Without
/// a segment pattern it acts as the one-shot full-video encoder and pipes
/// fake MP4 data to stdout. SIGSTOP/SIGCONT pause and resume it for real.
pub const ENCODER_DEFAULT: &str = r#"#!/bin/sh
pattern=""
start=0
prev=""
for a in "$@"; do
  case "$prev" in
    -hls_segment_filename) pattern="$a" ;;
    -start_number) start="$a" ;;
  esac
  prev="$a"
done
if [ -z "$pattern" ]; then
  printf 'FAKEMP4DATA'
  exit 0
fi
sleep 0.3
i=$start
end=$((start + 40))
while [ "$i" -lt "$end" ]; do
  f=$(printf "$pattern" "$i")
  printf 'seg-%06d' "$i" > "$f"
  printf '%s\n' "$f"
  i=$((i + 1))
  sleep 0.15
done
"#;

/// Takes over a second before the first segment appears; long enough for a
/// test to get a waiter parked on the first epoch before replacing it.
pub const ENCODER_SLOW_START: &str = r#"#!/bin/sh
pattern=""
start=0
prev=""
for a in "$@"; do
  case "$prev" in
    -hls_segment_filename) pattern="$a" ;;
    -start_number) start="$a" ;;
  esac
  prev="$a"
done
[ -z "$pattern" ] && exit 1
sleep 1.2
i=$start
end=$((start + 40))
while [ "$i" -lt "$end" ]; do
  f=$(printf "$pattern" "$i")
  printf 'seg-%06d' "$i" > "$f"
  printf '%s\n' "$f"
  i=$((i + 1))
  sleep 0.15
done
"#;

/// Produces exactly one segment, then dies with a transcoding error.
pub const ENCODER_CRASH_AFTER_ONE: &str = r#"#!/bin/sh
pattern=""
start=0
prev=""
for a in "$@"; do
  case "$prev" in
    -hls_segment_filename) pattern="$a" ;;
    -start_number) start="$a" ;;
  esac
  prev="$a"
done
[ -z "$pattern" ] && exit 1
sleep 0.2
f=$(printf "$pattern" "$start")
printf 'seg-%06d' "$start" > "$f"
printf '%s\n' "$f"
sleep 0.2
exit 1
"#;

/// Never announces anything; requests against it ride out their deadline.
pub const ENCODER_SILENT: &str = r#"#!/bin/sh
sleep 30
"#;

/// Fixed probe answer: 90s of 1080p H.264 at 8 Mbps, which yields a ladder
/// of 480p, 720p and max at 30 chunks of 3 seconds.
const FFPROBE_STUB: &str = r#"#!/bin/sh
cat <<'EOF'
{
  "streams": [
    {
      "width": 1920,
      "height": 1080,
      "duration": "90.000000",
      "avg_frame_rate": "30/1",
      "codec_name": "h264",
      "bit_rate": "8000000"
    }
  ],
  "format": {"duration": "90.000000"}
}
EOF
"#;

pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub config: Arc<Config>,
}

impl TestHarness {
    /// Harness with the default well-behaved encoder stub.
    pub fn new() -> Self {
        Self::with_transcode(|_| {})
    }

    /// Harness with tweaked engine knobs (timeouts, idle thresholds).
    pub fn with_transcode(tweak: impl FnOnce(&mut TranscodeConfig)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");

        let ffmpeg = dir.path().join("ffmpeg");
        let ffprobe = dir.path().join("ffprobe");
        write_executable(&ffmpeg, ENCODER_DEFAULT);
        write_executable(&ffprobe, FFPROBE_STUB);

        // A fake source; only full-video passthrough reads its bytes
        let source = dir.path().join("movie.mp4");
        let payload: Vec<u8> = (0..=255u8).cycle().take(2048).collect();
        std::fs::write(&source, payload).expect("failed to write source file");

        let mut config = Config::default();
        config.transcode.ffmpeg = ffmpeg.to_string_lossy().into_owned();
        config.transcode.ffprobe = ffprobe.to_string_lossy().into_owned();
        config.transcode.temp_dir = dir.path().join("segments");
        config.transcode.wait_timeout_secs = 10;
        tweak(&mut config.transcode);

        Self {
            dir,
            config: Arc::new(config),
        }
    }

    /// Replace the encoder stub; takes effect at the next spawn.
    pub fn install_encoder_stub(&self, script: &str) {
        write_executable(&self.dir.path().join("ffmpeg"), script);
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.path().join("movie.mp4")
    }

    /// Build a supervisor for the fake source, bypassing HTTP.
    pub async fn manager(&self) -> (Arc<SourceManager>, mpsc::Receiver<String>) {
        let (close_tx, close_rx) = mpsc::channel(4);
        let manager = SourceManager::new(
            self.config.clone(),
            self.source_path(),
            "testsrc".to_string(),
            close_tx,
        )
        .await
        .expect("failed to create manager");
        (manager, close_rx)
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        let harness = Self::new();
        let registry = ManagerRegistry::new(harness.config.clone());
        let ctx = AppContext {
            config: harness.config.clone(),
            registry,
        };
        let app = create_router(ctx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }

    /// URL of a file under /vod for the harness source.
    pub fn vod_url(&self, addr: SocketAddr, file: &str) -> String {
        format!(
            "http://{}/vod{}/{}",
            addr,
            self.source_path().display(),
            file
        )
    }
}

fn write_executable(path: &std::path::Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;

    // Replace the inode rather than rewriting in place, in case a previous
    // process still has the old script open
    let _ = std::fs::remove_file(path);
    std::fs::write(path, content).expect("failed to write stub");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod stub");
}
