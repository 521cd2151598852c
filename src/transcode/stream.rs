//! Per-quality segment production engine.
//!
//! Each stream owns at most one live encoder. A segment request is served
//! from disk when the chunk is done, parks on the chunk when it is being
//! produced, rides the running encoder when the request lands just ahead of
//! it, and otherwise replaces the encoder with one seeked to the requested
//! position. A background loop prunes chunks behind the window and tears the
//! encoder down when nobody has asked for anything in a while.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::probe::MediaProbe;
use crate::transcode::args::EncoderSpec;
use crate::transcode::chunk::Chunk;
use crate::transcode::encoder::Encoder;
use crate::transcode::ladder::Rung;
use crate::transcode::store::SegmentStore;
use crate::transcode::{ServeError, COMPATIBLE_CODEC, QUALITY_MAX};

/// Interval of the maintenance loop; idle thresholds are expressed in ticks
/// of this length.
const TICK: Duration = Duration::from_secs(5);

/// Hard ceiling on the look-ahead window however demanding the source is.
const GOAL_CAP: u32 = 25;

/// Facts shared by every stream of one source.
#[derive(Debug)]
pub struct StreamContext {
    pub cfg: Arc<Config>,
    pub source_id: String,
    pub source_path: PathBuf,
    pub probe: MediaProbe,
    pub store: Arc<SegmentStore>,
    /// `ceil(duration / chunk_duration)`; ids at or past this are out of
    /// range.
    pub num_chunks: u32,
}

/// Everything guarded by the stream lock.
#[derive(Default)]
struct StreamState {
    chunks: HashMap<u32, Chunk>,
    goal: u32,
    encoder: Option<Arc<Encoder>>,
    /// Maintenance ticks since the last request.
    inactive: u32,
}

/// What full-video playback should read from.
pub enum FullVideoSource {
    /// The source file itself is compatible; serve it directly.
    Passthrough(PathBuf),
    /// Live remux/transcode; read the encoder's stdout until either side
    /// closes.
    Pipe(tokio::process::ChildStdout),
}

pub struct Stream {
    ctx: Arc<StreamContext>,
    rung: Rung,
    label: String,
    state: Mutex<StreamState>,
    shutdown: CancellationToken,
}

impl Stream {
    pub fn new(ctx: Arc<StreamContext>, rung: Rung) -> Arc<Self> {
        let label = format!("{}-{}", ctx.source_id, rung.quality);
        Arc::new(Self {
            ctx,
            rung,
            label,
            state: Mutex::new(StreamState::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn quality(&self) -> &str {
        &self.rung.quality
    }

    pub fn rung(&self) -> &Rung {
        &self.rung
    }

    /// Maintenance loop: prune chunks behind the window and tear down the
    /// encoder after sustained inactivity. The stream itself survives
    /// teardown; the next request resurrects it.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; idle accounting starts one
        // full interval from now
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut state = self.state.lock().await;

                    let horizon = state
                        .goal
                        .saturating_sub(self.ctx.cfg.transcode.goal_buffer_max);
                    let stale: Vec<u32> = state
                        .chunks
                        .keys()
                        .filter(|id| **id < horizon)
                        .copied()
                        .collect();
                    for id in stale {
                        state.chunks.remove(&id);
                        self.ctx.store.remove_chunk(&self.rung.quality, id);
                    }

                    state.inactive += 1;
                    let idle_ticks =
                        self.ctx.cfg.transcode.stream_idle_secs / TICK.as_secs() as u32;
                    if state.inactive >= idle_ticks && state.encoder.is_some() {
                        tracing::info!("{}: idle, stopping stream", self.label);
                        self.clear_locked(&mut state).await;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    let mut state = self.state.lock().await;
                    self.clear_locked(&mut state).await;
                    return;
                }
            }
        }
    }

    /// Stop the maintenance loop and tear everything down. Idempotent and
    /// non-blocking.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Whether an encoder is currently alive (running or paused).
    pub async fn has_live_encoder(&self) -> bool {
        self.state.lock().await.encoder.is_some()
    }

    /// Serve one segment: the path of the produced file once it exists.
    pub async fn serve_chunk(self: &Arc<Self>, id: u32) -> Result<PathBuf, ServeError> {
        if id >= self.ctx.num_chunks {
            return Err(ServeError::ChunkOutOfRange(id));
        }

        let mut state = self.state.lock().await;
        state.inactive = 0;
        self.advance_goal(&mut state, id);

        if let Some(chunk) = state.chunks.get(&id) {
            if chunk.done {
                return Ok(self.ctx.store.chunk_path(&self.rung.quality, id));
            }
            // Being produced right now; park on it
            return self.wait_for_chunk(state, id).await;
        }

        // No chunk at id, but the encoder recently produced one just behind
        // it: it will get here soon enough
        let window_start = id.saturating_sub(self.ctx.cfg.transcode.look_behind);
        let near_hit = (window_start..id).any(|i| state.chunks.contains_key(&i));
        if near_hit && state.encoder.is_some() {
            state.chunks.insert(id, Chunk::new(id));
            return self.wait_for_chunk(state, id).await;
        }

        // Cold miss: replace the encoder with one starting at the request
        self.restart_at(&mut state, id).await?;
        self.wait_for_chunk(state, id).await
    }

    /// Park on a pending chunk until it completes, the encoder is replaced,
    /// or the deadline passes. The lock is released for the duration of the
    /// wait; the encoder observed before releasing identifies the epoch.
    async fn wait_for_chunk(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, StreamState>,
        id: u32,
    ) -> Result<PathBuf, ServeError> {
        let rx = match state.chunks.get_mut(&id) {
            Some(chunk) => chunk.subscribe(),
            None => return Err(ServeError::WaitTimeout(id)),
        };
        let epoch = state.encoder.clone();
        drop(state);

        let _ = tokio::time::timeout(self.ctx.cfg.transcode.wait_timeout(), rx).await;

        let state = self.state.lock().await;
        if let Some(chunk) = state.chunks.get(&id) {
            if chunk.done {
                return Ok(self.ctx.store.chunk_path(&self.rung.quality, id));
            }
        }
        if !same_epoch(&epoch, &state.encoder) {
            return Err(ServeError::EncoderReplaced);
        }
        Err(ServeError::WaitTimeout(id))
    }

    /// Kill the current encoder, drop the chunk table, and start a fresh
    /// encoder positioned at the requested id.
    async fn restart_at(
        self: &Arc<Self>,
        state: &mut StreamState,
        id: u32,
    ) -> Result<(), ServeError> {
        self.clear_locked(state).await;

        state.chunks.insert(id, Chunk::new(id));
        let (_, goal_max) = self.goal_window();
        state.goal = id + goal_max;
        self.start_encoder(state, id)
    }

    /// Kill and reap the encoder, wake every parked request, and remove all
    /// chunks and their files. Callers hold the lock, so no replacement can
    /// appear until this returns.
    async fn clear_locked(&self, state: &mut StreamState) {
        if let Some(encoder) = state.encoder.take() {
            tracing::info!("{}: stopping encoder", self.label);
            encoder.kill().await;
        }

        for (id, mut chunk) in state.chunks.drain() {
            self.ctx.store.remove_chunk(&self.rung.quality, id);
            // Woken requests observe the epoch change and report a conflict
            chunk.wake_all();
        }
        state.goal = 0;
    }

    fn start_encoder(self: &Arc<Self>, state: &mut StreamState, id: u32) -> Result<(), ServeError> {
        // Start one chunk early so the first keyframe lands on a chunk
        // boundary; ids stay aligned because -start_number moves with the
        // seek
        let start_id = id.saturating_sub(1);
        let start_at = (start_id * self.ctx.cfg.transcode.chunk_duration_secs) as f64;

        let fmp4 = self.ctx.cfg.hls.fmp4;
        let spec = self.encoder_spec();
        let pattern = self
            .ctx
            .store
            .segment_pattern(&self.rung.quality, self.ctx.cfg.hls.segment_ext());

        let mut argv = spec.transcode_args(start_at, true);
        argv.extend(spec.hls_args(start_id, &pattern, fmp4));

        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let encoder = Encoder::spawn(
            &self.ctx.cfg.transcode.ffmpeg,
            &argv,
            start_id,
            &self.rung.quality,
            self.label.clone(),
            announce_tx,
        )?;

        state.encoder = Some(encoder.clone());
        tokio::spawn(Arc::clone(self).observe_encoder(encoder, announce_rx));
        Ok(())
    }

    /// Consume one encoder epoch: apply its announcements, then its exit.
    async fn observe_encoder(
        self: Arc<Self>,
        encoder: Arc<Encoder>,
        mut announce_rx: mpsc::UnboundedReceiver<u32>,
    ) {
        while let Some(id) = announce_rx.recv().await {
            self.on_segment_ready(&encoder, id).await;
        }
        // Stdout closed: the process is gone or going; wait for the reap
        let code = encoder.wait_exited().await;
        self.on_encoder_exit(&encoder, code).await;
    }

    async fn on_segment_ready(&self, encoder: &Arc<Encoder>, id: u32) {
        let mut state = self.state.lock().await;
        if !same_epoch(&Some(encoder.clone()), &state.encoder) {
            // Announcement from a replaced encoder; its files are gone
            return;
        }

        let goal = state.goal;
        let chunk = state.chunks.entry(id).or_insert_with(|| Chunk::new(id));
        if chunk.done {
            return;
        }
        chunk.complete();

        if id >= goal {
            tracing::debug!("{}: goal satisfied at {}", self.label, id);
            encoder.pause();
        }
    }

    async fn on_encoder_exit(&self, encoder: &Arc<Encoder>, code: i32) {
        let mut state = self.state.lock().await;
        if !same_epoch(&Some(encoder.clone()), &state.encoder) {
            // Replaced (or cleared) under the lock before the exit was
            // observed; the restart already woke everyone
            return;
        }

        state.encoder = None;
        if code != 0 {
            tracing::warn!("{}: encoder exited with status {}", self.label, code);
            // Drop unproduced placeholders so the next request restarts
            // instead of idling against a dead epoch; finished chunks stay
            // serveable
            let pending: Vec<u32> = state
                .chunks
                .iter()
                .filter(|(_, chunk)| !chunk.done)
                .map(|(id, _)| *id)
                .collect();
            for id in pending {
                if let Some(mut chunk) = state.chunks.remove(&id) {
                    chunk.wake_all();
                }
            }
        } else {
            tracing::debug!("{}: encoder finished", self.label);
        }
    }

    /// Advance the look-ahead window when the playhead gets close to it and
    /// wake the encoder if it paused at the old goal.
    fn advance_goal(&self, state: &mut StreamState, id: u32) {
        let (goal_min, goal_max) = self.goal_window();
        if id + goal_min > state.goal {
            state.goal = id + goal_max;
            if let Some(encoder) = &state.encoder {
                tracing::debug!("{}: resuming encoder, goal {}", self.label, state.goal);
                encoder.resume();
            }
        }
    }

    /// Effective goal window, widened for demanding sources and capped to
    /// bound disk use.
    fn goal_window(&self) -> (u32, u32) {
        let cfg = &self.ctx.cfg.transcode;
        let mut goal_min = cfg.goal_buffer_min as f64;
        let mut goal_max = cfg.goal_buffer_max as f64;

        if self.ctx.probe.bit_rate > 50_000_000 {
            goal_min *= 1.5;
            goal_max *= 1.8;
        }
        if self.ctx.probe.frame_rate >= 50 {
            goal_min *= 1.4;
            goal_max *= 1.6;
        }

        let goal_max = (goal_max.round() as u32).min(GOAL_CAP);
        let goal_min = (goal_min.round() as u32).min(goal_max / 2).max(1);
        (goal_min, goal_max)
    }

    /// Full-video playback, independent of the chunk machinery.
    pub fn full_video(&self) -> Result<FullVideoSource, ServeError> {
        if self.ctx.probe.codec_name == COMPATIBLE_CODEC && self.rung.quality == QUALITY_MAX {
            return Ok(FullVideoSource::Passthrough(self.ctx.source_path.clone()));
        }

        let spec = self.encoder_spec();
        let mut argv = spec.transcode_args(0.0, false);
        argv.extend(spec.full_video_args());

        tracing::debug!(
            "{}: {} {}",
            self.label,
            self.ctx.cfg.transcode.ffmpeg,
            argv.join(" ")
        );

        let mut child = Command::new(&self.ctx.cfg.transcode.ffmpeg)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ServeError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServeError::Spawn(std::io::Error::other("no encoder stdout")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(crate::transcode::encoder::forward_stderr(
                stderr,
                self.label.clone(),
            ));
        }

        // When the client goes away the body stream is dropped, the pipe
        // breaks, and the encoder exits on its own; this task only reaps it
        let label = self.label.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!("{}: full-video encoder exited: {}", label, status),
                Err(e) => tracing::warn!("{}: full-video encoder reap failed: {}", label, e),
            }
        });

        Ok(FullVideoSource::Pipe(stdout))
    }

    fn encoder_spec(&self) -> EncoderSpec<'_> {
        EncoderSpec {
            cfg: &self.ctx.cfg.transcode,
            hw: &self.ctx.cfg.hwaccel,
            probe: &self.ctx.probe,
            source: &self.ctx.source_path,
            quality: &self.rung.quality,
            width: self.rung.width,
            height: self.rung.height,
            bitrate: self.rung.bitrate,
        }
    }
}

fn same_epoch(a: &Option<Arc<Encoder>>, b: &Option<Arc<Encoder>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::ladder::build_ladder;

    fn context(bit_rate: u64, frame_rate: u32) -> Arc<StreamContext> {
        let cfg = Arc::new(Config::default());
        let probe = MediaProbe {
            width: 1920,
            height: 1080,
            duration: Duration::from_secs(90),
            frame_rate,
            codec_name: "h264".to_string(),
            bit_rate,
            rotation: 0,
        };
        let store = Arc::new(SegmentStore::new(
            &cfg.transcode.temp_dir,
            "test",
            std::path::Path::new("/videos/test.mp4"),
        ));
        Arc::new(StreamContext {
            cfg,
            source_id: "test".to_string(),
            source_path: PathBuf::from("/videos/test.mp4"),
            probe,
            store,
            num_chunks: 30,
        })
    }

    fn stream(ctx: Arc<StreamContext>) -> Arc<Stream> {
        let rung = build_ladder(&ctx.probe)
            .into_iter()
            .find(|r| r.quality == "720p")
            .unwrap();
        Stream::new(ctx, rung)
    }

    #[test]
    fn test_goal_window_defaults() {
        let s = stream(context(8_000_000, 30));
        assert_eq!(s.goal_window(), (3, 12));
    }

    #[test]
    fn test_goal_window_scales_for_heavy_sources() {
        // >50 Mbps widens the window
        let s = stream(context(60_000_000, 30));
        assert_eq!(s.goal_window(), (5, 22));
    }

    #[test]
    fn test_goal_window_cap() {
        // >50 Mbps and high frame rate together would blow past the cap
        let s = stream(context(60_000_000, 60));
        let (goal_min, goal_max) = s.goal_window();
        assert_eq!(goal_max, GOAL_CAP);
        assert!(goal_min <= goal_max / 2);
    }

    #[tokio::test]
    async fn test_out_of_range_id_rejected() {
        let s = stream(context(8_000_000, 30));
        // num_chunks is 30, so 30 is the first invalid id
        assert!(matches!(
            s.serve_chunk(30).await,
            Err(ServeError::ChunkOutOfRange(30))
        ));
        assert!(matches!(
            s.serve_chunk(1000).await,
            Err(ServeError::ChunkOutOfRange(1000))
        ));
    }

    #[test]
    fn test_same_epoch_none_vs_none() {
        assert!(same_epoch(&None, &None));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let s = stream(context(8_000_000, 30));
        s.stop();
        s.stop();
        assert!(s.shutdown.is_cancelled());
    }
}
