//! Per-source stream supervisor.
//!
//! Owns one [`Stream`] per quality rung of a source file, the segment store
//! they share, and an idle loop that destroys the whole collection once no
//! stream has had a live encoder for a while.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::playlist;
use crate::probe::{self, MediaProbe};
use crate::transcode::ladder::build_ladder;
use crate::transcode::store::SegmentStore;
use crate::transcode::stream::{FullVideoSource, Stream, StreamContext};
use crate::transcode::{ServeError, QUALITY_MAX};

/// Interval of the idle loop.
const TICK: Duration = Duration::from_secs(5);

pub struct SourceManager {
    id: String,
    cfg: Arc<Config>,
    probe: MediaProbe,
    store: Arc<SegmentStore>,
    streams: HashMap<String, Arc<Stream>>,
    close_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl SourceManager {
    /// Probe the source, derive its ladder, recreate the segment directory
    /// and start every stream's maintenance loop. `close_tx` receives the
    /// source id when the supervisor destroys itself through inactivity.
    pub async fn new(
        cfg: Arc<Config>,
        path: PathBuf,
        id: String,
        close_tx: mpsc::Sender<String>,
    ) -> anyhow::Result<Arc<Self>> {
        use anyhow::Context;

        let store = Arc::new(SegmentStore::new(&cfg.transcode.temp_dir, &id, &path));
        store
            .create()
            .with_context(|| format!("Failed to create segment directory {:?}", store.dir()))?;

        let probe = probe::probe_file(&cfg.transcode.ffprobe, &path)
            .await
            .with_context(|| format!("Failed to probe {:?}", path))?;

        let chunk = cfg.transcode.chunk_duration_secs as f64;
        let num_chunks = (probe.duration.as_secs_f64() / chunk).ceil() as u32;

        let ctx = Arc::new(StreamContext {
            cfg: cfg.clone(),
            source_id: id.clone(),
            source_path: path.clone(),
            probe: probe.clone(),
            store: store.clone(),
            num_chunks,
        });

        let mut streams = HashMap::new();
        for rung in build_ladder(&probe) {
            let stream = Stream::new(ctx.clone(), rung);
            tokio::spawn(stream.clone().run());
            streams.insert(stream.quality().to_string(), stream);
        }

        tracing::info!(
            "{}: new supervisor for {:?} ({} chunks, {} qualities)",
            id,
            path,
            num_chunks,
            streams.len()
        );

        let manager = Arc::new(Self {
            id,
            cfg,
            probe,
            store,
            streams,
            close_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(manager.clone().idle_loop());

        Ok(manager)
    }

    /// Destroy the supervisor after every stream has been quiet long enough,
    /// then tell the registry to forget it.
    async fn idle_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; idle accounting starts one
        // full interval from now
        interval.tick().await;
        let idle_ticks = self.cfg.transcode.manager_idle_secs / TICK.as_secs() as u32;
        let mut inactive = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut any_live = false;
                    for stream in self.streams.values() {
                        if stream.has_live_encoder().await {
                            any_live = true;
                            break;
                        }
                    }

                    if any_live {
                        inactive = 0;
                        continue;
                    }

                    inactive += 1;
                    if inactive >= idle_ticks {
                        tracing::info!("{}: idle, destroying supervisor", self.id);
                        self.destroy();
                        let _ = self.close_tx.send(self.id.clone()).await;
                        return;
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Stop every stream and remove the segment directory. Does not emit on
    /// the close channel; callers decide whether the registry should forget
    /// this supervisor.
    pub fn destroy(&self) {
        tracing::info!("{}: destroying", self.id);
        self.shutdown.cancel();

        for stream in self.streams.values() {
            stream.stop();
        }

        self.store.destroy();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn probe(&self) -> &MediaProbe {
        &self.probe
    }

    /// Master playlist listing every rung.
    pub fn master_playlist(&self) -> String {
        let mut rungs: Vec<_> = self.streams.values().map(|s| s.rung().clone()).collect();
        rungs.sort_by(|a, b| a.order.cmp(&b.order).then(a.bitrate.cmp(&b.bitrate)));

        let variants: Vec<playlist::Variant> = rungs
            .into_iter()
            .map(|r| playlist::Variant {
                quality: r.quality,
                bandwidth: r.bitrate,
                width: r.width,
                height: r.height,
                frame_rate: self.probe.frame_rate,
            })
            .collect();

        playlist::render_master(&variants)
    }

    /// VOD media playlist for one quality, or None when the rung is unknown.
    pub fn media_playlist(&self, quality: &str) -> Option<String> {
        if !self.streams.contains_key(quality) {
            return None;
        }

        Some(playlist::render_media(
            quality,
            self.cfg.hls.segment_ext(),
            self.cfg.hls.playlist_version(),
            self.cfg.transcode.chunk_duration_secs,
            self.probe.duration.as_secs_f64(),
        ))
    }

    /// Delegate a segment request to the right stream.
    pub async fn serve_chunk(&self, quality: &str, id: u32) -> Result<PathBuf, ServeError> {
        let stream = self
            .streams
            .get(quality)
            .ok_or_else(|| ServeError::UnknownQuality(quality.to_string()))?;
        stream.serve_chunk(id).await
    }

    /// Delegate full-video playback, falling back to the passthrough rung
    /// for unknown qualities.
    pub fn serve_full_video(&self, quality: &str) -> Result<FullVideoSource, ServeError> {
        let stream = self
            .streams
            .get(quality)
            .or_else(|| self.streams.get(QUALITY_MAX))
            .ok_or_else(|| ServeError::UnknownQuality(quality.to_string()))?;
        stream.full_video()
    }
}
