//! The segment production engine.
//!
//! A [`manager::SourceManager`] owns one [`stream::Stream`] per quality rung
//! of a source file. Each stream lazily launches an FFmpeg process near the
//! requested playhead, tracks produced segments in a chunk table, pauses the
//! encoder once it is far enough ahead, and restarts it when a request lands
//! outside the window it is producing.

pub mod args;
pub mod chunk;
pub mod encoder;
pub mod ladder;
pub mod manager;
pub mod store;
pub mod stream;

pub use manager::SourceManager;
pub use stream::{FullVideoSource, Stream};

/// The passthrough rung: source dimensions, no scaling.
pub const QUALITY_MAX: &str = "max";

/// Sources already in this codec are served as-is for full-video playback.
pub const COMPATIBLE_CODEC: &str = "h264";

/// Errors crossing from the engine to the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The encoder the request was waiting on was replaced; the client
    /// should retry.
    #[error("encoder was replaced while waiting")]
    EncoderReplaced,

    /// The wait deadline elapsed before the segment was produced.
    #[error("timed out waiting for segment {0}")]
    WaitTimeout(u32),

    /// The requested quality is not part of this source's ladder.
    #[error("unknown quality: {0}")]
    UnknownQuality(String),

    /// The requested segment lies beyond the end of the source.
    #[error("segment {0} is out of range")]
    ChunkOutOfRange(u32),

    /// The request filename does not follow the segment naming scheme.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The encoder binary could not be launched.
    #[error("failed to launch encoder: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading a produced segment from disk failed.
    #[error("segment store error: {0}")]
    Store(#[from] std::io::Error),
}
