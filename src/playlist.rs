//! HLS playlist emission.
//!
//! Renders the master playlist (one entry per quality rung) and the VOD media
//! playlists whose segment URIs the segment production engine serves.

use std::fmt::Write;

pub const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Fixed codec string advertised for every rung; the encoder always produces
/// H.264 video with AAC audio.
const CODECS: &str = "avc1.42E01E,mp4a.40.2";

/// One master-playlist entry.
#[derive(Debug, Clone)]
pub struct Variant {
    pub quality: String,
    /// Peak bandwidth in bits per second.
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Generate the master playlist. Variants must already be sorted.
pub fn render_master(variants: &[Variant]) -> String {
    let mut out = String::new();

    writeln!(out, "#EXTM3U").unwrap();

    for v in variants {
        // Average bandwidth is advertised slightly below peak so ABR clients
        // step up sooner
        let avg = (v.bandwidth as f64 * 0.85) as u64;
        writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{},FRAME-RATE={},CODECS=\"{}\"",
            v.bandwidth, avg, v.width, v.height, v.frame_rate, CODECS
        )
        .unwrap();
        writeln!(out, "{}.m3u8", v.quality).unwrap();
    }

    out
}

/// Generate a VOD media playlist for one quality.
///
/// The playlist names `ceil(duration / chunk)` segments; the final EXTINF
/// carries the remainder.
pub fn render_media(
    quality: &str,
    segment_ext: &str,
    version: u8,
    chunk_secs: u32,
    duration_secs: f64,
) -> String {
    let mut out = String::new();

    writeln!(out, "#EXTM3U").unwrap();
    writeln!(out, "#EXT-X-VERSION:{}", version).unwrap();
    if version >= 6 {
        writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS").unwrap();
    }
    writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0").unwrap();
    writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD").unwrap();
    writeln!(out, "#EXT-X-TARGETDURATION:{}", chunk_secs).unwrap();

    let mut remaining = duration_secs;
    let mut id = 0u32;
    while remaining > 0.0 {
        let size = remaining.min(chunk_secs as f64);
        writeln!(out, "#EXTINF:{:.3},", size).unwrap();
        writeln!(out, "{}-{:06}.{}", quality, id, segment_ext).unwrap();
        remaining -= chunk_secs as f64;
        id += 1;
    }

    writeln!(out, "#EXT-X-ENDLIST").unwrap();

    out
}
