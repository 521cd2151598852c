//! FFprobe-based source probing.
//!
//! Captures the immutable facts about a source file that the ladder and the
//! encoder argument synthesis depend on.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How long ffprobe gets before we give up on the source.
const PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while probing a source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// ffprobe could not be launched.
    #[error("failed to launch ffprobe: {0}")]
    Launch(std::io::Error),

    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    /// ffprobe did not answer within the deadline.
    #[error("ffprobe timed out after {}s", PROBE_DEADLINE.as_secs())]
    Timeout,

    /// The output could not be parsed.
    #[error("failed to parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    /// The file has no video stream.
    #[error("no video streams found")]
    NoVideoStream,
}

/// Source metadata captured once at supervisor creation.
#[derive(Debug, Clone, Serialize)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
    pub frame_rate: u32,
    pub codec_name: String,
    pub bit_rate: u64,
    /// Display Matrix rotation in degrees, 0 when absent.
    pub rotation: i32,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    avg_frame_rate: Option<String>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
    rotation: Option<i32>,
}

/// Probe a source file with ffprobe.
///
/// Only the first video stream is inspected; audio is handled by the encoder
/// argument synthesis and never needs probing.
pub async fn probe_file(ffprobe: &str, path: &Path) -> Result<MediaProbe> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format:stream",
            "-select_streams",
            "v",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output();

    let output = tokio::time::timeout(PROBE_DEADLINE, output)
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Launch)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ProbeFailed(stderr.trim().to_string()));
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
    parse_probe_output(parsed)
}

fn parse_probe_output(output: FfprobeOutput) -> Result<MediaProbe> {
    let stream = output.streams.into_iter().next().ok_or(Error::NoVideoStream)?;

    let duration = stream
        .duration
        .as_deref()
        .and_then(parse_seconds)
        .or_else(|| output.format.duration.as_deref().and_then(parse_seconds))
        .unwrap_or(Duration::ZERO);

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(30.0);

    // Sources without a reported bitrate are treated as middling 5 Mbps
    let bit_rate = stream
        .bit_rate
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5_000_000);

    let rotation = stream
        .side_data_list
        .iter()
        .find(|sd| sd.side_data_type.as_deref() == Some("Display Matrix"))
        .and_then(|sd| sd.rotation)
        .unwrap_or(0);

    Ok(MediaProbe {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        duration,
        frame_rate: frame_rate.round() as u32,
        codec_name: stream.codec_name.unwrap_or_default(),
        bit_rate,
        rotation,
    })
}

fn parse_seconds(s: &str) -> Option<Duration> {
    let secs: f64 = s.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let parts: Vec<&str> = rate_str.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den != 0.0 {
            return Some(num / den);
        }
    }
    rate_str.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("24000/1001"), Some(23.976023976023978));
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("invalid"), None);
        assert_eq!(parse_frame_rate("30/0"), None);
    }

    #[test]
    fn test_parse_full_output() {
        let json = r#"{
            "streams": [{
                "width": 1920,
                "height": 1080,
                "duration": "93.500000",
                "avg_frame_rate": "30000/1001",
                "codec_name": "h264",
                "bit_rate": "8000000",
                "side_data_list": [
                    {"side_data_type": "Display Matrix", "rotation": -90}
                ]
            }],
            "format": {"duration": "93.600000"}
        }"#;

        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let probe = parse_probe_output(parsed).unwrap();

        assert_eq!(probe.width, 1920);
        assert_eq!(probe.height, 1080);
        assert_eq!(probe.duration, Duration::from_secs_f64(93.5));
        assert_eq!(probe.frame_rate, 30);
        assert_eq!(probe.codec_name, "h264");
        assert_eq!(probe.bit_rate, 8_000_000);
        assert_eq!(probe.rotation, -90);
    }

    #[test]
    fn test_duration_falls_back_to_format() {
        let json = r#"{
            "streams": [{"width": 640, "height": 360, "codec_name": "hevc"}],
            "format": {"duration": "42.0"}
        }"#;

        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let probe = parse_probe_output(parsed).unwrap();

        assert_eq!(probe.duration, Duration::from_secs(42));
        // Missing bitrate falls back to 5 Mbps, missing frame rate to 30
        assert_eq!(probe.bit_rate, 5_000_000);
        assert_eq!(probe.frame_rate, 30);
    }

    #[test]
    fn test_no_video_stream() {
        let json = r#"{"streams": [], "format": {}}"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert!(matches!(
            parse_probe_output(parsed),
            Err(Error::NoVideoStream)
        ));
    }
}
