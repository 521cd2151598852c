use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transcode: TranscodeConfig,

    #[serde(default)]
    pub hwaccel: HwAccelConfig,

    #[serde(default)]
    pub hls: HlsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Knobs for the segment production engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodeConfig {
    /// FFmpeg binary (resolved through PATH when not absolute)
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    /// FFprobe binary
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,

    /// Directory for produced segments; one subdirectory per source
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Length of each segment in seconds
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_secs: u32,

    /// How many chunks to look behind before restarting the encoder
    #[serde(default = "default_look_behind")]
    pub look_behind: u32,

    /// Chunks short of the goal at which the window advances
    #[serde(default = "default_goal_buffer_min")]
    pub goal_buffer_min: u32,

    /// Chunks of look-ahead granted when the window advances
    #[serde(default = "default_goal_buffer_max")]
    pub goal_buffer_max: u32,

    /// Seconds of inactivity before a stream tears down its encoder
    #[serde(default = "default_stream_idle")]
    pub stream_idle_secs: u32,

    /// Seconds of inactivity before a source supervisor destroys itself
    #[serde(default = "default_manager_idle")]
    pub manager_idle_secs: u32,

    /// Seconds a request blocks on a not-yet-produced segment
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Quality factor (CRF / global_quality / cq depending on encoder)
    #[serde(default = "default_quality_factor")]
    pub quality_factor: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HwAccelConfig {
    /// Use VA-API hardware encoding
    #[serde(default)]
    pub vaapi: bool,

    #[serde(default)]
    pub vaapi_low_power: bool,

    /// Use NVENC hardware encoding
    #[serde(default)]
    pub nvenc: bool,

    #[serde(default)]
    pub nvenc_temporal_aq: bool,

    /// NVENC scaler: "npp" or "cuda"
    #[serde(default = "default_nvenc_scale")]
    pub nvenc_scale: String,

    /// GPU device index
    #[serde(default)]
    pub cuda_device: u32,

    /// Transpose workaround for rotated sources (VA-API)
    #[serde(default)]
    pub use_transpose: bool,

    /// Fixed GOP size workaround (NVENC)
    #[serde(default)]
    pub use_gop_size: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HlsConfig {
    /// Emit fragmented MP4 segments instead of MPEG-TS
    #[serde(default)]
    pub fmp4: bool,
}

impl TranscodeConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl HlsConfig {
    pub fn segment_ext(&self) -> &'static str {
        if self.fmp4 {
            "mp4"
        } else {
            "ts"
        }
    }

    pub fn playlist_version(&self) -> u8 {
        if self.fmp4 {
            6
        } else {
            3
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    47788
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("vodforge")
}
fn default_chunk_duration() -> u32 {
    3
}
fn default_look_behind() -> u32 {
    8
}
fn default_goal_buffer_min() -> u32 {
    3
}
fn default_goal_buffer_max() -> u32 {
    12
}
fn default_stream_idle() -> u32 {
    60
}
fn default_manager_idle() -> u32 {
    60
}
fn default_wait_timeout() -> u64 {
    30
}
fn default_quality_factor() -> u32 {
    24
}
fn default_nvenc_scale() -> String {
    "npp".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for HwAccelConfig {
    fn default() -> Self {
        Self {
            vaapi: false,
            vaapi_low_power: false,
            nvenc: false,
            nvenc_temporal_aq: false,
            nvenc_scale: default_nvenc_scale(),
            cuda_device: 0,
            use_transpose: false,
            use_gop_size: false,
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            temp_dir: default_temp_dir(),
            chunk_duration_secs: default_chunk_duration(),
            look_behind: default_look_behind(),
            goal_buffer_min: default_goal_buffer_min(),
            goal_buffer_max: default_goal_buffer_max(),
            stream_idle_secs: default_stream_idle(),
            manager_idle_secs: default_manager_idle(),
            wait_timeout_secs: default_wait_timeout(),
            quality_factor: default_quality_factor(),
        }
    }
}
