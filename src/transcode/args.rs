//! Encoder argument synthesis.
//!
//! The engine itself only ever asks one question here: "give me argv for an
//! encoder starting at this second, writing segments under this pattern".
//! Everything about hardware acceleration, filter chains and rate control is
//! contained in this module.

use crate::config::{HwAccelConfig, TranscodeConfig};
use crate::probe::MediaProbe;
use crate::transcode::QUALITY_MAX;
use std::path::Path;

const ENCODER_X264: &str = "libx264";
const ENCODER_VAAPI: &str = "h264_vaapi";
const ENCODER_NVENC: &str = "h264_nvenc";

/// Immutable per-stream facts the synthesis needs.
pub struct EncoderSpec<'a> {
    pub cfg: &'a TranscodeConfig,
    pub hw: &'a HwAccelConfig,
    pub probe: &'a MediaProbe,
    pub source: &'a Path,
    pub quality: &'a str,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
}

impl EncoderSpec<'_> {
    fn encoder(&self) -> &'static str {
        if self.hw.vaapi {
            ENCODER_VAAPI
        } else if self.hw.nvenc {
            ENCODER_NVENC
        } else {
            ENCODER_X264
        }
    }

    /// Input, filter and codec arguments shared by HLS and full-video runs.
    pub fn transcode_args(&self, start_at: f64, is_hls: bool) -> Vec<String> {
        let mut args: Vec<String> = vec!["-loglevel".into(), "warning".into()];

        if start_at > 0.0 {
            args.push("-ss".into());
            args.push(format!("{:.6}", start_at));
        }

        let encoder = self.encoder();

        if encoder == ENCODER_VAAPI {
            args.extend(
                [
                    "-hwaccel",
                    "vaapi",
                    "-hwaccel_device",
                    "/dev/dri/renderD128",
                    "-hwaccel_output_format",
                    "vaapi",
                ]
                .map(String::from),
            );
        } else if encoder == ENCODER_NVENC {
            args.extend(["-hwaccel".into(), "cuda".into()]);
            args.extend(["-hwaccel_device".into(), self.hw.cuda_device.to_string()]);
        }

        // Autorotation copies the rotation side data into HLS output where it
        // does not survive; a manual transpose below handles it instead
        if self.hw.use_transpose {
            args.push("-noautorotate".into());
        }

        args.extend([
            "-i".into(),
            self.source.to_string_lossy().into_owned(),
            // -copyts keeps output timestamps aligned with the source
            "-copyts".into(),
            "-fflags".into(),
            "+genpts".into(),
        ]);

        args.extend(self.filter_args(encoder, is_hls));

        args.extend(["-map".into(), "0:v:0".into(), "-c:v".into(), encoder.into()]);
        args.extend(self.rate_control_args(encoder));

        // First audio track when present, mono AAC
        args.extend(
            ["-map", "0:a:0?", "-c:a", "aac", "-ac", "1"].map(String::from),
        );

        args
    }

    fn filter_args(&self, encoder: &str, is_hls: bool) -> Vec<String> {
        let mut format = "format=nv12".to_string();
        let mut scaler = "scale";
        let mut scaler_args = vec!["force_original_aspect_ratio=decrease".to_string()];

        if encoder == ENCODER_VAAPI {
            format = "format=nv12|vaapi,hwupload".into();
            scaler = "scale_vaapi";
            scaler_args.push("format=nv12".into());
        } else if encoder == ENCODER_NVENC {
            format = "format=nv12,hwupload_cuda".into();
            scaler = match self.hw.nvenc_scale.as_str() {
                "npp" => "scale_npp",
                "cuda" => {
                    // scale_cuda skips frames unless passthrough is disabled
                    scaler_args.push("passthrough=0".into());
                    "scale_cuda"
                }
                _ => "scale",
            };
        }

        if self.quality != QUALITY_MAX {
            scaler_args.push(format!("w={}", self.width));
            scaler_args.push(format!("h={}", self.height));
        }

        let mut filter = format!("{},{}={}", format, scaler, scaler_args.join(":"));

        if is_hls && self.hw.use_transpose {
            let transposer = match encoder {
                ENCODER_VAAPI => "transpose_vaapi".to_string(),
                ENCODER_NVENC => format!("transpose_{}", self.hw.nvenc_scale),
                _ => "transpose".to_string(),
            };

            // transpose_cuda does not exist; rotated sources fall through
            if transposer != "transpose_cuda" {
                match self.probe.rotation {
                    -90 => filter = format!("{},{}=1", filter, transposer),
                    90 => filter = format!("{},{}=2", filter, transposer),
                    180 | -180 => {
                        filter = format!("{},{}=1,{}=1", filter, transposer, transposer)
                    }
                    _ => {}
                }
            }
        }

        vec!["-vf".into(), filter]
    }

    fn rate_control_args(&self, encoder: &str) -> Vec<String> {
        let qf = self.cfg.quality_factor;

        match encoder {
            ENCODER_VAAPI => {
                let mut args = vec!["-global_quality".to_string(), qf.to_string()];
                if self.hw.vaapi_low_power {
                    args.extend(["-low_power".into(), "1".into()]);
                }
                args
            }
            ENCODER_NVENC => {
                let (preset, lookahead) = self.nvenc_tuning();
                let mut args = vec![
                    "-gpu".to_string(),
                    self.hw.cuda_device.to_string(),
                    "-preset".to_string(),
                    preset.to_string(),
                    "-tune".to_string(),
                    "hq".to_string(),
                    "-rc".to_string(),
                    "vbr".to_string(),
                    "-rc-lookahead".to_string(),
                    lookahead.to_string(),
                    "-cq".to_string(),
                    qf.to_string(),
                ];

                if self.hw.nvenc_temporal_aq {
                    args.extend(["-temporal-aq".into(), "1".into()]);
                }

                // Cap the encoder at the advertised bandwidth so it cannot
                // overshoot what the master playlist promised
                if self.quality != QUALITY_MAX {
                    let maxrate = (self.bitrate as f64 * 1.25) as u64;
                    args.extend([
                        "-maxrate".into(),
                        maxrate.to_string(),
                        "-bufsize".into(),
                        (maxrate * 2).to_string(),
                    ]);
                }

                args
            }
            _ => vec![
                "-preset".to_string(),
                "faster".to_string(),
                "-crf".to_string(),
                qf.to_string(),
            ],
        }
    }

    /// Slower presets and longer lookahead for demanding sources.
    fn nvenc_tuning(&self) -> (&'static str, u32) {
        let bitrate = self.probe.bit_rate;
        let (preset, mut lookahead) = if bitrate > 100_000_000 {
            ("p2", 250)
        } else if bitrate > 50_000_000 {
            ("p3", 120)
        } else {
            ("p4", 60)
        };

        if self.probe.frame_rate > 30 {
            lookahead = ((lookahead as f64) * 1.5) as u32;
            if lookahead > 250 {
                lookahead = 250;
            }
        }

        (preset, lookahead)
    }

    /// HLS segmenting arguments, appended after [`Self::transcode_args`].
    pub fn hls_args(&self, start_id: u32, segment_pattern: &str, fmp4: bool) -> Vec<String> {
        let chunk = self.cfg.chunk_duration_secs;
        let segment_type = if fmp4 { "fmp4" } else { "mpegts" };

        let mut args: Vec<String> = vec![
            "-start_number".into(),
            start_id.to_string(),
            "-avoid_negative_ts".into(),
            "disabled".into(),
            "-f".into(),
            "hls".into(),
            "-hls_flags".into(),
            "split_by_time".into(),
            "-hls_time".into(),
            chunk.to_string(),
            "-hls_segment_type".into(),
            segment_type.into(),
            "-hls_segment_filename".into(),
            segment_pattern.into(),
        ];

        if self.hw.use_gop_size && self.probe.frame_rate > 0 {
            let gop = chunk * self.probe.frame_rate;
            args.extend([
                "-g".into(),
                gop.to_string(),
                "-keyint_min".into(),
                gop.to_string(),
            ]);
        } else {
            args.extend([
                "-force_key_frames".into(),
                format!("expr:gte(t,n_forced*{})", chunk),
            ]);
            if self.hw.nvenc {
                args.extend(["-forced-idr".into(), "1".into()]);
            }
        }

        // Playlist output goes to stdout; the filenames it prints are the
        // engine's completion signal
        args.push("-".into());

        args
    }

    /// Output arguments for one-shot full-video piping.
    pub fn full_video_args(&self) -> Vec<String> {
        [
            "-movflags",
            "frag_keyframe+empty_moov+faststart",
            "-f",
            "mp4",
            "pipe:1",
        ]
        .map(String::from)
        .to_vec()
    }
}
