//! Quality ladder derivation.
//!
//! Turns probe data into the set of rungs a source is offered at. Rungs that
//! would upscale, exceed most of the source bitrate, or end up implausibly
//! small are dropped; the `max` passthrough rung is always present.

use crate::probe::MediaProbe;
use crate::transcode::{COMPATIBLE_CODEC, QUALITY_MAX};

/// One quality target: a label, output dimensions and an advertised bitrate.
#[derive(Debug, Clone)]
pub struct Rung {
    pub quality: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    /// Sort key for the master playlist; scaled rungs come before `max`.
    pub order: u8,
}

/// Nominal rungs before bitrate scaling: (label, height, width, bitrate).
const BASE_RUNGS: [(&str, u32, u32, u64); 4] = [
    ("480p", 480, 854, 800_000),
    ("720p", 720, 1280, 1_500_000),
    ("1080p", 1080, 1920, 3_000_000),
    ("1440p", 1440, 2560, 6_000_000),
];

pub fn build_ladder(probe: &MediaProbe) -> Vec<Rung> {
    let reference = reference_bitrate(probe);

    // Scale every nominal bitrate by how the source compares to the rung
    // nearest to it in pixel count
    let origin_pixels = (probe.width * probe.height) as f64;
    let nearest = BASE_RUNGS
        .iter()
        .min_by(|a, b| {
            let da = ((a.1 * a.2) as f64 - origin_pixels).abs();
            let db = ((b.1 * b.2) as f64 - origin_pixels).abs();
            da.total_cmp(&db)
        })
        .expect("base rungs are non-empty");
    let multiplier = reference as f64 / nearest.3 as f64;

    // Rotation by a quarter turn swaps the effective source dimensions
    let (mut src_w, mut src_h) = (probe.width, probe.height);
    if matches!(probe.rotation, 90 | -90 | 270) {
        std::mem::swap(&mut src_w, &mut src_h);
    }

    let (sm_dim, lg_dim) = if probe.height > probe.width {
        (probe.width, probe.height)
    } else {
        (probe.height, probe.width)
    };

    let mut rungs = Vec::new();
    for (label, height, _, nominal) in BASE_RUNGS {
        let bitrate = (nominal as f64 * multiplier).ceil() as u64;

        let aspect = if src_h > 0 {
            src_w as f64 / src_h as f64
        } else {
            16.0 / 9.0
        };
        let mut width = (height as f64 * aspect).ceil() as u32;
        let mut height = height;

        // Encoders want even dimensions
        if width % 2 != 0 {
            width += 1;
        }
        if height % 2 != 0 {
            height += 1;
        }

        let upscales = height >= sm_dim || width >= lg_dim;
        let too_hungry = bitrate as f64 > probe.bit_rate as f64 * 0.8;
        let too_small = width < 64 || height < 64;
        if upscales || too_hungry || too_small {
            continue;
        }

        rungs.push(Rung {
            quality: label.to_string(),
            width,
            height,
            bitrate,
            order: 0,
        });
    }

    rungs.push(Rung {
        quality: QUALITY_MAX.to_string(),
        width: probe.width,
        height: probe.height,
        bitrate: reference,
        order: 1,
    });

    rungs
}

/// Bitrate the ladder is scaled against.
///
/// Half the source bitrate for H.264 input (the source is already efficient),
/// the full source bitrate otherwise, 10 Mbps when unknown, nudged up for
/// very heavy sources.
fn reference_bitrate(probe: &MediaProbe) -> u64 {
    let mut reference = probe.bit_rate / 2;
    if probe.codec_name != COMPATIBLE_CODEC {
        reference *= 2;
    }
    if reference == 0 {
        reference = 10_000_000;
    }
    if probe.bit_rate > 50_000_000 {
        reference = (reference as f64 * 1.2) as u64;
    }
    reference
}
