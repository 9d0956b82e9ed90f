//! Shared helpers for the integration tests

#![allow(dead_code)]

use layer3_core::config::SessionConfig;
use layer3_core::types::{GRANULE_SIZE, MAX_CHANNELS, MAX_GRANULES};
use layer3_core::FrameAnalysis;

/// Route `log` output through the test harness, once per binary
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A steady tone: energy in the MDCT lines around `freq`
pub fn tone_frame(sample_rate: u32, freq: f32, amplitude: f32) -> FrameAnalysis {
    let mut frame = FrameAnalysis::default();
    let line_hz = sample_rate as f32 / 2.0 / GRANULE_SIZE as f32;
    let center = (freq / line_hz) as usize;
    for gr in 0..MAX_GRANULES {
        for ch in 0..MAX_CHANNELS {
            let xr = &mut frame.xr[gr][ch];
            for (k, &w) in [0.35f32, 1.0, 0.35].iter().enumerate() {
                let line = center + k - 1;
                let sign = if (line + gr) % 2 == 0 { 1.0 } else { -1.0 };
                xr[line] = sign * amplitude * w;
            }
            // some leakage so the upper bands are not entirely empty
            for (i, x) in xr.iter_mut().enumerate().skip(center + 2).take(60) {
                *x += amplitude * 1e-3 / (1 + i - center) as f32;
            }
            frame.pe[gr][ch] = 900.0;
            frame.loudness_sq[gr][ch] = 0.25;
        }
    }
    frame
}

/// Broadband noise with a falling spectrum, deterministic per `seed`
pub fn noise_frame(seed: u32, amplitude: f32) -> FrameAnalysis {
    let mut frame = FrameAnalysis::default();
    let mut v = seed.wrapping_mul(2_654_435_761) | 1;
    for gr in 0..MAX_GRANULES {
        for ch in 0..MAX_CHANNELS {
            for (i, x) in frame.xr[gr][ch].iter_mut().enumerate().take(500) {
                v ^= v << 13;
                v ^= v >> 17;
                v ^= v << 5;
                let r = (v % 20001) as f32 / 10000.0 - 1.0;
                *x = amplitude * r / (1.0 + i as f32 * 0.03);
            }
            frame.pe[gr][ch] = 400.0 + (v % 1200) as f32;
            frame.loudness_sq[gr][ch] = 0.1;
        }
    }
    frame
}

/// Header fields of one frame in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub bitrate_index: usize,
    pub padding: bool,
    pub main_data_begin: usize,
    pub len: usize,
}

/// Walk the frame headers of `stream`, panicking when a frame does not start
/// where the previous one ended
pub fn parse_frames(session: &SessionConfig, stream: &[u8]) -> Vec<ParsedHeader> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let h = &stream[pos..];
        assert!(h.len() >= 4, "truncated header at {}", pos);
        assert_eq!(h[0], 0xff, "no sync at {}", pos);
        assert_eq!(h[1] & 0xe0, 0xe0, "no sync at {}", pos);
        let bitrate_index = (h[2] >> 4) as usize;
        let padding = (h[2] >> 1) & 1 == 1;
        let main_data_begin = if session.mode_gr == 2 {
            ((h[4] as usize) << 1) | (h[5] as usize >> 7)
        } else {
            h[4] as usize
        };
        let len = (session.frame_bits(bitrate_index, padding) / 8) as usize;
        frames.push(ParsedHeader { bitrate_index, padding, main_data_begin, len });
        pos += len;
    }
    assert_eq!(pos, stream.len(), "stream ends inside a frame");
    frames
}
