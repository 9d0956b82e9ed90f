//! Per-frame diagnostic records
//!
//! Collects the rate control outcome of every frame so a run can be saved to
//! JSON and compared later. Each encoder owns its collector.
//!
//! This module is only available when the "diagnostics" feature is enabled.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::config::SessionConfig;
use crate::rate_control::FrameDecision;
use crate::types::{BlockType, SideInfo, MAX_CHANNELS, MAX_GRANULES};

/// Outcome of one granule and channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleRecord {
    pub gr: usize,
    pub ch: usize,
    pub block_type: BlockType,
    pub global_gain: i32,
    /// Huffman bits
    pub part2_3_length: i32,
    /// Scalefactor bits
    pub part2_length: i32,
    pub big_values: i32,
    pub scalefac_scale: i32,
    pub preflag: i32,
    pub over_count: i32,
    /// Bits the bitstream writer actually emitted
    pub written_bits: i32,
}

/// Outcome of one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Frame number (1-based)
    pub frame_number: u64,
    pub bitrate_index: usize,
    pub bitrate_kbps: u32,
    pub used_bits: i32,
    pub main_data_begin: i32,
    /// Reservoir content after the frame, in bits
    pub resv_size: i32,
    pub resv_drain_pre: i32,
    pub resv_drain_post: i32,
    pub granules: Vec<GranuleRecord>,
}

impl FrameRecord {
    pub fn new(
        frame_number: u64,
        session: &SessionConfig,
        side: &SideInfo,
        decision: &FrameDecision,
        main_data_begin: i32,
        resv_size: i32,
        written: &[[i32; MAX_CHANNELS]; MAX_GRANULES],
    ) -> Self {
        let mut granules = Vec::with_capacity(session.mode_gr * session.channels);
        for gr in 0..session.mode_gr {
            for ch in 0..session.channels {
                let gi = &side.tt[gr][ch];
                granules.push(GranuleRecord {
                    gr,
                    ch,
                    block_type: gi.block_type,
                    global_gain: gi.global_gain,
                    part2_3_length: gi.part2_3_length,
                    part2_length: gi.part2_length,
                    big_values: gi.big_values,
                    scalefac_scale: gi.scalefac_scale,
                    preflag: gi.preflag,
                    over_count: decision.over_count[gr][ch],
                    written_bits: written[gr][ch],
                });
            }
        }
        Self {
            frame_number,
            bitrate_index: decision.bitrate_index,
            bitrate_kbps: session.bitrate_kbps(decision.bitrate_index),
            used_bits: decision.used_bits,
            main_data_begin,
            resv_size,
            resv_drain_pre: side.resv_drain_pre,
            resv_drain_post: side.resv_drain_post,
            granules,
        }
    }
}

/// A recorded run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    /// Creation timestamp
    pub created_at: String,
    pub frames: Vec<FrameRecord>,
}

/// Frame records of one encoder
#[derive(Debug, Clone)]
pub struct DiagnosticsCollector {
    created_at: chrono::DateTime<chrono::Utc>,
    frames: Vec<FrameRecord>,
}

impl Default for DiagnosticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsCollector {
    pub fn new() -> Self {
        Self {
            created_at: chrono::Utc::now(),
            frames: Vec::new(),
        }
    }

    pub fn record(&mut self, frame: FrameRecord) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn report(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            created_at: self.created_at.to_rfc3339(),
            frames: self.frames.clone(),
        }
    }

    /// Save the collected records to a JSON file
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(&self.report())?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(json.as_bytes())?;
        log::info!("Diagnostics saved to: {}", path.as_ref().display());
        Ok(())
    }

    /// Load a report written by `save_json`
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<DiagnosticsReport, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
