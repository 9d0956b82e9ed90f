//! Frame encoder
//!
//! `Layer3Encoder` takes one frame of spectral analysis at a time, runs the
//! session's rate control over it and formats the result. Everything that
//! links frames together lives here: CBR padding, the ATH loudness
//! adjustment, the reservoir and the main data back-pointer.

use crate::bitstream::{FrameFormatter, FrameHeader};
use crate::config::{EncoderConfig, RateMode, SessionConfig, StereoMode};
use crate::error::{EncodingError, InternalError, Result};
use crate::rate_control::RateControl;
use crate::types::{BlockType, GrInfo, PsyRatio, SideInfo, GRANULE_SIZE, MAX_CHANNELS, MAX_GRANULES};
use log::{debug, error, info, warn};

#[cfg(feature = "diagnostics")]
use crate::diagnostics::{DiagnosticsCollector, FrameRecord};

/// Everything the analysis stage provides for one frame
#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    /// MDCT coefficients per granule and channel, as left/right. Mid/side
    /// frames are converted during rate control.
    pub xr: [[[f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES],
    /// Perceptual entropy per granule and channel
    pub pe: [[f32; MAX_CHANNELS]; MAX_GRANULES],
    /// Masking threshold and energy per band
    pub ratio: [[PsyRatio; MAX_CHANNELS]; MAX_GRANULES],
    /// Side channel share of the mid/side energy per granule
    pub ms_ener_ratio: [f32; MAX_GRANULES],
    pub block_type: [[BlockType; MAX_CHANNELS]; MAX_GRANULES],
    /// Code this joint stereo frame as mid/side
    pub mid_side: bool,
    /// Squared loudness per granule and channel, drives the ATH adjustment
    pub loudness_sq: [[f32; MAX_CHANNELS]; MAX_GRANULES],
}

impl Default for FrameAnalysis {
    fn default() -> Self {
        Self {
            xr: [[[0.0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES],
            pe: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
            ratio: [[PsyRatio::default(); MAX_CHANNELS]; MAX_GRANULES],
            ms_ener_ratio: [0.5; MAX_GRANULES],
            block_type: [[BlockType::Normal; MAX_CHANNELS]; MAX_GRANULES],
            mid_side: false,
            loudness_sq: [[0.0; MAX_CHANNELS]; MAX_GRANULES],
        }
    }
}

/// Output of one `encode_frame` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Frames completed by this call. Main data of later frames may still
    /// land in the payload of this one, so output lags by up to a few frames.
    pub bytes: Vec<u8>,
    pub bitrate_index: usize,
    pub padding: bool,
    /// Main data bits of this frame
    pub used_bits: i32,
    /// Distorted bands per granule and channel
    pub over_count: [[i32; MAX_CHANNELS]; MAX_GRANULES],
    /// Back-pointer written into this frame's side info
    pub main_data_begin: i32,
}

/// Layer III encoder for one stream
pub struct Layer3Encoder {
    session: SessionConfig,
    rc: RateControl,
    side: SideInfo,
    formatter: FrameFormatter,
    /// Fractional part of the CBR frame length in bytes
    frac_slots_per_frame: f64,
    slot_lag: f64,
    frames: u64,
    #[cfg(feature = "diagnostics")]
    diagnostics: DiagnosticsCollector,
}

impl Layer3Encoder {
    /// Validate `config` and set up a new stream
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let session = SessionConfig::from_config(&config)?;

        let frac_slots_per_frame = match session.rate {
            RateMode::Cbr { kbps } => {
                let avg_slots = (session.mode_gr * GRANULE_SIZE) as f64 / session.sample_rate as f64
                    * (1000.0 * kbps as f64 / 8.0);
                avg_slots - avg_slots.floor()
            }
            _ => 0.0,
        };

        info!(
            "layer3 encoder: {} Hz, {} ch, {:?}",
            session.sample_rate, session.channels, session.rate
        );

        Ok(Self {
            rc: RateControl::new(&session),
            side: SideInfo::default(),
            formatter: FrameFormatter::new(),
            frac_slots_per_frame,
            slot_lag: -frac_slots_per_frame,
            frames: 0,
            #[cfg(feature = "diagnostics")]
            diagnostics: DiagnosticsCollector::new(),
            session,
        })
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Bits currently banked in the reservoir
    pub fn reservoir_bits(&self) -> i32 {
        self.rc.reservoir.size()
    }

    /// Side info of the most recent frame
    pub fn side_info(&self) -> &SideInfo {
        &self.side
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames
    }

    #[cfg(feature = "diagnostics")]
    pub fn diagnostics(&self) -> &DiagnosticsCollector {
        &self.diagnostics
    }

    fn validate(&self, frame: &FrameAnalysis) -> std::result::Result<(), EncodingError> {
        for gr in 0..self.session.mode_gr {
            for ch in 0..self.session.channels {
                if frame.xr[gr][ch].iter().any(|x| !x.is_finite()) || !frame.pe[gr][ch].is_finite() {
                    return Err(EncodingError::NonFiniteInput { gr, ch });
                }
            }
        }
        if frame.mid_side && (self.session.mode != StereoMode::JointStereo || self.session.channels != 2) {
            return Err(EncodingError::InvalidMidSide);
        }
        Ok(())
    }

    /// CBR frames alternate between the two frame lengths so the average
    /// matches the nominal bitrate
    fn next_padding(&mut self) -> bool {
        if self.frac_slots_per_frame == 0.0 {
            return false;
        }
        let padding = self.slot_lag <= self.frac_slots_per_frame - 1.0;
        self.slot_lag += f64::from(u8::from(padding)) - self.frac_slots_per_frame;
        padding
    }

    /// Quantize and format one frame.
    ///
    /// On error the encoder is left as it was before the call, so the stream
    /// can continue with the next frame.
    pub fn encode_frame(&mut self, frame: &FrameAnalysis) -> Result<EncodedFrame> {
        self.validate(frame)?;
        let rc = self.rc.clone();
        let formatter = self.formatter.clone();
        let side = self.side.clone();
        let slot_lag = self.slot_lag;

        match self.encode_validated(frame) {
            Ok(out) => Ok(out),
            Err(err) => {
                warn!("frame {} dropped: {}", self.frames + 1, err);
                self.rc = rc;
                self.formatter = formatter;
                self.side = side;
                self.slot_lag = slot_lag;
                Err(err)
            }
        }
    }

    fn encode_validated(&mut self, frame: &FrameAnalysis) -> Result<EncodedFrame> {
        let session = &self.session;

        let main_data_begin = self.formatter.free_bytes() as i32;
        self.side = SideInfo { main_data_begin, ..SideInfo::default() };
        for gr in 0..session.mode_gr {
            for ch in 0..session.channels {
                self.side.tt[gr][ch] = GrInfo {
                    xr: frame.xr[gr][ch],
                    block_type: frame.block_type[gr][ch],
                    ..GrInfo::default()
                };
            }
        }

        self.rc
            .quant
            .ath
            .update(&frame.loudness_sq, session.channels, session.mode_gr, session.ath_adjust);

        let padding = matches!(session.rate, RateMode::Cbr { .. }) && self.next_padding();
        let session = &self.session;
        let decision = self.rc.encode_frame(session, &mut self.side, frame, padding)?;

        let header = FrameHeader {
            bitrate_index: decision.bitrate_index,
            padding,
            mid_side: frame.mid_side,
        };
        let written_mdb = self.side.main_data_begin;
        let formatted = self.formatter.format_frame(session, &self.side, &header)?;

        let free = self.formatter.free_bytes() as i32;
        if free * 8 != self.rc.reservoir.size() {
            let err = InternalError::ReservoirInconsistency {
                resv_size: self.rc.reservoir.size(),
                main_data_begin: free,
            };
            debug_assert!(false, "{}", err);
            error!("{}", err);
            self.rc.reservoir.resync(free * 8);
        }

        self.frames += 1;
        debug!(
            "frame {}: index {}{}, {} bits, mdb {}, resv {}",
            self.frames,
            decision.bitrate_index,
            if padding { " padded" } else { "" },
            decision.used_bits,
            written_mdb,
            self.rc.reservoir.size()
        );

        #[cfg(feature = "diagnostics")]
        self.diagnostics.record(FrameRecord::new(
            self.frames,
            &self.session,
            &self.side,
            &decision,
            written_mdb,
            self.rc.reservoir.size(),
            &formatted.granule_bits,
        ));

        Ok(EncodedFrame {
            bytes: formatted.bytes,
            bitrate_index: decision.bitrate_index,
            padding,
            used_bits: decision.used_bits,
            over_count: decision.over_count,
            main_data_begin: written_mdb,
        })
    }

    /// Emit every frame still waiting for main data. The stream may end here
    /// or continue with a fresh reservoir.
    pub fn flush(&mut self) -> Vec<u8> {
        let bytes = self.formatter.flush();
        self.rc.reservoir.resync(0);
        self.side.main_data_begin = 0;
        debug!("flushed {} bytes after {} frames", bytes.len(), self.frames);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VbrMode;

    fn tone_frame(amp: f32) -> FrameAnalysis {
        let mut frame = FrameAnalysis::default();
        for gr in 0..2 {
            for ch in 0..2 {
                for (i, x) in frame.xr[gr][ch].iter_mut().enumerate().take(400) {
                    *x = amp * ((i as f32 * 0.61 + ch as f32).sin()) / (1.0 + i as f32 * 0.02);
                }
                frame.pe[gr][ch] = 600.0;
                frame.loudness_sq[gr][ch] = amp * amp;
            }
        }
        frame
    }

    #[test]
    fn test_cbr_padding_pattern() {
        let mut enc = Layer3Encoder::new(EncoderConfig::default()).unwrap();
        let frame = FrameAnalysis::default();
        let mut padded = 0;
        for _ in 0..49 {
            if enc.encode_frame(&frame).unwrap().padding {
                padded += 1;
            }
        }
        // 417.96 bytes per frame at 128 kbps, 44.1 kHz
        assert!((47..=49).contains(&padded), "{}", padded);
    }

    #[test]
    fn test_silence_fills_reservoir() {
        let mut enc = Layer3Encoder::new(EncoderConfig::default()).unwrap();
        let frame = FrameAnalysis::default();
        let first = enc.encode_frame(&frame).unwrap();
        assert_eq!(first.main_data_begin, 0);
        let second = enc.encode_frame(&frame).unwrap();
        assert!(second.main_data_begin > 0);
        assert_eq!(enc.reservoir_bits() % 8, 0);
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let mut enc = Layer3Encoder::new(EncoderConfig::default()).unwrap();
        let mut frame = FrameAnalysis::default();
        frame.xr[1][0][10] = f32::NAN;
        assert!(matches!(
            enc.encode_frame(&frame),
            Err(crate::error::EncoderError::Encoding(EncodingError::NonFiniteInput { gr: 1, ch: 0 }))
        ));
    }

    #[test]
    fn test_mid_side_needs_joint_stereo() {
        let cfg = EncoderConfig::default().with_mode(StereoMode::Stereo);
        let mut enc = Layer3Encoder::new(cfg).unwrap();
        let frame = FrameAnalysis { mid_side: true, ..FrameAnalysis::default() };
        assert!(enc.encode_frame(&frame).is_err());
    }

    #[test]
    fn test_failed_frame_leaves_encoder_unchanged() {
        let mut enc = Layer3Encoder::new(EncoderConfig::default()).unwrap();
        let mut loud = tone_frame(3000.0);
        loud.pe = [[20000.0; 2]; 2];

        // The reservoir claims bits the formatter does not hold, so the
        // granules overflow the frame payload
        enc.rc.reservoir.resync(4000);
        let slot_lag = enc.slot_lag;
        let before = enc.rc.clone();
        assert!(matches!(
            enc.encode_frame(&loud),
            Err(crate::error::EncoderError::Encoding(EncodingError::BitstreamError(_)))
        ));
        assert_eq!(enc.reservoir_bits(), 4000);
        assert_eq!(enc.slot_lag, slot_lag);
        assert_eq!(enc.rc.quant.ath.factor, before.quant.ath.factor);
        assert_eq!(enc.formatter.frames_written(), 0);
        assert_eq!(enc.formatter.free_bytes(), 0);
        assert_eq!(enc.frames_encoded(), 0);

        enc.rc.reservoir.resync(0);
        let out = enc.encode_frame(&loud).unwrap();
        assert_eq!(out.main_data_begin, 0);
        assert_eq!(enc.formatter.frames_written(), 1);
    }

    #[test]
    fn test_flush_emits_pending_frames() {
        let cfg = EncoderConfig::default().with_rate(RateMode::Vbr {
            mode: VbrMode::New,
            quality: 4,
            min_kbps: 32,
            max_kbps: 320,
        });
        let mut enc = Layer3Encoder::new(cfg).unwrap();
        let mut total = 0;
        let mut expected = 0;
        for _ in 0..4 {
            let out = enc.encode_frame(&tone_frame(0.3)).unwrap();
            total += out.bytes.len();
            expected += (enc.session().frame_bits(out.bitrate_index, false) / 8) as usize;
        }
        total += enc.flush().len();
        assert_eq!(total, expected);
        assert_eq!(enc.reservoir_bits(), 0);
    }
}
