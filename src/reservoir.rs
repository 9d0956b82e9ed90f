//! Bit reservoir for managing bit allocation across frames
//!
//! Frames that need fewer bits than their share leave the rest in the
//! reservoir, where later frames can borrow them through `main_data_begin`.
//! `ResvSize` always equals `8 * main_data_begin` of the next frame; the
//! reservoir never grows beyond `ResvMax` and stays byte aligned at frame
//! boundaries, with the excess drained as ancillary stuffing bits.

use crate::config::SessionConfig;
use crate::types::SideInfo;
use log::{debug, error};

/// Bits available to one frame, from `frame_begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    /// Upper bound for the main data of the whole frame
    pub full_frame_bits: i32,
    /// Mean main data bits per granule (all channels)
    pub mean_bits: i32,
}

/// Per-granule target from `max_bits`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservoirTarget {
    /// Bits the granule should aim for
    pub targ_bits: i32,
    /// Additional bits the granule may borrow when it needs them
    pub extra_bits: i32,
    /// The reservoir is nearly full and is being drained by this granule
    pub draining: bool,
}

/// Bit reservoir state for one encoding session
#[derive(Debug, Clone)]
pub struct BitReservoir {
    /// Current reservoir size in bits (ResvSize)
    resv_size: i32,
    /// Maximum reservoir size in bits for the current frame (ResvMax)
    resv_max: i32,
    /// Largest frame a decoder has to buffer, in bits
    buffer_constraint: i32,
    mode_gr: i32,
    sideinfo_len: i32,
    disabled: bool,
    substep_shaping: u8,
}

impl BitReservoir {
    pub fn new(session: &SessionConfig) -> Self {
        Self {
            resv_size: 0,
            resv_max: 0,
            buffer_constraint: session.buffer_constraint,
            mode_gr: session.mode_gr as i32,
            sideinfo_len: session.sideinfo_len as i32,
            disabled: session.disable_reservoir,
            substep_shaping: session.substep_shaping,
        }
    }

    /// Start a frame of `frame_bits` total bits (header included).
    ///
    /// Sets `ResvMax` for this frame size and returns the frame's budget.
    /// Calling it again with another size simply recomputes both, which is
    /// how variable bitrate modes try the candidate bitrates.
    pub fn frame_begin(&mut self, frame_bits: i32) -> FrameBudget {
        let mean_bits = (frame_bits - self.sideinfo_len * 8) / self.mode_gr;

        // main_data_begin is 9 bits (MPEG-1) or 8 bits (MPEG-2) of bytes
        let resv_limit = 8 * 256 * self.mode_gr - 8;
        self.resv_max = (self.buffer_constraint - frame_bits).min(resv_limit);
        if self.resv_max < 0 || self.disabled {
            self.resv_max = 0;
        }

        let full_frame_bits = (mean_bits * self.mode_gr + self.resv_size.min(self.resv_max))
            .min(self.buffer_constraint);

        debug_assert_eq!(self.resv_max % 8, 0);
        FrameBudget { full_frame_bits, mean_bits }
    }

    /// Target and borrowable bits for one granule.
    ///
    /// With `cbr`, one granule's mean share is counted as present: the
    /// frame's own bits are only credited at `frame_end`, after the first
    /// granule has already been debited.
    pub fn max_bits(&self, mean_bits: i32, cbr: bool) -> ReservoirTarget {
        let mut resv_size = self.resv_size;
        let mut resv_max = self.resv_max;
        if cbr {
            resv_size += mean_bits;
        }
        if self.substep_shaping & 1 != 0 {
            resv_max = (resv_max as f64 * 0.9) as i32;
        }

        let mut targ_bits = mean_bits;
        let add_bits;
        let draining;
        if resv_size * 10 > resv_max * 9 {
            add_bits = resv_size - (resv_max * 9) / 10;
            targ_bits += add_bits;
            draining = true;
        } else {
            add_bits = 0;
            draining = false;
            // Build the reservoir up slowly
            if !self.disabled && self.substep_shaping & 1 == 0 {
                targ_bits = (targ_bits as f64 - 0.1 * mean_bits as f64) as i32;
            }
        }

        let extra_bits = (resv_size.min(self.resv_max * 6 / 10) - add_bits).max(0);
        ReservoirTarget { targ_bits, extra_bits, draining }
    }

    /// Account for the bits a granule actually used
    pub fn adjust(&mut self, used_bits: i32) {
        self.resv_size -= used_bits;
    }

    /// Close the frame: add its mean bits, then drain everything that is
    /// not byte aligned or exceeds `ResvMax`. Drained bits go into the
    /// previous frame's ancillary area first, as far as `main_data_begin`
    /// allows, and into this frame's ancillary area otherwise.
    pub fn frame_end(&mut self, mean_bits: i32, side: &mut SideInfo) {
        self.resv_size += mean_bits * self.mode_gr;
        side.resv_drain_pre = 0;
        side.resv_drain_post = 0;

        let mut stuffing = self.resv_size.rem_euclid(8);
        let over_bits = (self.resv_size - stuffing) - self.resv_max;
        if over_bits > 0 {
            stuffing += over_bits;
        }

        let mdb_bytes = (side.main_data_begin * 8).min(stuffing) / 8;
        side.resv_drain_pre += 8 * mdb_bytes;
        stuffing -= 8 * mdb_bytes;
        self.resv_size -= 8 * mdb_bytes;
        side.main_data_begin -= mdb_bytes;

        side.resv_drain_post += stuffing;
        self.resv_size -= stuffing;

        if self.resv_size > self.resv_max || self.resv_size % 8 != 0 || self.resv_size < 0 {
            debug_assert!(false, "reservoir out of range: {} of {}", self.resv_size, self.resv_max);
            error!("reservoir out of range: {} bits, max {}", self.resv_size, self.resv_max);
        }
        debug!(
            "frame end: resv {} / {}, drain pre {} post {}",
            self.resv_size, self.resv_max, side.resv_drain_pre, side.resv_drain_post
        );
    }

    /// Overwrite the tracked size, used to resynchronize with the bitstream
    pub fn resync(&mut self, resv_size: i32) {
        self.resv_size = resv_size;
    }

    pub fn size(&self) -> i32 {
        self.resv_size
    }

    pub fn max(&self) -> i32 {
        self.resv_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, RateMode};
    use proptest::prelude::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Keep failing property output short
    fn setup_panic_hook() {
        INIT.call_once(|| {
            std::panic::set_hook(Box::new(|_| {
                eprintln!("Test failed: Property test assertion failed");
            }));
        });
    }

    fn session(kbps: u32, reservoir: bool) -> SessionConfig {
        let cfg = EncoderConfig::default()
            .with_rate(RateMode::Cbr { kbps })
            .with_reservoir(reservoir);
        SessionConfig::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_frame_begin_budget() {
        let s = session(128, true);
        let mut resv = BitReservoir::new(&s);
        let frame_bits = s.frame_bits(s.bitrate_index, false);
        let budget = resv.frame_begin(frame_bits);
        assert_eq!(budget.mean_bits, (frame_bits - 36 * 8) / 2);
        assert_eq!(budget.full_frame_bits, budget.mean_bits * 2);
        assert_eq!(resv.max(), (8 * 256 * 2 - 8).min(s.buffer_constraint - frame_bits));
    }

    #[test]
    fn test_silent_frames_fill_then_drain() {
        let s = session(128, true);
        let mut resv = BitReservoir::new(&s);
        let mut side = SideInfo::default();
        let frame_bits = s.frame_bits(s.bitrate_index, false);
        for _ in 0..10 {
            let budget = resv.frame_begin(frame_bits);
            resv.frame_end(budget.mean_bits, &mut side);
            side.main_data_begin = resv.size() / 8;
        }
        assert_eq!(resv.size(), resv.max());
        assert!(side.resv_drain_pre + side.resv_drain_post > 0);
    }

    #[test]
    fn test_disabled_reservoir_drains_everything() {
        let s = session(128, false);
        let mut resv = BitReservoir::new(&s);
        let mut side = SideInfo::default();
        let budget = resv.frame_begin(s.frame_bits(s.bitrate_index, false));
        assert_eq!(resv.max(), 0);
        resv.adjust(1000);
        resv.frame_end(budget.mean_bits, &mut side);
        assert_eq!(resv.size(), 0);
        assert_eq!(side.resv_drain_post, budget.mean_bits * 2 - 1000);
        assert_eq!(side.resv_drain_pre, 0);
    }

    #[test]
    fn test_full_reservoir_raises_target() {
        let s = session(128, true);
        let mut resv = BitReservoir::new(&s);
        let budget = resv.frame_begin(s.frame_bits(s.bitrate_index, false));
        let empty = resv.max_bits(budget.mean_bits, true);
        assert!(!empty.draining);
        assert!(empty.targ_bits < budget.mean_bits);

        resv.resync(resv.max());
        let full = resv.max_bits(budget.mean_bits, true);
        assert!(full.draining);
        assert!(full.targ_bits > budget.mean_bits);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            verbose: 0,
            max_shrink_iters: 0,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_reservoir_conserves_bits(
            kbps in prop::sample::select(&[32u32, 64, 128, 192, 320]),
            usage in prop::collection::vec(0.0f64..1.0, 1..30),
        ) {
            setup_panic_hook();
            let s = session(kbps, true);
            let mut resv = BitReservoir::new(&s);
            let mut side = SideInfo::default();
            let frame_bits = s.frame_bits(s.bitrate_index, false);
            let (mut supplied, mut used_total, mut drained) = (0i64, 0i64, 0i64);

            for u in usage {
                let budget = resv.frame_begin(frame_bits);
                let used = (budget.full_frame_bits as f64 * u) as i32;
                resv.adjust(used);
                resv.frame_end(budget.mean_bits, &mut side);
                let next_mdb = side.main_data_begin
                    + (frame_bits - 8 * s.sideinfo_len as i32 - used - side.resv_drain_post) / 8;
                side.main_data_begin = next_mdb;

                supplied += (budget.mean_bits * 2) as i64;
                used_total += used as i64;
                drained += (side.resv_drain_pre + side.resv_drain_post) as i64;

                prop_assert!(resv.size() >= 0 && resv.size() <= resv.max());
                prop_assert_eq!(resv.size() % 8, 0);
                prop_assert_eq!(next_mdb * 8, resv.size());
            }
            prop_assert_eq!(supplied, used_total + drained + resv.size() as i64);
        }

        #[test]
        fn property_extra_bits_bounded(
            fill in 0i32..4088,
            cbr in any::<bool>(),
        ) {
            setup_panic_hook();
            let s = session(128, true);
            let mut resv = BitReservoir::new(&s);
            let budget = resv.frame_begin(s.frame_bits(s.bitrate_index, false));
            resv.resync(fill.min(resv.max()) / 8 * 8);
            let target = resv.max_bits(budget.mean_bits, cbr);
            prop_assert!(target.extra_bits >= 0);
            prop_assert!(target.extra_bits <= resv.max() * 6 / 10);
        }
    }
}
