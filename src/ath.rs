//! Absolute threshold of hearing
//!
//! The per-band tables are built once per session from the Terhardt-style
//! formula and scaled into the MDCT energy domain. `AthAdjust` holds the
//! loudness-driven attenuation that follows the signal from frame to frame.

use crate::tables::ScaleFactorBands;
use crate::types::{GRANULE_SIZE, SBMAX_L, SBMAX_S};

/// Offset between the formula's dB scale and the MDCT energy scale
const MDCT_SCALE_DB: f32 = 100.0;

/// Threshold in dB SPL at `freq` Hz. Negative frequencies select the
/// minimum of the curve (3410 Hz).
pub fn ath_formula(freq: f32) -> f32 {
    let f = if freq < -0.3 { 3410.0 } else { freq };
    let f = (f as f64 / 1000.0).clamp(0.01, 24.0);
    let value = 4.0;
    (3.640 * f.powf(-0.8) - 6.800 * (-0.6 * (f - 3.4).powi(2)).exp()
        + 6.000 * (-0.15 * (f - 8.7).powi(2)).exp()
        + (0.6 + 0.04 * value) * 0.001 * f.powi(4)) as f32
}

/// Threshold at `freq` Hz as an MDCT-domain energy
pub fn ath_mdct(freq: f32, offset_db: f32) -> f32 {
    let ath = ath_formula(freq) - MDCT_SCALE_DB + offset_db;
    10f32.powf(ath * 0.1)
}

/// Per-band ATH energies for one sample rate
#[derive(Debug, Clone)]
pub struct AthTables {
    pub l: [f32; SBMAX_L],
    pub s: [f32; SBMAX_S],
    /// ATH minimum in dB, used when scaling the adjustment
    pub floor: f32,
}

impl AthTables {
    pub fn new(sample_rate: u32, sfb: &ScaleFactorBands, offset_db: f32, enabled: bool) -> Self {
        let sr = sample_rate as f32;
        let mut l = [f32::MAX; SBMAX_L];
        for (band, ath) in l.iter_mut().enumerate() {
            for i in sfb.l[band]..sfb.l[band + 1] {
                let freq = i as f32 * sr / (2.0 * GRANULE_SIZE as f32);
                *ath = ath.min(ath_mdct(freq, offset_db));
            }
        }

        let mut s = [f32::MAX; SBMAX_S];
        for (band, ath) in s.iter_mut().enumerate() {
            for i in sfb.s[band]..sfb.s[band + 1] {
                let freq = i as f32 * sr / (2.0 * 192.0);
                *ath = ath.min(ath_mdct(freq, offset_db));
            }
            *ath *= (sfb.s[band + 1] - sfb.s[band]) as f32;
        }

        if !enabled {
            l = [1e-20; SBMAX_L];
            s = [1e-20; SBMAX_S];
        }

        Self { l, s, floor: 10.0 * ath_mdct(-1.0, offset_db).log10() }
    }

    /// Scale an ATH energy by the loudness adjustment `a`. The dB distance to
    /// the floor shrinks as the signal gets quieter.
    pub fn adjusted(&self, a: f32, x: f32) -> f32 {
        const O: f32 = 90.308_733_62;
        const P: f32 = 94.824_448_63;
        let mut u = 10.0 * x.log10() - self.floor;
        let v = a * a;
        let mut w = 0.0;
        if v > 1e-20 {
            w = 1.0 + v.log10() * 10.0 / O;
        }
        if w < 0.0 {
            w = 0.0;
        }
        u *= w;
        u += self.floor + O - P;
        10f32.powf(0.1 * u)
    }
}

/// Loudness-driven ATH attenuation carried across frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AthAdjust {
    pub factor: f32,
    pub limit: f32,
}

impl Default for AthAdjust {
    fn default() -> Self {
        Self { factor: 1.0, limit: 1.0 }
    }
}

impl AthAdjust {
    /// Update from the squared loudness of each granule/channel of the frame.
    /// Rises to the new limit immediately, decays towards it gradually.
    pub fn update(&mut self, loudness_sq: &[[f32; 2]; 2], channels: usize, mode_gr: usize, enabled: bool) {
        if !enabled {
            self.factor = 1.0;
            return;
        }

        let mut max_pow = loudness_sq[0][0];
        let mut gr2_max = loudness_sq[1][0];
        if channels == 2 {
            max_pow += loudness_sq[0][1];
            gr2_max += loudness_sq[1][1];
        } else {
            max_pow += max_pow;
            gr2_max += gr2_max;
        }
        if mode_gr == 2 {
            max_pow = max_pow.max(gr2_max);
        }
        max_pow *= 0.5;

        if max_pow > 0.03125 {
            if self.factor >= 1.0 {
                self.factor = 1.0;
            } else if self.factor < self.limit {
                self.factor = self.limit;
            }
            self.limit = 1.0;
        } else {
            let new_limit = 31.98 * max_pow + 0.000625;
            if self.factor >= new_limit {
                self.factor *= new_limit * 0.075 + 0.925;
                if self.factor < new_limit {
                    self.factor = new_limit;
                }
            } else if self.limit >= new_limit {
                self.factor = new_limit;
            } else if self.factor < self.limit {
                self.factor = self.limit;
            }
            self.limit = new_limit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::SFB_INDEX;
    use proptest::prelude::*;

    #[test]
    fn test_ath_minimum_near_3khz() {
        let min = ath_formula(-1.0);
        assert!(ath_formula(100.0) > min);
        assert!(ath_formula(15000.0) > min);
        assert!(min < 0.0);
    }

    #[test]
    fn test_tables_follow_the_curve() {
        let ath = AthTables::new(44100, &SFB_INDEX[0], 0.0, true);
        // Highest bands need more energy than the 3 kHz region
        assert!(ath.l[21] > ath.l[10]);
        assert!(ath.l.iter().all(|&v| v > 0.0 && v < 1.0));
        let quiet = AthTables::new(44100, &SFB_INDEX[0], -10.0, true);
        assert!(quiet.l[5] < ath.l[5]);
        let off = AthTables::new(44100, &SFB_INDEX[0], 0.0, false);
        assert_eq!(off.l[0], 1e-20);
    }

    #[test]
    fn test_full_adjust_keeps_threshold_near_floor_offset() {
        let ath = AthTables::new(44100, &SFB_INDEX[0], 0.0, true);
        let x = ath.l[8];
        let full = ath.adjusted(1.0, x);
        let quiet = ath.adjusted(0.01, x);
        assert!(quiet < full);
        assert!(full > 0.0);
    }

    #[test]
    fn test_loud_frame_resets_factor() {
        let mut adjust = AthAdjust { factor: 0.2, limit: 0.5 };
        adjust.update(&[[1.0, 1.0], [1.0, 1.0]], 2, 2, true);
        assert_eq!(adjust.factor, 0.5);
        assert_eq!(adjust.limit, 1.0);
        adjust.update(&[[1.0, 1.0], [1.0, 1.0]], 2, 2, true);
        assert_eq!(adjust.factor, 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 50,
            verbose: 0,
            max_shrink_iters: 0,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_adjust_factor_stays_in_range(frames in prop::collection::vec(0.0f32..0.05, 1..40)) {
            let mut adjust = AthAdjust::default();
            for l in frames {
                adjust.update(&[[l, l], [l, l]], 2, 2, true);
                prop_assert!(adjust.factor > 0.0 && adjust.factor <= 1.0);
                prop_assert!(adjust.limit > 0.0 && adjust.limit <= 1.0);
            }
        }
    }
}
