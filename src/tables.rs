//! Lookup tables and constants for Layer III quantization
//!
//! Static tables (sample rates, bitrates, scalefactor band partitions, slen
//! tables) are plain constants. The power tables used by the quantizer are
//! built once by `lazy_static!` initializers and are read-only afterwards, so
//! every encoder instance shares them without any mutable global state.

use lazy_static::lazy_static;

/// Largest quantized magnitude representable with table 31 escape bits
pub const IXMAX_VAL: i32 = 8206;
/// Size of the `pow43`/`adj43` tables
pub const PRECALC_SIZE: usize = IXMAX_VAL as usize + 2;
/// Upper end of the quantizer step domain
pub const Q_MAX: usize = 256 + 1;
/// Extra room below zero for heavily amplified bands
pub const Q_MAX2: usize = 116;

/// Sample rates, indexed by session samplerate index
pub const SAMPLE_RATES: [u32; 9] = [
    44100, 48000, 32000, // MPEG-1
    22050, 24000, 16000, // MPEG-2
    11025, 12000, 8000, // MPEG-2.5
];

/// Bitrates in kbps, `[version][bitrate_index]` with version 0 = MPEG-2,
/// 1 = MPEG-1, 2 = MPEG-2.5. Index 0 is free format, -1 is forbidden.
pub const BITRATE_TABLE: [[i32; 16]; 3] = [
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, -1],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, -1],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, -1, -1, -1, -1, -1, -1, -1],
];

/// Scalefactor band boundaries for one sample rate
#[derive(Debug, Clone, Copy)]
pub struct ScaleFactorBands {
    /// Long block boundaries, 22 bands
    pub l: [usize; 23],
    /// Short block boundaries per window, 13 bands
    pub s: [usize; 14],
}

/// Scalefactor band partitions, indexed like `SAMPLE_RATES`
pub const SFB_INDEX: [ScaleFactorBands; 9] = [
    // 44.1 kHz
    ScaleFactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 52, 62, 74, 90, 110, 134, 162, 196, 238, 288, 342, 418, 576],
        s: [0, 4, 8, 12, 16, 22, 30, 40, 52, 66, 84, 106, 136, 192],
    },
    // 48 kHz
    ScaleFactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 42, 50, 60, 72, 88, 106, 128, 156, 190, 230, 276, 330, 384, 576],
        s: [0, 4, 8, 12, 16, 22, 28, 38, 50, 64, 80, 100, 126, 192],
    },
    // 32 kHz
    ScaleFactorBands {
        l: [0, 4, 8, 12, 16, 20, 24, 30, 36, 44, 54, 66, 82, 102, 126, 156, 194, 240, 296, 364, 448, 550, 576],
        s: [0, 4, 8, 12, 16, 22, 30, 42, 58, 78, 104, 138, 180, 192],
    },
    // 22.05 kHz
    ScaleFactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 24, 32, 42, 56, 74, 100, 132, 174, 192],
    },
    // 24 kHz
    ScaleFactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 114, 136, 162, 194, 232, 278, 330, 394, 464, 540, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 136, 180, 192],
    },
    // 16 kHz
    ScaleFactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 11.025 kHz
    ScaleFactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 12 kHz
    ScaleFactorBands {
        l: [0, 6, 12, 18, 24, 30, 36, 44, 54, 66, 80, 96, 116, 140, 168, 200, 238, 284, 336, 396, 464, 522, 576],
        s: [0, 4, 8, 12, 18, 26, 36, 48, 62, 80, 104, 134, 174, 192],
    },
    // 8 kHz
    ScaleFactorBands {
        l: [0, 12, 24, 36, 48, 60, 72, 88, 108, 132, 160, 192, 232, 280, 336, 400, 476, 566, 568, 570, 572, 574, 576],
        s: [0, 8, 16, 24, 36, 52, 72, 96, 124, 160, 162, 164, 166, 192],
    },
];

/// Bits per scalefactor for bands 0..11 (MPEG-1), indexed by scalefac_compress
pub const SLEN1_TAB: [u32; 16] = [0, 0, 0, 0, 3, 1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4];
/// Bits per scalefactor for bands 11..21 (MPEG-1), indexed by scalefac_compress
pub const SLEN2_TAB: [u32; 16] = [0, 1, 2, 3, 0, 1, 2, 3, 1, 2, 3, 1, 2, 3, 2, 3];

/// Pre-emphasis added to long block scalefactors when `preflag` is set
pub const PRETAB: [i32; 22] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 3, 3, 3, 2, 0];

/// Scalefactor bits for long blocks (MPEG-1), indexed by scalefac_compress
pub const SCALE_LONG: [u32; 16] = [0, 10, 20, 30, 33, 21, 31, 41, 32, 42, 52, 43, 53, 63, 64, 74];
/// Scalefactor bits for short blocks (MPEG-1)
pub const SCALE_SHORT: [u32; 16] = [0, 18, 36, 54, 54, 36, 54, 72, 54, 72, 90, 72, 90, 108, 108, 126];
/// Scalefactor bits for mixed blocks (MPEG-1)
pub const SCALE_MIXED: [u32; 16] = [0, 18, 36, 54, 51, 35, 53, 71, 52, 70, 88, 69, 87, 105, 104, 122];

/// MPEG-2 scalefactor partition sizes `[table][block kind][partition]`,
/// block kind 0 = long, 1 = short, 2 = mixed
pub const NR_OF_SFB_BLOCK: [[[usize; 4]; 3]; 6] = [
    [[6, 5, 5, 5], [9, 9, 9, 9], [6, 9, 9, 9]],
    [[6, 5, 7, 3], [9, 9, 12, 6], [6, 9, 12, 6]],
    [[11, 10, 0, 0], [18, 18, 0, 0], [15, 18, 0, 0]],
    [[7, 7, 7, 0], [12, 12, 12, 0], [6, 15, 12, 0]],
    [[6, 6, 6, 3], [12, 9, 9, 6], [6, 12, 9, 6]],
    [[8, 8, 5, 0], [15, 12, 9, 0], [6, 18, 9, 0]],
];

/// Largest scalefactor per MPEG-2 partition for each `NR_OF_SFB_BLOCK` table
pub const MAX_RANGE_SFAC_TAB: [[i32; 4]; 6] = [
    [15, 15, 7, 7],
    [15, 15, 7, 0],
    [7, 3, 0, 0],
    [15, 31, 31, 0],
    [7, 7, 7, 0],
    [3, 3, 0, 0],
];

/// Bits needed to store values up to the index
pub const LOG2TAB: [u32; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];

/// region0/region1 split per number of big_values bands
pub const SUBDV_TABLE: [(usize, usize); 23] = [
    (0, 0), (0, 0), (0, 0), (0, 0), (0, 0), (0, 1), (1, 1), (1, 1),
    (1, 2), (2, 2), (2, 3), (2, 3), (3, 4), (3, 4), (3, 4), (4, 5),
    (4, 5), (4, 6), (5, 6), (5, 6), (5, 7), (6, 7), (6, 7),
];

lazy_static! {
    /// `i^(4/3)` for every representable quantized magnitude
    pub static ref POW43: Vec<f32> = (0..PRECALC_SIZE)
        .map(|i| (i as f64).powf(4.0 / 3.0) as f32)
        .collect();

    /// Rounding offsets: adding `adj43[floor(x)]` to `x` and truncating picks the
    /// magnitude whose `4/3` power is nearest
    pub static ref ADJ43: Vec<f32> = (0..PRECALC_SIZE)
        .map(|i| {
            if i + 1 < PRECALC_SIZE {
                let lo = (i as f64).powf(4.0 / 3.0);
                let hi = ((i + 1) as f64).powf(4.0 / 3.0);
                ((i + 1) as f64 - (0.5 * (lo + hi)).powf(0.75)) as f32
            } else {
                0.5
            }
        })
        .collect();

    /// Step size `2^((q - 210) / 4)`, offset by `Q_MAX2`
    pub static ref POW20: Vec<f32> = (0..Q_MAX + Q_MAX2 + 1)
        .map(|i| 2f64.powf((i as f64 - 210.0 - Q_MAX2 as f64) * 0.25) as f32)
        .collect();

    /// Inverse step size in the `3/4` power domain, `2^(-(q - 210) * 3 / 16)`
    pub static ref IPOW20: Vec<f32> = (0..Q_MAX)
        .map(|i| 2f64.powf((i as f64 - 210.0) * -0.1875) as f32)
        .collect();
}

/// Step size for an effective quantizer index (may be negative after amplification)
#[inline]
pub fn pow20(q: i32) -> f32 {
    let idx = (q + Q_MAX2 as i32).clamp(0, (Q_MAX + Q_MAX2) as i32);
    POW20[idx as usize]
}

/// Inverse step size in the xrpow domain for a global gain
#[inline]
pub fn ipow20(q: i32) -> f32 {
    IPOW20[q.clamp(0, Q_MAX as i32 - 1) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_band_tables_are_monotonic() {
        for bands in SFB_INDEX.iter() {
            assert!(bands.l.windows(2).all(|w| w[0] < w[1]));
            assert!(bands.s.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(bands.l[22], 576);
            assert_eq!(bands.s[13], 192);
        }
    }

    #[test]
    fn test_power_table_anchors() {
        assert_eq!(POW43[0], 0.0);
        assert_eq!(POW43[1], 1.0);
        assert!((POW43[8] - 16.0).abs() < 1e-4);
        assert!((pow20(210) - 1.0).abs() < 1e-6);
        assert!((ipow20(210) - 1.0).abs() < 1e-6);
        assert_eq!(POW20.len(), Q_MAX + Q_MAX2 + 1);
    }

    #[test]
    fn test_nr_of_sfb_block_matches_band_count() {
        for table in NR_OF_SFB_BLOCK.iter() {
            assert_eq!(table[0].iter().sum::<usize>(), 21);
            assert_eq!(table[1].iter().sum::<usize>(), 36);
        }
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
        fn property_step_size_decreases_with_gain(q in -116i32..=255) {
            prop_assert!(pow20(q) < pow20(q + 1));
            if q >= 0 && q < 255 {
                prop_assert!(ipow20(q) > ipow20(q + 1));
            }
        }

        #[test]
        fn property_adj43_rounds_to_nearest_in_power_domain(x in 0.0f64..8000.0) {
            let base = x.floor() as usize;
            let ix = (x as f32 + ADJ43[base]) as usize;
            let target = x.powf(4.0 / 3.0);
            let err = |i: usize| ((i as f64).powf(4.0 / 3.0) - target).abs();
            prop_assert!(ix == base || ix == base + 1);
            let other = if ix == base { base + 1 } else { base };
            prop_assert!(err(ix) <= err(other) + 1e-2 * target.max(1.0));
        }
    }
}
