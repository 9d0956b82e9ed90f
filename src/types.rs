//! Type definitions for Layer III quantization
//!
//! `GrInfo` carries one channel's state for one granule, `SideInfo` holds a
//! whole frame. Short block spectra and per-band arrays use the scalefactor
//! band scan order of the bitstream: band-major, then window, then line.

pub const GRANULE_SIZE: usize = 576;
pub const MAX_CHANNELS: usize = 2;
pub const MAX_GRANULES: usize = 2;

/// Long block scalefactor bands
pub const SBMAX_L: usize = 22;
/// Short block scalefactor bands
pub const SBMAX_S: usize = 13;
/// Long bands carrying a scalefactor
pub const SBPSY_L: usize = 21;
/// Short bands carrying a scalefactor
pub const SBPSY_S: usize = 12;
/// Largest number of per-band entries in a granule (13 short bands x 3 windows)
pub const SFBMAX: usize = SBMAX_S * 3;

/// Hard format ceiling for one channel of one granule (12-bit part2_3_length)
pub const MAX_BITS_PER_CHANNEL: i32 = 4095;
/// Hard format ceiling for all channels of one granule
pub const MAX_BITS_PER_GRANULE: i32 = 7680;
/// Bit count reported for quantizations outside the Huffman range
pub const LARGE_BITS: i32 = 100000;

/// Window sequence of a granule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "diagnostics", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    #[default]
    Normal = 0,
    Start = 1,
    Short = 2,
    Stop = 3,
}

impl BlockType {
    pub fn is_short(self) -> bool {
        self == BlockType::Short
    }
}

/// One channel of one granule
#[derive(Debug, Clone)]
pub struct GrInfo {
    /// Spectral coefficients
    pub xr: [f32; GRANULE_SIZE],
    /// Quantized magnitudes; signs are taken from `xr` when writing
    pub l3_enc: [i32; GRANULE_SIZE],
    /// Never negative outside `best_scalefac_store`. Groups shared with
    /// granule 0 hold granule 0's values and are flagged in `SideInfo::scfsi`.
    pub scalefac: [i32; SFBMAX],
    pub xrpow_max: f32,
    /// Huffman coded bits (big_values + count1)
    pub part2_3_length: i32,
    pub big_values: i32,
    pub count1: i32,
    pub global_gain: i32,
    pub scalefac_compress: i32,
    pub block_type: BlockType,
    pub mixed_block_flag: bool,
    pub table_select: [i32; 3],
    /// Indexed by `window[sfb]`; slot 3 belongs to long bands and stays 0
    pub subblock_gain: [i32; 4],
    pub region0_count: i32,
    pub region1_count: i32,
    pub preflag: i32,
    pub scalefac_scale: i32,
    pub count1table_select: i32,
    /// Scalefactor bits
    pub part2_length: i32,
    pub sfb_lmax: usize,
    pub sfb_smin: usize,
    pub psy_lmax: usize,
    pub sfbmax: usize,
    pub psymax: usize,
    pub sfbdivide: usize,
    pub width: [usize; SFBMAX],
    pub window: [usize; SFBMAX],
    pub count1bits: i32,
    /// Scalefactor bit lengths per partition (MPEG-2)
    pub slen: [u32; 4],
    /// `NR_OF_SFB_BLOCK` table chosen for MPEG-2 scalefactor packing
    pub partition_table: usize,
    pub max_nonzero_coeff: usize,
    /// Per-band "some coefficient is above the ATH floor" flags
    pub energy_above_cutoff: [bool; SFBMAX],
}

impl Default for GrInfo {
    fn default() -> Self {
        Self {
            xr: [0.0; GRANULE_SIZE],
            l3_enc: [0; GRANULE_SIZE],
            scalefac: [0; SFBMAX],
            xrpow_max: 0.0,
            part2_3_length: 0,
            big_values: 0,
            count1: 0,
            global_gain: 210,
            scalefac_compress: 0,
            block_type: BlockType::Normal,
            mixed_block_flag: false,
            table_select: [0; 3],
            subblock_gain: [0; 4],
            region0_count: 0,
            region1_count: 0,
            preflag: 0,
            scalefac_scale: 0,
            count1table_select: 0,
            part2_length: 0,
            sfb_lmax: SBPSY_L,
            sfb_smin: SBPSY_S,
            psy_lmax: SBPSY_L,
            sfbmax: SBPSY_L,
            psymax: SBPSY_L,
            sfbdivide: 11,
            width: [0; SFBMAX],
            window: [3; SFBMAX],
            count1bits: 0,
            slen: [0; 4],
            partition_table: 0,
            max_nonzero_coeff: GRANULE_SIZE - 1,
            energy_above_cutoff: [false; SFBMAX],
        }
    }
}

impl GrInfo {
    /// Clear the search state while keeping spectrum and band layout
    pub fn reset_search(&mut self) {
        self.l3_enc = [0; GRANULE_SIZE];
        self.scalefac = [0; SFBMAX];
        self.part2_3_length = 0;
        self.part2_length = 0;
        self.big_values = 0;
        self.count1 = 0;
        self.global_gain = 210;
        self.scalefac_compress = 0;
        self.table_select = [0; 3];
        self.subblock_gain = [0; 4];
        self.region0_count = 0;
        self.region1_count = 0;
        self.preflag = 0;
        self.scalefac_scale = 0;
        self.count1table_select = 0;
        self.count1bits = 0;
        self.slen = [0; 4];
        self.partition_table = 0;
    }

    /// Effective quantizer index of a band: global gain minus scalefactor
    /// amplification and subblock gain
    #[inline]
    pub fn band_gain(&self, sfb: usize) -> i32 {
        let pre = if self.preflag != 0 && sfb < crate::tables::PRETAB.len() {
            crate::tables::PRETAB[sfb]
        } else {
            0
        };
        self.global_gain
            - ((self.scalefac[sfb] + pre) << (self.scalefac_scale + 1))
            - self.subblock_gain[self.window[sfb]] * 8
    }

    /// Total bits this granule contributes to main data
    pub fn main_data_bits(&self) -> i32 {
        self.part2_3_length + self.part2_length
    }
}

/// Side information for one frame
#[derive(Debug, Clone)]
pub struct SideInfo {
    pub tt: [[GrInfo; MAX_CHANNELS]; MAX_GRANULES],
    /// Back-pointer into the reservoir, in bytes
    pub main_data_begin: i32,
    pub private_bits: i32,
    /// Ancillary bits stuffed before this frame's main data (in the previous frame)
    pub resv_drain_pre: i32,
    /// Ancillary bits stuffed after this frame's main data
    pub resv_drain_post: i32,
    pub scfsi: [[i32; 4]; MAX_CHANNELS],
}

impl Default for SideInfo {
    fn default() -> Self {
        Self {
            tt: Default::default(),
            main_data_begin: 0,
            private_bits: 0,
            resv_drain_pre: 0,
            resv_drain_post: 0,
            scfsi: [[0; 4]; MAX_CHANNELS],
        }
    }
}

/// Per-band values for long and short blocks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsyXmin {
    pub l: [f32; SBMAX_L],
    pub s: [[f32; 3]; SBMAX_S],
}

/// Masking threshold and energy from the psychoacoustic model
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsyRatio {
    pub thm: PsyXmin,
    pub en: PsyXmin,
}

/// Summary of one noise evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalcNoiseResult {
    /// Bands whose noise exceeds the allowed distortion
    pub over_count: i32,
    /// Sum of positive log10 distortion ratios
    pub over_noise: f32,
    /// Sum of log10 distortion ratios over all bands
    pub tot_noise: f32,
    /// Worst single band
    pub max_noise: f32,
    /// Squared integer-scaled excess, used to rank imperfect solutions
    pub over_ssd: i32,
    /// Bits of the quantization this result belongs to
    pub bits: i32,
}

impl Default for CalcNoiseResult {
    fn default() -> Self {
        Self {
            over_count: 100,
            over_noise: 0.0,
            tot_noise: 0.0,
            max_noise: -20.0,
            over_ssd: i32::MAX,
            bits: 0,
        }
    }
}

/// Cached noise of one band. Valid while the global gain and the band's
/// effective gain are both unchanged, since together they pin down the
/// band's amplification and quantized values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandNoise {
    /// `(global_gain, band_gain)` the entry was computed for, `None` when stale
    pub key: Option<(i32, i32)>,
    pub noise: f32,
    pub noise_log: f32,
}

impl Default for BandNoise {
    fn default() -> Self {
        Self { key: None, noise: 0.0, noise_log: 0.0 }
    }
}

/// Noise memo for one granule search
#[derive(Debug, Clone)]
pub struct NoiseMemo {
    pub bands: [BandNoise; SFBMAX],
}

impl Default for NoiseMemo {
    fn default() -> Self {
        Self { bands: [BandNoise::default(); SFBMAX] }
    }
}

impl NoiseMemo {
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// A quantization snapshot kept as the best solution found so far
#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub gi: GrInfo,
    pub xrpow: [f32; GRANULE_SIZE],
    pub noise: CalcNoiseResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_gain_applies_scalefactors() {
        let mut gi = GrInfo::default();
        gi.global_gain = 200;
        gi.scalefac[3] = 2;
        assert_eq!(gi.band_gain(3), 196);
        gi.scalefac_scale = 1;
        assert_eq!(gi.band_gain(3), 192);
        gi.preflag = 1;
        // pretab is 1 at band 11
        gi.scalefac[11] = 0;
        assert_eq!(gi.band_gain(11), 196);
    }

    #[test]
    fn test_subblock_gain_only_touches_short_windows() {
        let mut gi = GrInfo::default();
        gi.global_gain = 150;
        gi.subblock_gain = [1, 2, 3, 0];
        gi.window[0] = 1;
        gi.window[1] = 3;
        assert_eq!(gi.band_gain(0), 150 - 16);
        assert_eq!(gi.band_gain(1), 150);
    }

    #[test]
    fn test_default_noise_result_loses_to_anything() {
        let r = CalcNoiseResult::default();
        assert_eq!(r.over_ssd, i32::MAX);
        assert!(r.over_count > 0);
    }
}
