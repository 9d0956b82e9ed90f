//! Configuration management for the Layer III encoder core
//!
//! `EncoderConfig` is what the caller fills in. It is validated once and turned
//! into a `SessionConfig`, which holds every derived, read-only value the
//! quantization loops need during a frame (granule count, side info length,
//! scalefactor partitions, ATH tables, bitrate index range).

use crate::ath::AthTables;
use crate::error::{ConfigError, ConfigResult};
use crate::tables::{ScaleFactorBands, BITRATE_TABLE, SAMPLE_RATES, SFB_INDEX, SUBDV_TABLE};
use crate::types::{GRANULE_SIZE, SBMAX_L, SBMAX_S};

/// Largest frame the format allows, in bytes
pub const MAX_FRAME_BYTES: usize = 2880;

/// Stereo encoding modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StereoMode {
    /// Independent left/right channels
    Stereo,
    /// Left/right or mid/side, decided per frame upstream
    JointStereo,
    /// Single channel
    Mono,
}

/// Pre-emphasis modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emphasis {
    None = 0,
    Emphasis50_15 = 1,
    CcittJ17 = 3,
}

/// MPEG version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

impl MpegVersion {
    pub fn from_sample_rate(sample_rate: u32) -> Option<Self> {
        match sample_rate {
            44100 | 48000 | 32000 => Some(MpegVersion::Mpeg1),
            22050 | 24000 | 16000 => Some(MpegVersion::Mpeg2),
            11025 | 12000 | 8000 => Some(MpegVersion::Mpeg25),
            _ => None,
        }
    }

    /// Row of `BITRATE_TABLE`
    pub fn table_row(self) -> usize {
        match self {
            MpegVersion::Mpeg2 => 0,
            MpegVersion::Mpeg1 => 1,
            MpegVersion::Mpeg25 => 2,
        }
    }

    /// Two-bit version field of the frame header
    pub fn header_bits(self) -> u32 {
        match self {
            MpegVersion::Mpeg1 => 3,
            MpegVersion::Mpeg2 => 2,
            MpegVersion::Mpeg25 => 0,
        }
    }

    /// Granules per frame
    pub fn granules(self) -> usize {
        match self {
            MpegVersion::Mpeg1 => 2,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 1,
        }
    }
}

/// Variable bitrate search flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbrMode {
    /// Per-granule bisection over the bit count
    Old,
    /// Per-band scalefactor search over the whole frame
    New,
}

/// Rate control strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    /// Constant bitrate
    Cbr { kbps: u32 },
    /// Average bitrate, frames chosen between `min_kbps` and `max_kbps`
    Abr { kbps: u32, min_kbps: u32, max_kbps: u32 },
    /// Variable bitrate at a quality level 0 (best) ..= 9
    Vbr { mode: VbrMode, quality: u8, min_kbps: u32, max_kbps: u32 },
}

/// Criterion used to decide whether a new quantization beats the best one so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantCompare {
    /// Lower `over_ssd`, ties broken by lower `over_noise`
    #[default]
    OverSsd,
    /// Fewer distorted bands, then less over noise, then less total noise
    Iso,
    /// Lower worst-band noise
    MaxNoise,
    /// Lower total noise
    TotNoise,
    /// Lower total and lower worst-band noise
    TotAndMax,
    /// Lower over noise, then lower total noise
    OverNoise,
    /// SSD while distorted, then noise weighted against bits
    Bits,
}

/// Per-region tonality adjustment of the masking threshold, in dB
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BandAdjust {
    pub bass_db: f32,
    pub alto_db: f32,
    pub treble_db: f32,
    pub sfb21_db: f32,
}

/// Encoder configuration supplied by the caller
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (1 or 2)
    pub channels: u8,
    pub mode: StereoMode,
    pub rate: RateMode,
    /// 0 = gain search only, 1 = amplify scalefactors, 2 = also try scalefac_scale early
    pub noise_shaping: u8,
    /// Amplification policy: 0 = all distorted bands, 1 = bands near the worst, 2 = worst band
    pub noise_shaping_amp: u8,
    /// 0 = keep searching a few rounds after masking is reached, 1 = stop at once
    pub noise_shaping_stop: u8,
    /// Bit 0 trims isolated small spectral values, bit 1 widens the search
    pub substep_shaping: u8,
    pub quant_comp: QuantCompare,
    pub quant_comp_short: QuantCompare,
    pub disable_reservoir: bool,
    /// Use the ISO decoder buffer size instead of the common 1440-byte one
    pub strict_iso: bool,
    /// Lowers the ATH by this many dB
    pub ath_lower_db: f32,
    pub use_ath: bool,
    /// Adapt the ATH to the loudness of the signal
    pub ath_adjust: bool,
    pub band_adjust: BandAdjust,
    pub emphasis: Emphasis,
    pub copyright: bool,
    pub original: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            mode: StereoMode::JointStereo,
            rate: RateMode::Cbr { kbps: 128 },
            noise_shaping: 1,
            noise_shaping_amp: 1,
            noise_shaping_stop: 0,
            substep_shaping: 0,
            quant_comp: QuantCompare::OverSsd,
            quant_comp_short: QuantCompare::OverSsd,
            disable_reservoir: false,
            strict_iso: false,
            ath_lower_db: 0.0,
            use_ath: true,
            ath_adjust: true,
            band_adjust: BandAdjust::default(),
            emphasis: Emphasis::None,
            copyright: false,
            original: true,
        }
    }
}

impl EncoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set the channel count and the matching default stereo mode
    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self.mode = if channels == 1 { StereoMode::Mono } else { StereoMode::JointStereo };
        self
    }

    pub fn with_mode(mut self, mode: StereoMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rate(mut self, rate: RateMode) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_noise_shaping(mut self, shaping: u8, amp: u8, stop: u8) -> Self {
        self.noise_shaping = shaping;
        self.noise_shaping_amp = amp;
        self.noise_shaping_stop = stop;
        self
    }

    pub fn with_quant_compare(mut self, long: QuantCompare, short: QuantCompare) -> Self {
        self.quant_comp = long;
        self.quant_comp_short = short;
        self
    }

    pub fn with_reservoir(mut self, enabled: bool) -> Self {
        self.disable_reservoir = !enabled;
        self
    }

    pub fn with_strict_iso(mut self, strict: bool) -> Self {
        self.strict_iso = strict;
        self
    }

    pub fn with_substep_shaping(mut self, substep: u8) -> Self {
        self.substep_shaping = substep;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let version = MpegVersion::from_sample_rate(self.sample_rate)
            .ok_or(ConfigError::UnsupportedSampleRate(self.sample_rate))?;

        if self.channels == 0 || self.channels > 2 {
            return Err(ConfigError::InvalidChannels(self.channels));
        }

        match (self.channels, self.mode) {
            (1, StereoMode::Mono) | (2, StereoMode::Stereo | StereoMode::JointStereo) => {}
            (channels, mode) => {
                return Err(ConfigError::InvalidStereoMode {
                    mode: format!("{:?}", mode),
                    channels,
                })
            }
        }

        match self.rate {
            RateMode::Cbr { kbps } => {
                bitrate_index(version, self.sample_rate, kbps)?;
            }
            RateMode::Abr { kbps, min_kbps, max_kbps } => {
                bitrate_range(version, self.sample_rate, min_kbps, max_kbps)?;
                if !(8..=320).contains(&kbps) {
                    return Err(ConfigError::UnsupportedBitrate(kbps));
                }
                if kbps < min_kbps || kbps > max_kbps {
                    return Err(ConfigError::InvalidBitrateRange { min: min_kbps, max: max_kbps });
                }
            }
            RateMode::Vbr { quality, min_kbps, max_kbps, .. } => {
                if quality > 9 {
                    return Err(ConfigError::InvalidQuality(quality));
                }
                bitrate_range(version, self.sample_rate, min_kbps, max_kbps)?;
            }
        }

        if self.noise_shaping > 2 {
            return Err(ConfigError::InvalidNoiseShaping { name: "noise_shaping", value: self.noise_shaping });
        }
        if self.noise_shaping_amp > 2 {
            return Err(ConfigError::InvalidNoiseShaping {
                name: "noise_shaping_amp",
                value: self.noise_shaping_amp,
            });
        }
        if self.noise_shaping_stop > 1 {
            return Err(ConfigError::InvalidNoiseShaping {
                name: "noise_shaping_stop",
                value: self.noise_shaping_stop,
            });
        }
        if self.substep_shaping > 3 {
            return Err(ConfigError::InvalidNoiseShaping {
                name: "substep_shaping",
                value: self.substep_shaping,
            });
        }

        let (_, max_index) = self.index_range(version)?;
        let frame_bytes = frame_bytes(version, self.sample_rate, max_index, true);
        if frame_bytes > MAX_FRAME_BYTES {
            return Err(ConfigError::FrameTooLarge { frame_bytes, max_bytes: MAX_FRAME_BYTES });
        }

        Ok(())
    }

    fn index_range(&self, version: MpegVersion) -> ConfigResult<(usize, usize)> {
        match self.rate {
            RateMode::Cbr { kbps } => {
                let index = bitrate_index(version, self.sample_rate, kbps)?;
                Ok((index, index))
            }
            RateMode::Abr { min_kbps, max_kbps, .. } | RateMode::Vbr { min_kbps, max_kbps, .. } => {
                bitrate_range(version, self.sample_rate, min_kbps, max_kbps)
            }
        }
    }
}

/// Look up the header bitrate index of `kbps`
pub fn bitrate_index(version: MpegVersion, sample_rate: u32, kbps: u32) -> ConfigResult<usize> {
    let row = &BITRATE_TABLE[version.table_row()];
    if let Some(index) = (1..15).find(|&i| row[i] > 0 && row[i] as u32 == kbps) {
        return Ok(index);
    }
    let known = BITRATE_TABLE
        .iter()
        .any(|r| r[1..15].iter().any(|&b| b > 0 && b as u32 == kbps));
    if known {
        Err(ConfigError::IncompatibleRateCombination { sample_rate, bitrate: kbps })
    } else {
        Err(ConfigError::UnsupportedBitrate(kbps))
    }
}

fn bitrate_range(version: MpegVersion, sample_rate: u32, min: u32, max: u32) -> ConfigResult<(usize, usize)> {
    let lo = bitrate_index(version, sample_rate, min)?;
    let hi = bitrate_index(version, sample_rate, max)?;
    if lo > hi {
        return Err(ConfigError::InvalidBitrateRange { min, max });
    }
    Ok((lo, hi))
}

fn frame_bytes(version: MpegVersion, sample_rate: u32, index: usize, padding: bool) -> usize {
    let kbps = BITRATE_TABLE[version.table_row()][index].max(0) as usize;
    let scale = if version == MpegVersion::Mpeg1 { 2 } else { 1 };
    scale * 72000 * kbps / sample_rate as usize + usize::from(padding)
}

/// Values derived once from `EncoderConfig` and read-only while encoding
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub version: MpegVersion,
    pub sample_rate: u32,
    /// Index into `SAMPLE_RATES` / `SFB_INDEX`
    pub samplerate_index: usize,
    pub channels: usize,
    pub mode: StereoMode,
    /// Granules per frame
    pub mode_gr: usize,
    /// Header plus side info, in bytes
    pub sideinfo_len: usize,
    pub rate: RateMode,
    /// Header bitrate index of a CBR stream (the ABR/VBR maximum otherwise)
    pub bitrate_index: usize,
    pub vbr_min_index: usize,
    pub vbr_max_index: usize,
    pub avg_bitrate_kbps: u32,
    pub compression_ratio: f32,
    /// Decoder buffer size in bits
    pub buffer_constraint: i32,
    pub disable_reservoir: bool,
    pub sfb: ScaleFactorBands,
    /// region0/region1 counts for normal blocks, indexed by `big_values - 2`
    /// and `big_values - 1`
    pub bv_scf: [usize; GRANULE_SIZE],
    pub ath: AthTables,
    pub ath_adjust: bool,
    pub longfact: [f32; SBMAX_L],
    pub shortfact: [f32; SBMAX_S],
    pub mask_adjust_db: f32,
    pub mask_adjust_short_db: f32,
    pub noise_shaping: u8,
    pub noise_shaping_amp: u8,
    pub noise_shaping_stop: u8,
    pub substep_shaping: u8,
    pub quant_comp: QuantCompare,
    pub quant_comp_short: QuantCompare,
    pub emphasis: Emphasis,
    pub copyright: bool,
    pub original: bool,
}

impl SessionConfig {
    /// Validate `config` and derive the session values
    pub fn from_config(config: &EncoderConfig) -> ConfigResult<Self> {
        config.validate()?;

        let version = MpegVersion::from_sample_rate(config.sample_rate)
            .ok_or(ConfigError::UnsupportedSampleRate(config.sample_rate))?;
        let samplerate_index = SAMPLE_RATES
            .iter()
            .position(|&sr| sr == config.sample_rate)
            .ok_or(ConfigError::UnsupportedSampleRate(config.sample_rate))?;
        let channels = config.channels as usize;
        let mode_gr = version.granules();

        let sideinfo_len = match (version, channels) {
            (MpegVersion::Mpeg1, 1) => 4 + 17,
            (MpegVersion::Mpeg1, _) => 4 + 32,
            (_, 1) => 4 + 9,
            (_, _) => 4 + 17,
        };

        let (vbr_min_index, vbr_max_index) = config.index_range(version)?;
        let avg_bitrate_kbps = match config.rate {
            RateMode::Cbr { kbps } | RateMode::Abr { kbps, .. } => kbps,
            RateMode::Vbr { max_kbps, .. } => max_kbps,
        };
        let compression_ratio =
            config.sample_rate as f32 * 16.0 * channels as f32 / (1000.0 * avg_bitrate_kbps as f32);

        let buffer_constraint = if config.strict_iso { 7680 } else { 8 * 1440 };

        let sfb = SFB_INDEX[samplerate_index];
        let bv_scf = region_table(&sfb);
        let ath = AthTables::new(config.sample_rate, &sfb, -config.ath_lower_db, config.use_ath);

        let (longfact, shortfact) = band_factors(&config.band_adjust);

        let (mask_adjust_db, mask_adjust_short_db) = match config.rate {
            RateMode::Vbr { quality, .. } => {
                // Local tuning: half a dB more allowed noise per quality step
                // away from 4. The psy model normally supplies this offset.
                let db = 0.5 * (quality as f32 - 4.0);
                (db, db)
            }
            _ => (0.0, 0.0),
        };

        log::debug!(
            "session: {:?} {} Hz, {} ch, mode_gr={}, sideinfo={} bytes, index {}..={}",
            version,
            config.sample_rate,
            channels,
            mode_gr,
            sideinfo_len,
            vbr_min_index,
            vbr_max_index
        );

        Ok(Self {
            version,
            sample_rate: config.sample_rate,
            samplerate_index,
            channels,
            mode: config.mode,
            mode_gr,
            sideinfo_len,
            rate: config.rate,
            bitrate_index: vbr_max_index,
            vbr_min_index,
            vbr_max_index,
            avg_bitrate_kbps,
            compression_ratio,
            buffer_constraint,
            disable_reservoir: config.disable_reservoir,
            sfb,
            bv_scf,
            ath,
            ath_adjust: config.ath_adjust,
            longfact,
            shortfact,
            mask_adjust_db,
            mask_adjust_short_db,
            noise_shaping: config.noise_shaping,
            noise_shaping_amp: config.noise_shaping_amp,
            noise_shaping_stop: config.noise_shaping_stop,
            substep_shaping: config.substep_shaping,
            quant_comp: config.quant_comp,
            quant_comp_short: config.quant_comp_short,
            emphasis: config.emphasis,
            copyright: config.copyright,
            original: config.original,
        })
    }

    /// Frame length in bits for a bitrate index
    pub fn frame_bits(&self, bitrate_index: usize, padding: bool) -> i32 {
        8 * frame_bytes(self.version, self.sample_rate, bitrate_index, padding) as i32
    }

    pub fn bitrate_kbps(&self, bitrate_index: usize) -> u32 {
        BITRATE_TABLE[self.version.table_row()][bitrate_index].max(0) as u32
    }

    pub fn is_vbr(&self) -> bool {
        matches!(self.rate, RateMode::Vbr { .. })
    }
}

/// Region boundaries for every even big_values count
fn region_table(sfb: &ScaleFactorBands) -> [usize; GRANULE_SIZE] {
    let mut bv_scf = [0usize; GRANULE_SIZE];
    let l = &sfb.l;
    for i in (2..=GRANULE_SIZE).step_by(2) {
        let mut bands = 0usize;
        loop {
            bands += 1;
            if l[bands] >= i {
                break;
            }
        }
        let (r0, r1) = SUBDV_TABLE[bands];

        let mut index = r0 as i32;
        while index >= 0 && l[index as usize + 1] > i {
            index -= 1;
        }
        if index < 0 {
            index = r0 as i32;
        }
        let region0 = index as usize;
        bv_scf[i - 2] = region0;

        let mut index = r1 as i32;
        while index >= 0 && l[index as usize + region0 + 2] > i {
            index -= 1;
        }
        if index < 0 {
            index = r1 as i32;
        }
        bv_scf[i - 1] = index as usize;
    }
    bv_scf
}

fn band_factors(adjust: &BandAdjust) -> ([f32; SBMAX_L], [f32; SBMAX_S]) {
    let db = |v: f32| 10f32.powf(v * 0.1);
    let mut longfact = [1.0; SBMAX_L];
    for (sfb, f) in longfact.iter_mut().enumerate() {
        *f = match sfb {
            0..=6 => db(adjust.bass_db),
            7..=13 => db(adjust.alto_db),
            14..=20 => db(adjust.treble_db),
            _ => db(adjust.sfb21_db),
        };
    }
    let mut shortfact = [1.0; SBMAX_S];
    for (sfb, f) in shortfact.iter_mut().enumerate() {
        *f = match sfb {
            0..=2 => db(adjust.bass_db),
            3..=6 => db(adjust.alto_db),
            7..=11 => db(adjust.treble_db),
            _ => db(adjust.sfb21_db),
        };
    }
    (longfact, shortfact)
}
