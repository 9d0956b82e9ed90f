//! Error types for the Layer III encoder core
//!
//! Per-granule search failures (a trial exceeding its bit budget, or an
//! amplification loop that cannot reach full masking) are absorbed inside the
//! quantization loops and never show up here. Only configuration problems and
//! broken internal invariants are surfaced to the caller.

use thiserror::Error;

/// Main error type for the encoder
#[derive(Debug, Error)]
pub enum EncoderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Encoding process errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violations
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

/// Configuration validation errors, reported before any frame is encoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Unsupported sample rate
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Unsupported bitrate
    #[error("Unsupported bitrate: {0} kbps")]
    UnsupportedBitrate(u32),

    /// Invalid channel configuration
    #[error("Invalid channel count: {0}")]
    InvalidChannels(u8),

    /// Incompatible sample rate and bitrate combination
    #[error("Incompatible sample rate ({sample_rate} Hz) and bitrate ({bitrate} kbps) combination")]
    IncompatibleRateCombination { sample_rate: u32, bitrate: u32 },

    /// Stereo mode does not match the channel count
    #[error("Invalid stereo mode {mode} for {channels} channels")]
    InvalidStereoMode { mode: String, channels: u8 },

    /// VBR quality outside 0..=9
    #[error("Invalid VBR quality: {0}")]
    InvalidQuality(u8),

    /// Minimum bitrate above maximum bitrate
    #[error("Invalid bitrate range: {min} kbps > {max} kbps")]
    InvalidBitrateRange { min: u32, max: u32 },

    /// Noise shaping parameter out of range
    #[error("Invalid noise shaping parameter {name}: {value}")]
    InvalidNoiseShaping { name: &'static str, value: u8 },

    /// A frame at this bitrate would not fit the decoder buffer
    #[error("Frame of {frame_bytes} bytes exceeds the maximum frame size of {max_bytes} bytes")]
    FrameTooLarge { frame_bytes: usize, max_bytes: usize },
}

/// Encoding process errors
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Bitstream writing error
    #[error("Bitstream writing error: {0}")]
    BitstreamError(String),

    /// Spectral input contains NaN or infinite values
    #[error("Non-finite spectral value in granule {gr}, channel {ch}")]
    NonFiniteInput { gr: usize, ch: usize },

    /// Mid/side coding requested for a stream that is not joint stereo
    #[error("Mid/side coding requires a two-channel joint stereo stream")]
    InvalidMidSide,
}

/// Internal invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    /// Tracked reservoir content disagrees with the main_data_begin back-pointer
    #[error("Reservoir inconsistency: ResvSize={resv_size} bits, main_data_begin={main_data_begin} bytes")]
    ReservoirInconsistency { resv_size: i32, main_data_begin: i32 },

    /// A frame needs more bits than any allowed bitrate can carry
    #[error("Frame needs {used_bits} bits but the largest allowed frame holds {max_bits}")]
    FrameTooLarge { used_bits: i32, max_bits: i32 },
}

/// Specialized result types for different modules
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type EncodingResult<T> = std::result::Result<T, EncodingError>;
pub type Result<T> = std::result::Result<T, EncoderError>;
