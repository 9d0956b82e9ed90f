//! # Layer III encoder core
//!
//! Quantization, noise measurement, bit reservoir and rate control for an
//! MPEG-1/2 Layer III encoder. The crate takes the spectral analysis of a
//! frame (MDCT coefficients, masking ratios, perceptual entropy) and
//! produces the quantized frame together with its bitstream, under
//! constant, average or variable bitrate control.
//!

pub mod ath;
pub mod bit_count;
pub mod bitstream;
pub mod config;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod encoder;
pub mod error;
pub mod huffman;
pub mod noise;
pub mod quantize;
pub mod rate_control;
pub mod reservoir;
pub mod tables;
pub mod types;
pub mod vbr_new;

pub use config::{EncoderConfig, QuantCompare, RateMode, StereoMode, VbrMode};
pub use encoder::{EncodedFrame, FrameAnalysis, Layer3Encoder};
pub use error::{EncoderError, Result};
