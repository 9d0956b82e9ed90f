//! Benchmarks for the quantization loops
//!
//! Measures the granule search on its own and whole frames under each rate
//! control strategy.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use layer3_core::bit_count::count_bits;
use layer3_core::config::SessionConfig;
use layer3_core::quantize::{init_outer_loop, init_xrpow};
use layer3_core::types::{GrInfo, GRANULE_SIZE, MAX_CHANNELS, MAX_GRANULES};
use layer3_core::{EncoderConfig, FrameAnalysis, Layer3Encoder, RateMode, VbrMode};

fn test_frame() -> FrameAnalysis {
    let mut frame = FrameAnalysis::default();
    let mut v = 0x1234_5679u32;
    for gr in 0..MAX_GRANULES {
        for ch in 0..MAX_CHANNELS {
            for (i, x) in frame.xr[gr][ch].iter_mut().enumerate().take(480) {
                v ^= v << 13;
                v ^= v >> 17;
                v ^= v << 5;
                *x = ((v % 2001) as f32 / 1000.0 - 1.0) / (1.0 + i as f32 * 0.02);
            }
            frame.pe[gr][ch] = 800.0;
            frame.loudness_sq[gr][ch] = 0.1;
        }
    }
    frame
}

fn benchmark_count_bits(c: &mut Criterion) {
    let session = SessionConfig::from_config(&EncoderConfig::default()).unwrap();
    let frame = test_frame();
    let mut gi = GrInfo { xr: frame.xr[0][0], ..GrInfo::default() };
    init_outer_loop(&session, &mut gi);
    let mut xrpow = [0.0f32; GRANULE_SIZE];
    init_xrpow(&mut gi, &mut xrpow);
    gi.global_gain = 170;

    c.bench_function("count_bits", |b| {
        b.iter(|| black_box(count_bits(&session, black_box(&xrpow), &mut gi)))
    });
}

fn benchmark_frames(c: &mut Criterion) {
    let frame = test_frame();
    let vbr = |mode| RateMode::Vbr { mode, quality: 4, min_kbps: 32, max_kbps: 320 };
    let strategies = [
        ("frame_cbr", RateMode::Cbr { kbps: 128 }),
        ("frame_abr", RateMode::Abr { kbps: 128, min_kbps: 32, max_kbps: 320 }),
        ("frame_vbr_old", vbr(VbrMode::Old)),
        ("frame_vbr_new", vbr(VbrMode::New)),
    ];

    for (name, rate) in strategies {
        let mut encoder = Layer3Encoder::new(EncoderConfig::default().with_rate(rate)).unwrap();
        c.bench_function(name, |b| {
            b.iter(|| black_box(encoder.encode_frame(black_box(&frame)).unwrap()))
        });
    }
}

criterion_group!(benches, benchmark_count_bits, benchmark_frames);
criterion_main!(benches);
