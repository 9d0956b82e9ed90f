//! Properties of the quantizer and noise measurement on random spectra

mod common;

use layer3_core::bit_count::count_bits;
use layer3_core::config::SessionConfig;
use layer3_core::noise::{calc_noise, calc_xmin};
use layer3_core::quantize::{init_outer_loop, init_xrpow};
use layer3_core::rate_control::rescale_targets;
use layer3_core::types::{GrInfo, PsyRatio, GRANULE_SIZE, LARGE_BITS, SFBMAX};
use layer3_core::EncoderConfig;
use proptest::prelude::*;

fn session() -> SessionConfig {
    SessionConfig::from_config(&EncoderConfig::default()).unwrap()
}

/// A long block granule with magnitudes in `[amplitude / 2, amplitude]`
fn granule(session: &SessionConfig, seed: u32, amplitude: f32) -> GrInfo {
    let mut gi = GrInfo::default();
    init_outer_loop(session, &mut gi);
    let mut v = seed | 1;
    for x in gi.xr.iter_mut() {
        v ^= v << 13;
        v ^= v >> 17;
        v ^= v << 5;
        let r = 0.5 + (v % 10001) as f32 / 20000.0;
        *x = if v & 0x100 == 0 { r * amplitude } else { -r * amplitude };
    }
    gi
}

/// Quantize at `gain` and return the summed band noise, or `None` when the
/// gain is out of the Huffman range
fn noise_at(session: &SessionConfig, gi: &mut GrInfo, xrpow: &[f32; GRANULE_SIZE], gain: i32) -> Option<f32> {
    gi.global_gain = gain;
    if count_bits(session, xrpow, gi) >= LARGE_BITS {
        return None;
    }
    let unit = [1.0f32; SFBMAX];
    let mut distort = [0.0f32; SFBMAX];
    calc_noise(gi, &unit, &mut distort, None);
    Some(distort[..gi.psymax].iter().sum())
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
    fn test_coarser_gain_adds_noise(seed in 1u32.., amplitude in 500.0f32..1000.0, gain in 184i32..=220) {
        let s = session();
        let mut gi = granule(&s, seed, amplitude);
        let mut xrpow = [0.0f32; GRANULE_SIZE];
        prop_assert!(init_xrpow(&mut gi, &mut xrpow));

        let fine = noise_at(&s, &mut gi, &xrpow, gain);
        let coarse = noise_at(&s, &mut gi, &xrpow, gain + 16);
        prop_assume!(fine.is_some() && coarse.is_some());
        let (fine, coarse) = (fine.unwrap(), coarse.unwrap());
        // 16 gain steps multiply the step size by 16
        prop_assert!(coarse > fine * 4.0, "fine {} coarse {}", fine, coarse);
    }

    #[test]
    fn test_coarser_gain_needs_fewer_bits(seed in 1u32.., amplitude in 1.0f32..1000.0, gain in 150i32..=220) {
        let s = session();
        let mut gi = granule(&s, seed, amplitude);
        let mut xrpow = [0.0f32; GRANULE_SIZE];
        init_xrpow(&mut gi, &mut xrpow);

        gi.global_gain = gain;
        let fine = count_bits(&s, &xrpow, &mut gi);
        gi.global_gain = gain + 24;
        let coarse = count_bits(&s, &xrpow, &mut gi);
        prop_assert!(coarse <= fine);
    }

    #[test]
    fn test_rescaled_targets_fit(targets in prop::collection::vec(0i32..8000, 1..5), limit in 0i32..8000) {
        let mut scaled = targets.clone();
        rescale_targets(&mut scaled, limit);
        let total: i32 = scaled.iter().sum();
        if targets.iter().sum::<i32>() <= limit {
            prop_assert_eq!(&scaled, &targets);
        } else {
            prop_assert!(total <= limit);
        }
        for (s, t) in scaled.iter().zip(&targets) {
            prop_assert!(s <= t);
        }
    }
}

#[test]
fn test_unquantized_noise_is_band_energy() {
    common::init_logging();
    let s = session();
    let mut gi = granule(&s, 99, 2.0);
    gi.l3_enc = [0; GRANULE_SIZE];
    gi.global_gain = 210;

    let unit = [1.0f32; SFBMAX];
    let mut distort = [0.0f32; SFBMAX];
    let result = calc_noise(&gi, &unit, &mut distort, None);

    let mut start = 0;
    for sfb in 0..gi.psymax {
        let width = gi.width[sfb];
        let energy: f32 = gi.xr[start..start + width].iter().map(|x| x * x).sum();
        assert!((distort[sfb] - energy).abs() <= energy * 1e-4, "band {}", sfb);
        start += width;
    }
    // every band has at least 1.0 energy here, so every band is over
    assert_eq!(result.over_count as usize, gi.psymax);
}

#[test]
fn test_silent_granule_has_nothing_to_code() {
    common::init_logging();
    let s = session();
    let mut gi = GrInfo::default();
    init_outer_loop(&s, &mut gi);

    let mut l3_xmin = [0.0f32; SFBMAX];
    let over = calc_xmin(&s, 1.0, 1.0, &PsyRatio::default(), &mut gi, &mut l3_xmin);
    assert_eq!(over, 0);
    assert!(l3_xmin[..gi.psymax].iter().all(|&x| x > 0.0));
    assert!(gi.energy_above_cutoff.iter().all(|&e| !e));

    let mut xrpow = [0.0f32; GRANULE_SIZE];
    assert!(!init_xrpow(&mut gi, &mut xrpow));
    assert!(gi.l3_enc.iter().all(|&q| q == 0));
}

#[test]
fn test_higher_masking_allows_more_noise() {
    let s = session();
    let mut gi = granule(&s, 5, 300.0);
    let mut ratio = PsyRatio::default();
    for sfb in 0..gi.psymax {
        ratio.en.l[sfb] = 1e6;
        ratio.thm.l[sfb] = 1e3;
    }

    let mut low = [0.0f32; SFBMAX];
    let mut high = [0.0f32; SFBMAX];
    calc_xmin(&s, 1.0, 0.5, &ratio, &mut gi, &mut low);
    calc_xmin(&s, 1.0, 2.0, &ratio, &mut gi, &mut high);
    for sfb in 0..gi.psymax {
        assert!(high[sfb] >= low[sfb], "band {}", sfb);
    }
}
