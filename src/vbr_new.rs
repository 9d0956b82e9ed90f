//! Frame-wide VBR quantization
//!
//! Every scalefactor band gets the coarsest effective gain whose noise stays
//! under the allowed distortion. The global gain is the coarsest band gain,
//! and scalefactors plus subblock gains make up the difference for the other
//! bands. When the frame needs more bits than it may use, the allowed
//! distortion is raised for all granules until it fits, and as a last
//! resort the largest granules lose their top bands.

use crate::bit_count::{best_huffman_divide, best_scalefac_store, count_bits, scale_bitcount};
use crate::config::SessionConfig;
use crate::noise::calc_noise;
use crate::quantize::limit_granule_bits;
use crate::tables::{ipow20, pow20, ADJ43, IXMAX_VAL, POW43};
use crate::types::{
    GrInfo, SideInfo, GRANULE_SIZE, LARGE_BITS, MAX_BITS_PER_CHANNEL, MAX_BITS_PER_GRANULE,
    MAX_CHANNELS, MAX_GRANULES, SBMAX_S, SFBMAX,
};
use log::{debug, trace};

type PerChannel<T> = [[T; MAX_CHANNELS]; MAX_GRANULES];

/// Steps of the allowed-distortion bisection
const OUT_OF_BITS_STEPS: usize = 8;
/// Largest raise of the allowed distortion tried by the bisection, in dB
const OUT_OF_BITS_MAX_DB: f32 = 48.0;

/// Result of quantizing a whole frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbrFrameResult {
    pub used_bits: i32,
    pub over_count: PerChannel<i32>,
}

/// Wanted and smallest safe effective gain per band
#[derive(Debug, Clone)]
struct BandGains {
    vbrsf: [i32; SFBMAX],
    sfmin: [i32; SFBMAX],
    max: i32,
}

/// Smallest gain at which `xr34` still quantizes inside the Huffman range
fn find_lowest_scalefac(xr34: f32) -> i32 {
    let (mut sf, mut sf_ok, mut delsf) = (128, 255, 128);
    for _ in 0..8 {
        delsf >>= 1;
        if ipow20(sf) * xr34 <= IXMAX_VAL as f32 {
            sf_ok = sf;
            sf -= delsf;
        } else {
            sf += delsf;
        }
    }
    if sf_ok < 255 {
        sf_ok
    } else {
        sf
    }
}

/// Quantization noise of one band at effective gain `sf`
fn band_noise_at(xr: &[f32], xr34: &[f32], sf: i32) -> f32 {
    let step = pow20(sf);
    let istep = ipow20(sf);
    xr.iter()
        .zip(xr34.iter())
        .map(|(&x, &x34)| {
            let v = (x34 * istep).min(IXMAX_VAL as f32);
            let q = (v + ADJ43[v as usize]) as usize;
            let d = x.abs() - POW43[q] * step;
            d * d
        })
        .sum()
}

/// A gain is only accepted when its neighbours are within the allowance too
fn band_distorted(xr: &[f32], xr34: &[f32], l3_xmin: f32, sf: i32) -> bool {
    band_noise_at(xr, xr34, sf) > l3_xmin
        || (sf < 255 && band_noise_at(xr, xr34, sf + 1) > l3_xmin)
        || (sf > 0 && band_noise_at(xr, xr34, sf - 1) > l3_xmin)
}

/// Bisect the coarsest gain at or above `sf_min` whose noise stays under
/// `l3_xmin`
fn find_scalefac(xr: &[f32], xr34: &[f32], l3_xmin: f32, sf_min: i32) -> i32 {
    let (mut sf, mut sf_ok, mut delsf) = (128, 255, 128);
    let mut seen_good = false;
    for _ in 0..8 {
        delsf >>= 1;
        if sf <= sf_min {
            sf += delsf;
        } else if band_distorted(xr, xr34, l3_xmin, sf) {
            sf -= delsf;
        } else {
            sf_ok = sf;
            sf += delsf;
            seen_good = true;
        }
    }
    if seen_good {
        sf = sf_ok;
    }
    sf.max(sf_min)
}

fn band_gains(gi: &GrInfo, xr34: &[f32; GRANULE_SIZE], l3_xmin: &[f32; SFBMAX], xmin_factor: f32) -> BandGains {
    let mut g = BandGains { vbrsf: [0; SFBMAX], sfmin: [0; SFBMAX], max: 0 };
    let end = gi.max_nonzero_coeff;
    let mut coarsest_found = -1;
    let mut maxsf = 0;
    let mut j = 0;
    let mut sfb = 0;

    while j <= end && sfb < SFBMAX {
        let width = gi.width[sfb];
        if width == 0 {
            break;
        }
        let lines = j..j + width.min(end - j + 1);
        let x34max = xr34[lines.clone()].iter().fold(0.0f32, |m, &x| m.max(x));
        let m1 = find_lowest_scalefac(x34max);
        g.sfmin[sfb] = m1;

        // bands narrower than 3 lines carry no scalefactor at 8 kHz
        g.vbrsf[sfb] = if sfb < gi.psymax && width > 2 {
            if gi.energy_above_cutoff[sfb] {
                let m2 = find_scalefac(&gi.xr[lines.clone()], &xr34[lines], l3_xmin[sfb] * xmin_factor, m1);
                maxsf = maxsf.max(m2);
                if coarsest_found < m2 && m2 < 255 {
                    coarsest_found = m2;
                }
                m2
            } else {
                255
            }
        } else {
            maxsf = maxsf.max(m1);
            maxsf
        };
        sfb += 1;
        j += width;
    }
    for sf in g.vbrsf[sfb..].iter_mut() {
        *sf = maxsf;
    }

    // inaudible bands follow the coarsest audible one
    let fill = if coarsest_found >= 0 { coarsest_found } else { maxsf };
    for (sf, &min) in g.vbrsf.iter_mut().zip(g.sfmin.iter()) {
        if *sf == 255 {
            *sf = fill;
        }
        *sf = (*sf).max(min);
    }
    g.max = g.vbrsf.iter().copied().max().unwrap_or(0);
    g
}

/// Largest scalefactor the packing can carry for a band
fn scalefac_limit(gi: &GrInfo, sfb: usize) -> i32 {
    if sfb < gi.sfbdivide {
        15
    } else {
        7
    }
}

/// Derive scalefactors, subblock gains and the global gain from the band
/// gains. Prefers the fine scalefactor step and falls back to the coarse one,
/// clipping to the packing limits as a last resort.
fn assign_scalefactors(session: &SessionConfig, gi: &mut GrInfo, g: &BandGains) {
    gi.global_gain = g.max;
    let mut base = [g.max; 3];

    if gi.block_type.is_short() {
        for (window, b) in base.iter_mut().enumerate() {
            let finest = (0..SBMAX_S).map(|k| g.vbrsf[3 * k + window]).max().unwrap_or(g.max);
            let sbg = ((g.max - finest) / 8).clamp(0, 7);
            gi.subblock_gain[window] = sbg;
            *b = g.max - 8 * sbg;
        }
    }

    for scale in 0..2 {
        let step = 2 << scale;
        for sfb in 0..gi.sfbmax {
            let top = if gi.window[sfb] < 3 { base[gi.window[sfb]] } else { g.max };
            let amp = (top - g.vbrsf[sfb]).max(0);
            let mut sf = (amp + step - 1) / step;
            if sf > 0 && top - sf * step < g.sfmin[sfb] {
                sf -= 1;
            }
            gi.scalefac[sfb] = sf;
        }
        gi.scalefac_scale = scale;
        gi.preflag = 0;
        if !scale_bitcount(session, gi) {
            return;
        }
    }

    for sfb in 0..gi.sfbmax {
        gi.scalefac[sfb] = gi.scalefac[sfb].min(scalefac_limit(gi, sfb));
    }
    gi.preflag = 0;
    if scale_bitcount(session, gi) {
        debug_assert!(false, "clipped scalefactors still exceed the packing");
    }
}

/// Apply every band's amplification to `xr34`, writing `work`
fn amplify_bands(gi: &mut GrInfo, xr34: &[f32; GRANULE_SIZE], work: &mut [f32; GRANULE_SIZE]) {
    gi.xrpow_max = 0.0;
    let mut j = 0;
    for sfb in 0..SFBMAX {
        let width = gi.width[sfb];
        if width == 0 {
            continue;
        }
        let factor = ipow20(gi.band_gain(sfb) - gi.global_gain + 210);
        for (w, &x) in work[j..j + width].iter_mut().zip(xr34[j..j + width].iter()) {
            *w = x * factor;
            gi.xrpow_max = gi.xrpow_max.max(*w);
        }
        j += width;
    }
}

/// Count bits, raising the global gain while the quantization overflows
fn count_fitting(session: &SessionConfig, gi: &mut GrInfo, work: &[f32; GRANULE_SIZE]) -> i32 {
    loop {
        let bits = count_bits(session, work, gi);
        if bits < LARGE_BITS || gi.global_gain >= 255 {
            gi.part2_3_length = bits;
            return bits + gi.part2_length;
        }
        gi.global_gain += 1;
    }
}

/// Quantize one granule with its allowed distortion raised by `xmin_factor`
fn quantize_granule(
    session: &SessionConfig,
    gi: &mut GrInfo,
    xr34: &[f32; GRANULE_SIZE],
    l3_xmin: &[f32; SFBMAX],
    xmin_factor: f32,
    work: &mut [f32; GRANULE_SIZE],
) -> i32 {
    gi.reset_search();
    let gains = band_gains(gi, xr34, l3_xmin, xmin_factor);
    assign_scalefactors(session, gi, &gains);
    amplify_bands(gi, xr34, work);
    count_fitting(session, gi, work)
}

/// Bit ceilings for the channel, granule and frame
struct Limits {
    active: PerChannel<bool>,
    frame: i32,
}

impl Limits {
    fn hold(&self, session: &SessionConfig, bits: &PerChannel<i32>) -> bool {
        let mut frame = 0;
        for gr in 0..session.mode_gr {
            let mut granule = 0;
            for ch in 0..session.channels {
                if !self.active[gr][ch] {
                    continue;
                }
                if bits[gr][ch] > MAX_BITS_PER_CHANNEL {
                    return false;
                }
                granule += bits[gr][ch];
            }
            if granule > MAX_BITS_PER_GRANULE {
                return false;
            }
            frame += granule;
        }
        frame <= self.frame
    }
}

#[allow(clippy::too_many_arguments)]
fn quantize_all(
    session: &SessionConfig,
    side: &mut SideInfo,
    xrpow: &PerChannel<[f32; GRANULE_SIZE]>,
    l3_xmin: &PerChannel<[f32; SFBMAX]>,
    limits: &Limits,
    xmin_factor: f32,
    work: &mut PerChannel<[f32; GRANULE_SIZE]>,
    bits: &mut PerChannel<i32>,
) {
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            if limits.active[gr][ch] {
                bits[gr][ch] = quantize_granule(
                    session,
                    &mut side.tt[gr][ch],
                    &xrpow[gr][ch],
                    &l3_xmin[gr][ch],
                    xmin_factor,
                    &mut work[gr][ch],
                );
            }
        }
    }
}

/// Quantize every granule and channel of the frame in `side`.
///
/// Channels with a zero entry in `max_bits` are silent and left untouched.
/// The frame may use at most the sum of `max_bits`, capped at
/// `max_frame_bits`, and no channel or granule may exceed its format
/// ceiling.
pub fn vbr_encode_frame(
    session: &SessionConfig,
    side: &mut SideInfo,
    xrpow: &PerChannel<[f32; GRANULE_SIZE]>,
    l3_xmin: &PerChannel<[f32; SFBMAX]>,
    max_bits: &PerChannel<i32>,
    max_frame_bits: i32,
) -> VbrFrameResult {
    let mut active = [[false; MAX_CHANNELS]; MAX_GRANULES];
    let mut budget = 0;
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            active[gr][ch] = max_bits[gr][ch] > 0;
            budget += max_bits[gr][ch].max(0);
        }
    }
    let limits = Limits { active, frame: budget.min(max_frame_bits) };

    let mut work = [[[0.0f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];
    let mut bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    quantize_all(session, side, xrpow, l3_xmin, &limits, 1.0, &mut work, &mut bits);

    if !limits.hold(session, &bits) {
        // Raise the allowed distortion of every band until the frame fits
        let (mut lo, mut hi) = (0.0f32, OUT_OF_BITS_MAX_DB);
        let mut fitting = None;
        for _ in 0..OUT_OF_BITS_STEPS {
            let mid = 0.5 * (lo + hi);
            quantize_all(session, side, xrpow, l3_xmin, &limits, 10f32.powf(0.1 * mid), &mut work, &mut bits);
            if limits.hold(session, &bits) {
                fitting = Some(mid);
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let db = fitting.unwrap_or(OUT_OF_BITS_MAX_DB);
        debug!("vbr frame out of bits, allowed distortion raised by {:.2} dB", db);
        quantize_all(session, side, xrpow, l3_xmin, &limits, 10f32.powf(0.1 * db), &mut work, &mut bits);

        // Coarsen the largest granule channel step by step
        while !limits.hold(session, &bits) {
            let largest = (0..session.mode_gr)
                .flat_map(|gr| (0..session.channels).map(move |ch| (gr, ch)))
                .filter(|&(gr, ch)| active[gr][ch] && side.tt[gr][ch].global_gain < 255)
                .max_by_key(|&(gr, ch)| bits[gr][ch]);
            let Some((gr, ch)) = largest else {
                break;
            };
            let gi = &mut side.tt[gr][ch];
            gi.global_gain += 1;
            bits[gr][ch] = count_fitting(session, gi, &work[gr][ch]);
        }

        // Everything is at the coarsest gain: drop bands of the largest one
        while !limits.hold(session, &bits) {
            let largest = (0..session.mode_gr)
                .flat_map(|gr| (0..session.channels).map(move |ch| (gr, ch)))
                .filter(|&(gr, ch)| active[gr][ch] && bits[gr][ch] > 0)
                .max_by_key(|&(gr, ch)| bits[gr][ch]);
            let Some((gr, ch)) = largest else {
                break;
            };
            let gi = &mut side.tt[gr][ch];
            let dropped = limit_granule_bits(session, gi, bits[gr][ch] - 1);
            bits[gr][ch] = gi.main_data_bits();
            debug!("vbr gr {} ch {}: dropped {} bands, {} bits left", gr, ch, dropped, bits[gr][ch]);
        }
    }

    let mut over_count = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut distort = [0.0f32; SFBMAX];
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            if active[gr][ch] {
                over_count[gr][ch] = calc_noise(&side.tt[gr][ch], &l3_xmin[gr][ch], &mut distort, None).over_count;
            }
        }
    }

    let mut used_bits = 0;
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            best_scalefac_store(session, side, gr, ch);
            let gi = &mut side.tt[gr][ch];
            best_huffman_divide(session, gi);
            used_bits += gi.main_data_bits();
            trace!("vbr gr {} ch {}: gain {} bits {}", gr, ch, gi.global_gain, gi.main_data_bits());
        }
    }

    VbrFrameResult { used_bits, over_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, RateMode, VbrMode};
    use crate::noise::calc_xmin;
    use crate::quantize::{init_outer_loop, init_xrpow};
    use crate::types::{BlockType, PsyRatio};
    use proptest::prelude::*;

    fn vbr_session() -> SessionConfig {
        let cfg = EncoderConfig::default().with_rate(RateMode::Vbr {
            mode: VbrMode::New,
            quality: 4,
            min_kbps: 32,
            max_kbps: 320,
        });
        SessionConfig::from_config(&cfg).unwrap()
    }

    fn noisy(gi: &mut GrInfo, amp: f32, seed: u32) {
        let mut v = seed.wrapping_mul(2_654_435_761).max(1);
        for (i, x) in gi.xr.iter_mut().enumerate().take(450) {
            v ^= v << 13;
            v ^= v >> 17;
            v ^= v << 5;
            *x = amp * ((v % 2000) as f32 / 1000.0 - 1.0) / (1.0 + i as f32 * 0.01);
        }
    }

    fn prepared(s: &SessionConfig, block_type: BlockType, amp: f32, seed: u32) -> (GrInfo, [f32; GRANULE_SIZE], [f32; SFBMAX]) {
        let mut gi = GrInfo { block_type, ..GrInfo::default() };
        init_outer_loop(s, &mut gi);
        noisy(&mut gi, amp, seed);
        let mut xmin = [0.0; SFBMAX];
        calc_xmin(s, 1.0, 1.0, &PsyRatio::default(), &mut gi, &mut xmin);
        let mut xr34 = [0.0; GRANULE_SIZE];
        assert!(init_xrpow(&mut gi, &mut xr34));
        (gi, xr34, xmin)
    }

    #[test]
    fn test_lowest_scalefac_stays_in_range() {
        assert_eq!(find_lowest_scalefac(0.0), 0);
        let sf = find_lowest_scalefac(1000.0);
        assert!(ipow20(sf) * 1000.0 <= IXMAX_VAL as f32);
        assert!(ipow20(sf - 1) * 1000.0 > IXMAX_VAL as f32);
    }

    #[test]
    fn test_band_gain_meets_allowance() {
        let xr = [0.3f32, -0.2, 0.25, 0.1];
        let xr34: Vec<f32> = xr.iter().map(|x| x.abs().powf(0.75)).collect();
        let xmin = 1e-4;
        let sf = find_scalefac(&xr, &xr34, xmin, 0);
        assert!(band_noise_at(&xr, &xr34, sf) <= xmin);
        // a much looser allowance permits a coarser gain
        assert!(find_scalefac(&xr, &xr34, xmin * 100.0, 0) > sf);
    }

    #[test]
    fn test_short_block_subblock_gain() {
        let s = vbr_session();
        let (mut gi, xr34, xmin) = prepared(&s, BlockType::Short, 0.3, 7);
        let mut work = [0.0; GRANULE_SIZE];
        let bits = quantize_granule(&s, &mut gi, &xr34, &xmin, 1.0, &mut work);
        assert!(bits < LARGE_BITS);
        assert!(gi.subblock_gain[..3].iter().all(|&g| (0..=7).contains(&g)));
        assert!(gi.scalefac[..gi.sfbmax].iter().all(|&sf| sf >= 0));
    }

    #[test]
    fn test_frame_fits_tight_budget() {
        let s = vbr_session();
        let mut side = SideInfo::default();
        let mut xrpow = [[[0.0; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];
        let mut xmin = [[[0.0; SFBMAX]; MAX_CHANNELS]; MAX_GRANULES];
        for gr in 0..2 {
            for ch in 0..2 {
                let (gi, x, m) = prepared(&s, BlockType::Normal, 0.8, (gr * 2 + ch + 1) as u32);
                side.tt[gr][ch] = gi;
                xrpow[gr][ch] = x;
                xmin[gr][ch] = m;
            }
        }
        let max_bits = [[300; 2]; 2];
        let result = vbr_encode_frame(&s, &mut side, &xrpow, &xmin, &max_bits, 1200);
        assert!(result.used_bits <= 1200, "{}", result.used_bits);
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
        fn property_amplification_matches_band_gain(amp in 0.01f32..1.0, seed in 1u32..1000) {
            let s = vbr_session();
            let (mut gi, xr34, xmin) = prepared(&s, BlockType::Normal, amp, seed);
            let mut work = [0.0; GRANULE_SIZE];
            let bits = quantize_granule(&s, &mut gi, &xr34, &xmin, 1.0, &mut work);
            prop_assert!(bits < LARGE_BITS);
            let mut j = 0;
            for sfb in 0..gi.psymax {
                let expected = ipow20(gi.band_gain(sfb) - gi.global_gain + 210);
                for l in j..j + gi.width[sfb] {
                    if xr34[l] > 0.0 {
                        prop_assert!((work[l] / xr34[l] / expected - 1.0).abs() < 1e-4);
                    }
                }
                j += gi.width[sfb];
            }
        }
    }
}
