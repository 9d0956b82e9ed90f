//! Allowed distortion and quantization noise per scalefactor band

use crate::config::SessionConfig;
use crate::tables::{pow20, POW43};
use crate::types::{CalcNoiseResult, GrInfo, NoiseMemo, PsyRatio, SFBMAX};

const DBL_EPSILON: f32 = f64::EPSILON as f32;

/// One band of `calc_xmin`: combine the ATH share of the band with the
/// psychoacoustic masking estimate. Returns `(xmin, en0)`.
#[inline]
fn band_xmin(xr: &[f32], ath: f32, thm: f32, en: f32, fact: f32, masking_lower: f32) -> (f32, f32) {
    let rh1 = ath / xr.len() as f32;
    let mut rh2 = DBL_EPSILON;
    let mut en0 = 0.0f32;
    for &xa in xr {
        let x2 = xa * xa;
        en0 += x2;
        rh2 += if x2 < rh1 { x2 } else { rh1 };
    }

    let mut xmin = if en0 < ath {
        en0
    } else if rh2 < ath {
        ath
    } else {
        rh2
    };
    if en > 1e-12 {
        let x = en0 * thm / en * fact * masking_lower;
        if xmin < x {
            xmin = x;
        }
    }
    (xmin.max(DBL_EPSILON), en0)
}

/// Compute the allowed noise of every band of `gi` into `l3_xmin` and set
/// `gi.max_nonzero_coeff` and `gi.energy_above_cutoff`.
///
/// Returns the number of bands whose energy exceeds the absolute threshold
/// of hearing; zero means the granule is analog silence.
pub fn calc_xmin(
    session: &SessionConfig,
    ath_factor: f32,
    masking_lower: f32,
    ratio: &PsyRatio,
    gi: &mut GrInfo,
    l3_xmin: &mut [f32; SFBMAX],
) -> usize {
    let mut ath_over = 0;
    let mut j = 0;
    let mut gsfb = 0;

    while gsfb < gi.psy_lmax {
        let width = gi.width[gsfb];
        let ath = session.ath.adjusted(ath_factor, session.ath.l[gsfb]) * session.longfact[gsfb];
        let (xmin, en0) = band_xmin(
            &gi.xr[j..j + width],
            ath,
            ratio.thm.l[gsfb],
            ratio.en.l[gsfb],
            session.longfact[gsfb],
            masking_lower,
        );
        if en0 > ath {
            ath_over += 1;
        }
        gi.energy_above_cutoff[gsfb] = en0 > xmin + 1e-14;
        l3_xmin[gsfb] = xmin;
        j += width;
        gsfb += 1;
    }

    let mut max_nonzero = gi.xr.iter().rposition(|x| x.abs() > 1e-12).unwrap_or(0);
    if gi.block_type.is_short() {
        max_nonzero = max_nonzero / 6 * 6 + 5;
    } else {
        max_nonzero |= 1;
    }
    if session.sample_rate < 44000 {
        let low = session.sample_rate <= 8000;
        let limit = if gi.block_type.is_short() {
            3 * session.sfb.s[if low { 9 } else { 12 }] - 1
        } else {
            session.sfb.l[if low { 17 } else { 21 }] - 1
        };
        max_nonzero = max_nonzero.min(limit);
    }
    gi.max_nonzero_coeff = max_nonzero;

    let mut sfb = gi.sfb_smin;
    while gsfb < gi.psymax {
        let width = gi.width[gsfb];
        let ath = session.ath.adjusted(ath_factor, session.ath.s[sfb]) * session.shortfact[sfb];
        for b in 0..3 {
            let (xmin, en0) = band_xmin(
                &gi.xr[j..j + width],
                ath,
                ratio.thm.s[sfb][b],
                ratio.en.s[sfb][b],
                session.shortfact[sfb],
                masking_lower,
            );
            if en0 > ath {
                ath_over += 1;
            }
            gi.energy_above_cutoff[gsfb + b] = en0 > xmin + 1e-14;
            l3_xmin[gsfb + b] = xmin;
            j += width;
        }
        sfb += 1;
        gsfb += 3;
    }

    ath_over
}

/// Squared quantization error of one band at step size `step`
#[inline]
fn band_noise(xr: &[f32], ix: &[i32], step: f32) -> f32 {
    xr.iter()
        .zip(ix.iter())
        .map(|(&x, &q)| {
            let d = x.abs() - POW43[q as usize] * step;
            d * d
        })
        .sum()
}

/// Measure the quantization noise of `gi` against the allowed noise
/// `l3_xmin`, filling the per-band distortion ratios into `distort`.
///
/// Lines above `max_nonzero_coeff` are not coded and do not count. When a
/// memo is given, bands whose global and effective gain did not change since
/// the last call reuse their previous values.
pub fn calc_noise(
    gi: &GrInfo,
    l3_xmin: &[f32; SFBMAX],
    distort: &mut [f32; SFBMAX],
    mut memo: Option<&mut NoiseMemo>,
) -> CalcNoiseResult {
    let mut over = 0;
    let mut over_noise_db = 0.0f32;
    let mut tot_noise_db = 0.0f32;
    let mut max_noise = -20.0f32;
    let mut over_ssd = 0i32;
    let end = gi.max_nonzero_coeff + 1;
    let mut j = 0;

    for sfb in 0..gi.psymax {
        let s = gi.band_gain(sfb);
        let key = (gi.global_gain, s);
        let width = gi.width[sfb];
        let r_xmin = 1.0 / l3_xmin[sfb];

        let cached = memo.as_deref().and_then(|m| {
            let band = &m.bands[sfb];
            (band.key == Some(key)).then_some((band.noise, band.noise_log))
        });
        let (distort_, noise) = match cached {
            Some((noise, noise_log)) => (r_xmin * noise, noise_log),
            None => {
                let stop = (j + width).min(end).max(j);
                let noise = band_noise(&gi.xr[j..stop], &gi.l3_enc[j..stop], pow20(s));
                let distort_ = r_xmin * noise;
                let noise_log = distort_.max(1e-20).log10();
                if let Some(m) = memo.as_deref_mut() {
                    let band = &mut m.bands[sfb];
                    band.key = Some(key);
                    band.noise = noise;
                    band.noise_log = noise_log;
                }
                (distort_, noise_log)
            }
        };
        distort[sfb] = distort_;
        j += width;

        tot_noise_db += noise;
        if noise > 0.0 {
            let tmp = ((noise * 10.0 + 0.5) as i32).max(1);
            over_ssd += tmp * tmp;
            over += 1;
            over_noise_db += noise;
        }
        max_noise = max_noise.max(noise);
    }

    CalcNoiseResult {
        over_count: over,
        over_noise: over_noise_db,
        tot_noise: tot_noise_db,
        max_noise,
        over_ssd,
        bits: 0,
    }
}
