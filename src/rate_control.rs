//! Rate control strategies
//!
//! Each strategy turns the perceptual entropy of a frame into bit targets,
//! drives the quantization search for every granule and channel, settles the
//! bit reservoir and, for ABR and VBR, picks the frame's bitrate index.

use crate::bit_count::{best_huffman_divide, best_scalefac_store};
use crate::config::{RateMode, SessionConfig, VbrMode};
use crate::encoder::FrameAnalysis;
use crate::error::InternalError;
use crate::noise::calc_xmin;
use crate::quantize::{
    init_outer_loop, init_xrpow, limit_granule_bits, outer_loop, trancate_smallspectrums, QuantState,
};
use crate::reservoir::BitReservoir;
use crate::types::{
    BlockType, GrInfo, SearchCandidate, SideInfo, GRANULE_SIZE, MAX_BITS_PER_CHANNEL,
    MAX_BITS_PER_GRANULE, MAX_CHANNELS, MAX_GRANULES, SBMAX_L, SBMAX_S, SFBMAX,
};
use crate::vbr_new::vbr_encode_frame;
use log::{debug, trace, warn};

/// ABR pe smoothing filter, one side of a symmetric 19-tap FIR
const FIRCOEF: [f32; 9] = [
    -0.0207887 * 5.0,
    -0.0378413 * 5.0,
    -0.0432472 * 5.0,
    -0.031183 * 5.0,
    7.79609e-18 * 5.0,
    0.0467745 * 5.0,
    0.10091 * 5.0,
    0.151365 * 5.0,
    0.187098 * 5.0,
];

/// Quantization rounds of a VBR-old frame; the last one cuts granules to
/// the largest frame
const MAX_PRESSURE_ROUNDS: usize = 64;

/// Minimum bits a VBR-old granule search starts from
const VBR_MIN_GRANULE_BITS: i32 = 126;

pub type FrameBits = [i32; 16];
type PerChannel<T> = [[T; MAX_CHANNELS]; MAX_GRANULES];

/// Bit targets of one granule from `on_pe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GranuleTarget {
    pub targ_bits: [i32; MAX_CHANNELS],
    /// Ceiling for the whole granule
    pub max_bits: i32,
    /// The reservoir is being drained
    pub draining: bool,
}

/// Outcome of one frame's rate control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDecision {
    pub bitrate_index: usize,
    /// Main data bits actually spent
    pub used_bits: i32,
    /// Distorted bands left per granule and channel
    pub over_count: PerChannel<i32>,
}

/// State the strategies carry from frame to frame
#[derive(Debug, Clone)]
pub struct RateControl {
    pub reservoir: BitReservoir,
    pub quant: QuantState,
    /// Recent pe sums for the ABR/CBR smoothing filter
    pefirbuf: [f32; 19],
}

impl RateControl {
    pub fn new(session: &SessionConfig) -> Self {
        let start = 700.0 * (session.mode_gr * session.channels) as f32;
        Self {
            reservoir: BitReservoir::new(session),
            quant: QuantState::default(),
            pefirbuf: [start; 19],
        }
    }

    /// Push this frame's pe sum through the smoothing filter and scale the
    /// per-channel pe by `670 * 5 * granules * channels` over the filter
    /// output, so a steady signal lands at the same level however loud it is
    pub fn smooth_pe(&mut self, session: &SessionConfig, pe: &PerChannel<f32>) -> PerChannel<f32> {
        self.pefirbuf.copy_within(1.., 0);
        let mut sum = 0.0;
        for row in pe.iter().take(session.mode_gr) {
            sum += row[..session.channels].iter().sum::<f32>();
        }
        self.pefirbuf[18] = sum;

        let mut f = self.pefirbuf[9];
        for (i, c) in FIRCOEF.iter().enumerate() {
            f += (self.pefirbuf[i] + self.pefirbuf[18 - i]) * c;
        }

        let mut smoothed = *pe;
        if f > 0.0 {
            let scale = (670 * 5 * session.mode_gr * session.channels) as f32 / f;
            for row in smoothed.iter_mut() {
                for v in row.iter_mut() {
                    *v *= scale;
                }
            }
        }
        smoothed
    }

    /// Run the session's strategy on the frame held in `side`
    pub fn encode_frame(
        &mut self,
        session: &SessionConfig,
        side: &mut SideInfo,
        frame: &FrameAnalysis,
        padding: bool,
    ) -> Result<FrameDecision, InternalError> {
        match session.rate {
            RateMode::Cbr { .. } => {
                let pe = self.smooth_pe(session, &frame.pe);
                Ok(cbr_iteration_loop(session, self, side, frame, &pe, padding))
            }
            RateMode::Abr { .. } => {
                let pe = self.smooth_pe(session, &frame.pe);
                abr_iteration_loop(session, self, side, frame, &pe)
            }
            RateMode::Vbr { mode: VbrMode::Old, .. } => vbr_old_iteration_loop(session, self, side, frame),
            RateMode::Vbr { mode: VbrMode::New, .. } => vbr_new_iteration_loop(session, self, side, frame),
        }
    }
}

/// Scale `targets` down proportionally with integer arithmetic so that they
/// sum to at most `limit`
pub fn rescale_targets(targets: &mut [i32], limit: i32) {
    let sum: i64 = targets.iter().map(|&t| t as i64).sum();
    if sum > limit as i64 && sum > 0 {
        for t in targets.iter_mut() {
            *t = (*t as i64 * limit as i64 / sum) as i32;
        }
    }
}

/// Split a granule's bits between channels by perceptual entropy.
///
/// Every channel gets its share of the reservoir target. Channels with a pe
/// above 700 get up to 3/4 of `mean_bits` more, taken from the reservoir's
/// extra bits.
pub fn on_pe(
    session: &SessionConfig,
    reservoir: &BitReservoir,
    pe: &PerChannel<f32>,
    mean_bits: i32,
    gr: usize,
    cbr: bool,
) -> GranuleTarget {
    let channels = session.channels;
    let target = reservoir.max_bits(mean_bits, cbr);
    let max_bits = (target.targ_bits + target.extra_bits).min(MAX_BITS_PER_GRANULE);
    let extra_bits = target.extra_bits;

    let mut targ_bits = [0i32; MAX_CHANNELS];
    let mut add_bits = [0i32; MAX_CHANNELS];
    let mut bits = 0;
    for ch in 0..channels {
        targ_bits[ch] = MAX_BITS_PER_CHANNEL.min(target.targ_bits / channels as i32);
        let t = targ_bits[ch] as f32;
        add_bits[ch] = (t * pe[gr][ch] / 700.0 - t) as i32;
        add_bits[ch] = add_bits[ch].min(mean_bits * 3 / 4).max(0);
        if add_bits[ch] + targ_bits[ch] > MAX_BITS_PER_CHANNEL {
            add_bits[ch] = (MAX_BITS_PER_CHANNEL - targ_bits[ch]).max(0);
        }
        bits += add_bits[ch];
    }
    if bits > extra_bits && bits > 0 {
        for add in add_bits[..channels].iter_mut() {
            *add = extra_bits * *add / bits;
        }
    }
    for ch in 0..channels {
        targ_bits[ch] += add_bits[ch];
    }
    rescale_targets(&mut targ_bits[..channels], MAX_BITS_PER_GRANULE);

    GranuleTarget { targ_bits, max_bits, draining: target.draining }
}

/// Move bits from the side channel to the mid channel when the side carries
/// little energy, then cap the pair at `max_bits`
pub fn reduce_side(targ_bits: &mut [i32; MAX_CHANNELS], ms_ener_ratio: f32, mean_bits: i32, max_bits: i32) {
    // ms_ener_ratio 0 gives mid 2/3, 0.5 gives an even split
    let fac = (0.33 * (0.5 - ms_ener_ratio) / 0.5).clamp(0.0, 0.5);
    let mut move_bits = (fac * 0.5 * (targ_bits[0] + targ_bits[1]) as f32) as i32;
    move_bits = move_bits.min(MAX_BITS_PER_CHANNEL - targ_bits[0]).max(0);

    if targ_bits[1] >= 125 {
        if targ_bits[1] - move_bits > 125 {
            if targ_bits[0] < mean_bits {
                targ_bits[0] += move_bits;
            }
            targ_bits[1] -= move_bits;
        } else {
            targ_bits[0] += targ_bits[1] - 125;
            targ_bits[1] = 125;
        }
    }

    let total = targ_bits[0] + targ_bits[1];
    if total > max_bits {
        targ_bits[0] = max_bits * targ_bits[0] / total;
        targ_bits[1] = max_bits * targ_bits[1] / total;
    }
}

/// Turn left/right spectra of a granule into mid/side
pub fn ms_convert(side: &mut SideInfo, gr: usize) {
    let (left, right) = side.tt[gr].split_at_mut(1);
    for (l, r) in left[0].xr.iter_mut().zip(right[0].xr.iter_mut()) {
        let (a, b) = (*l, *r);
        *l = (a + b) * std::f32::consts::FRAC_1_SQRT_2;
        *r = (a - b) * std::f32::consts::FRAC_1_SQRT_2;
    }
}

/// Full frame bits for every bitrate index up to the session maximum, as
/// `frame_begin` would grant them with the reservoir's current content
pub fn get_framebits(session: &SessionConfig, reservoir: &mut BitReservoir) -> FrameBits {
    let mut frame_bits = [0i32; 16];
    for (i, bits) in frame_bits.iter_mut().enumerate().take(session.vbr_max_index + 1).skip(1) {
        *bits = reservoir.frame_begin(session.frame_bits(i, false)).full_frame_bits;
    }
    frame_bits
}

/// Mask adjustment in dB for the VBR strategies, growing with pe
fn vbr_mask_adjust(block_type: BlockType, pe: f32) -> f32 {
    let s = 1.0 + (3.5 - pe / 300.0).exp();
    if block_type.is_short() {
        2.56 / s - 0.14
    } else {
        1.28 / s - 0.05
    }
}

/// Settle one granule after its final quantization.
///
/// `limit` is what the frame can still hold; a granule above it loses its
/// top bands. Returns the bits the granule uses.
fn finish_granule(session: &SessionConfig, side: &mut SideInfo, gr: usize, ch: usize, limit: i32) -> i32 {
    let gi = &mut side.tt[gr][ch];
    if gi.main_data_bits() > limit {
        let bits = gi.main_data_bits();
        let dropped = limit_granule_bits(session, gi, limit);
        warn!("gr {} ch {}: {} bits exceed the {} left in the frame, dropped {} bands", gr, ch, bits, limit, dropped);
    }
    best_scalefac_store(session, side, gr, ch);
    let gi = &mut side.tt[gr][ch];
    best_huffman_divide(session, gi);
    gi.main_data_bits()
}

/// Settle one granule and debit its bits from the reservoir
fn iteration_finish_one(
    session: &SessionConfig,
    reservoir: &mut BitReservoir,
    side: &mut SideInfo,
    gr: usize,
    ch: usize,
    limit: i32,
) -> i32 {
    let bits = finish_granule(session, side, gr, ch, limit);
    reservoir.adjust(bits);
    bits
}

/// Main data bits of every granule and channel in `side`
fn used_bits(session: &SessionConfig, side: &SideInfo) -> i32 {
    side.tt[..session.mode_gr]
        .iter()
        .flat_map(|gr| gr[..session.channels].iter())
        .map(GrInfo::main_data_bits)
        .sum()
}

/// Constant bitrate: every frame uses the configured index, the reservoir
/// evens out the granules
pub fn cbr_iteration_loop(
    session: &SessionConfig,
    rc: &mut RateControl,
    side: &mut SideInfo,
    frame: &FrameAnalysis,
    pe: &PerChannel<f32>,
    padding: bool,
) -> FrameDecision {
    let budget = rc.reservoir.frame_begin(session.frame_bits(session.bitrate_index, padding));
    let mut over_count = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut xrpow = [0.0f32; GRANULE_SIZE];
    let mut l3_xmin = [0.0f32; SFBMAX];
    let mut spent = 0;

    for gr in 0..session.mode_gr {
        // frame_end credits the frame's bits, so later granules count
        // the share the first one already spent
        let mut target = on_pe(session, &rc.reservoir, pe, budget.mean_bits, gr, gr != 0);
        rc.quant.reservoir_draining = target.draining;
        if frame.mid_side {
            ms_convert(side, gr);
            reduce_side(&mut target.targ_bits, frame.ms_ener_ratio[gr], budget.mean_bits, target.max_bits);
        }

        for ch in 0..session.channels {
            let gi = &mut side.tt[gr][ch];
            rc.quant.set_masking_lower(session, gi.block_type, 0.0);
            init_outer_loop(session, gi);
            let ath_over = calc_xmin(
                session,
                rc.quant.ath.factor,
                rc.quant.masking_lower,
                &frame.ratio[gr][ch],
                gi,
                &mut l3_xmin,
            );
            if init_xrpow(gi, &mut xrpow) {
                let targ = if ath_over == 0 { 0 } else { target.targ_bits[ch] };
                over_count[gr][ch] = outer_loop(session, &mut rc.quant, gi, &l3_xmin, &mut xrpow, ch, targ);
            }
            spent += iteration_finish_one(session, &mut rc.reservoir, side, gr, ch, budget.full_frame_bits - spent);
            trace!("cbr gr {} ch {}: {} bits, target {}", gr, ch, side.tt[gr][ch].main_data_bits(), target.targ_bits[ch]);
        }
    }

    rc.reservoir.frame_end(budget.mean_bits, side);
    FrameDecision {
        bitrate_index: session.bitrate_index,
        used_bits: used_bits(session, side),
        over_count,
    }
}

/// Per-granule targets of an ABR frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbrTargets {
    pub targ_bits: PerChannel<i32>,
    /// Target for channels that are analog silence
    pub analog_silence_bits: i32,
    /// Most the frame may use at the maximum bitrate
    pub max_frame_bits: i32,
}

/// Derive ABR bit targets from the average bitrate and the smoothed pe
pub fn calc_target_bits(
    session: &SessionConfig,
    reservoir: &mut BitReservoir,
    side: &SideInfo,
    pe: &PerChannel<f32>,
    ms_ener_ratio: &[f32; MAX_GRANULES],
    mid_side: bool,
) -> AbrTargets {
    let mode_gr = session.mode_gr;
    let channels = session.channels;
    let granule_channels = (mode_gr * channels) as i32;
    let sideinfo_bits = 8 * session.sideinfo_len as i32;

    let max_frame_bits = reservoir
        .frame_begin(session.frame_bits(session.vbr_max_index, false))
        .full_frame_bits;
    let analog_silence_bits = (session.frame_bits(1, false) - sideinfo_bits) / granule_channels;

    let mut mean = session.avg_bitrate_kbps as f64 * (GRANULE_SIZE * mode_gr) as f64 * 1000.0;
    if session.substep_shaping & 1 != 0 {
        mean *= 1.09;
    }
    let mean_bits = ((mean as i64 / session.sample_rate as i64) as i32 - sideinfo_bits) / granule_channels;

    // Share of the average spent directly; the rest feeds the reservoir
    let res_factor = (0.93 + 0.07 * (11.0 - session.compression_ratio) / (11.0 - 5.5)).clamp(0.90, 1.00);

    let mut targ_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    for gr in 0..mode_gr {
        for ch in 0..channels {
            let mut t = (res_factor * mean_bits as f32) as i32;
            if pe[gr][ch] > 700.0 {
                let mut add_bits = ((pe[gr][ch] - 700.0) / 1.4) as i32;
                if side.tt[gr][ch].block_type.is_short() && add_bits < mean_bits / 2 {
                    add_bits = mean_bits / 2;
                }
                if add_bits > mean_bits * 3 / 2 {
                    add_bits = mean_bits * 3 / 2;
                } else if add_bits < 0 {
                    add_bits = 0;
                }
                t += add_bits;
            }
            targ_bits[gr][ch] = t.min(MAX_BITS_PER_CHANNEL);
        }
        rescale_targets(&mut targ_bits[gr][..channels], MAX_BITS_PER_GRANULE);
    }

    if mid_side {
        for gr in 0..mode_gr {
            reduce_side(&mut targ_bits[gr], ms_ener_ratio[gr], mean_bits * channels as i32, MAX_BITS_PER_GRANULE);
        }
    }

    let mut flat = [0i32; MAX_GRANULES * MAX_CHANNELS];
    for gr in 0..mode_gr {
        for ch in 0..channels {
            flat[gr * channels + ch] = targ_bits[gr][ch].min(MAX_BITS_PER_CHANNEL);
        }
    }
    rescale_targets(&mut flat[..mode_gr * channels], max_frame_bits);
    for gr in 0..mode_gr {
        for ch in 0..channels {
            targ_bits[gr][ch] = flat[gr * channels + ch];
        }
    }

    AbrTargets { targ_bits, analog_silence_bits, max_frame_bits }
}

/// Average bitrate: targets from the smoothed pe, then the lowest bitrate
/// whose frame refills the reservoir
pub fn abr_iteration_loop(
    session: &SessionConfig,
    rc: &mut RateControl,
    side: &mut SideInfo,
    frame: &FrameAnalysis,
    pe: &PerChannel<f32>,
) -> Result<FrameDecision, InternalError> {
    let targets = calc_target_bits(session, &mut rc.reservoir, side, pe, &frame.ms_ener_ratio, frame.mid_side);
    let mut over_count = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut xrpow = [0.0f32; GRANULE_SIZE];
    let mut l3_xmin = [0.0f32; SFBMAX];
    let mut spent = 0;
    rc.quant.reservoir_draining = false;

    for gr in 0..session.mode_gr {
        if frame.mid_side {
            ms_convert(side, gr);
        }
        for ch in 0..session.channels {
            let gi = &mut side.tt[gr][ch];
            rc.quant.set_masking_lower(session, gi.block_type, 0.0);
            init_outer_loop(session, gi);
            let ath_over = calc_xmin(
                session,
                rc.quant.ath.factor,
                rc.quant.masking_lower,
                &frame.ratio[gr][ch],
                gi,
                &mut l3_xmin,
            );
            if init_xrpow(gi, &mut xrpow) {
                let targ = if ath_over == 0 {
                    targets.analog_silence_bits
                } else {
                    targets.targ_bits[gr][ch]
                };
                over_count[gr][ch] = outer_loop(session, &mut rc.quant, gi, &l3_xmin, &mut xrpow, ch, targ);
            }
            spent += iteration_finish_one(session, &mut rc.reservoir, side, gr, ch, targets.max_frame_bits - spent);
        }
    }

    // The reservoir now holds the debit of this frame
    let mut chosen = None;
    for index in session.vbr_min_index..=session.vbr_max_index {
        let budget = rc.reservoir.frame_begin(session.frame_bits(index, false));
        if budget.full_frame_bits >= 0 {
            chosen = Some((index, budget));
            break;
        }
    }
    let used = used_bits(session, side);
    let (bitrate_index, budget) = chosen.ok_or(InternalError::FrameTooLarge {
        used_bits: used,
        max_bits: targets.max_frame_bits,
    })?;

    rc.reservoir.frame_end(budget.mean_bits, side);
    Ok(FrameDecision { bitrate_index, used_bits: used, over_count })
}

/// Tighten the allowed noise of the upper bands and shrink every granule's
/// bit ceiling, used when a VBR frame does not fit the largest bitrate
pub fn bitpressure_strategy(
    session: &SessionConfig,
    side: &SideInfo,
    l3_xmin: &mut PerChannel<[f32; SFBMAX]>,
    min_bits: &PerChannel<i32>,
    max_bits: &mut PerChannel<i32>,
) {
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            let gi = &side.tt[gr][ch];
            let xmin = &mut l3_xmin[gr][ch];
            let mut k = 0;
            for sfb in 0..gi.psy_lmax {
                xmin[k] *= 1.0 + 0.029 * (sfb * sfb) as f32 / (SBMAX_L * SBMAX_L) as f32;
                k += 1;
            }
            if gi.block_type.is_short() {
                for sfb in gi.sfb_smin..SBMAX_S {
                    let f = 1.0 + 0.029 * (sfb * sfb) as f32 / (SBMAX_S * SBMAX_S) as f32;
                    for _ in 0..3 {
                        xmin[k] *= f;
                        k += 1;
                    }
                }
            }
            max_bits[gr][ch] = min_bits[gr][ch].max((0.9 * max_bits[gr][ch] as f32) as i32);
        }
    }
}

/// Bisect the bit count of one granule between `min_bits` and `max_bits`
/// for the cheapest quantization that leaves no band distorted, to within
/// 12 bits. Keeps the last fully masked candidate; without one the last try
/// stands. Returns the distorted band count of the result.
#[allow(clippy::too_many_arguments)]
pub fn vbr_encode_granule(
    session: &SessionConfig,
    state: &mut QuantState,
    gi: &mut GrInfo,
    l3_xmin: &[f32; SFBMAX],
    xrpow: &mut [f32; GRANULE_SIZE],
    ch: usize,
    mut min_bits: i32,
    mut max_bits: i32,
) -> i32 {
    let mut this_bits = (max_bits + min_bits) / 2;
    let mut best: Option<SearchCandidate> = None;
    let mut over;

    loop {
        over = outer_loop(session, state, gi, l3_xmin, xrpow, ch, this_bits);
        if over <= 0 {
            let real_bits = gi.part2_3_length;
            best = Some(SearchCandidate { gi: gi.clone(), xrpow: *xrpow, noise: Default::default() });
            max_bits = real_bits - 32;
        } else {
            min_bits = this_bits + 32;
            if let Some(b) = &best {
                gi.clone_from(&b.gi);
                *xrpow = b.xrpow;
            }
        }
        let dbits = max_bits - min_bits;
        this_bits = (max_bits + min_bits) / 2;
        if dbits <= 12 {
            break;
        }
    }

    if let Some(b) = best {
        *gi = b.gi;
        *xrpow = b.xrpow;
        over = 0;
    }
    over
}

/// Per-channel bit ranges of a VBR-old frame
struct VbrOldPlan {
    l3_xmin: PerChannel<[f32; SFBMAX]>,
    frame_bits: FrameBits,
    min_bits: PerChannel<i32>,
    max_bits: PerChannel<i32>,
    analog_silence: bool,
}

fn vbr_old_prepare(
    session: &SessionConfig,
    rc: &mut RateControl,
    side: &mut SideInfo,
    frame: &FrameAnalysis,
) -> VbrOldPlan {
    let full = rc.reservoir.frame_begin(session.frame_bits(session.vbr_max_index, false)).full_frame_bits;
    let avg = full / session.mode_gr as i32;
    let frame_bits = get_framebits(session, &mut rc.reservoir);

    let mut plan = VbrOldPlan {
        l3_xmin: [[[0.0; SFBMAX]; MAX_CHANNELS]; MAX_GRANULES],
        frame_bits,
        min_bits: [[0; MAX_CHANNELS]; MAX_GRANULES],
        max_bits: [[0; MAX_CHANNELS]; MAX_GRANULES],
        analog_silence: true,
    };

    let mut bits = 0;
    for gr in 0..session.mode_gr {
        let target = on_pe(session, &rc.reservoir, &frame.pe, avg, gr, false);
        plan.max_bits[gr] = target.targ_bits;
        if frame.mid_side {
            ms_convert(side, gr);
            reduce_side(&mut plan.max_bits[gr], frame.ms_ener_ratio[gr], avg, target.max_bits);
        }
        for ch in 0..session.channels {
            let gi = &mut side.tt[gr][ch];
            let adjust = vbr_mask_adjust(gi.block_type, frame.pe[gr][ch]);
            rc.quant.set_masking_lower(session, gi.block_type, adjust);
            init_outer_loop(session, gi);
            let bands = calc_xmin(
                session,
                rc.quant.ath.factor,
                rc.quant.masking_lower,
                &frame.ratio[gr][ch],
                gi,
                &mut plan.l3_xmin[gr][ch],
            );
            if bands > 0 {
                plan.analog_silence = false;
            }
            plan.min_bits[gr][ch] = VBR_MIN_GRANULE_BITS;
            bits += plan.max_bits[gr][ch];
        }
    }

    let limit = plan.frame_bits[session.vbr_max_index];
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            if bits > limit && bits > 0 {
                plan.max_bits[gr][ch] = (plan.max_bits[gr][ch] as i64 * limit as i64 / bits as i64) as i32;
            }
            plan.min_bits[gr][ch] = plan.min_bits[gr][ch].min(plan.max_bits[gr][ch]);
        }
    }
    plan
}

/// First index from `start` whose frame can hold `used`, capped at the maximum
fn lowest_index(session: &SessionConfig, frame_bits: &FrameBits, start: usize, used: i32) -> usize {
    (start..session.vbr_max_index)
        .find(|&i| used <= frame_bits[i])
        .unwrap_or(session.vbr_max_index)
}

/// VBR with a per-granule bit bisection
pub fn vbr_old_iteration_loop(
    session: &SessionConfig,
    rc: &mut RateControl,
    side: &mut SideInfo,
    frame: &FrameAnalysis,
) -> Result<FrameDecision, InternalError> {
    let mut plan = vbr_old_prepare(session, rc, side, frame);
    let mut xrpow = [0.0f32; GRANULE_SIZE];
    let mut over_count = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    rc.quant.reservoir_draining = false;

    let mut rounds = 0;
    let (bitrate_index, used) = loop {
        rounds += 1;
        // The last round cuts the granules down to the largest frame
        let ceiling = if rounds < MAX_PRESSURE_ROUNDS {
            i32::MAX
        } else {
            warn!("vbr frame still too large after {} pressure rounds", rounds - 1);
            plan.frame_bits[session.vbr_max_index]
        };

        let mut used = 0;
        for gr in 0..session.mode_gr {
            for ch in 0..session.channels {
                let gi = &mut side.tt[gr][ch];
                gi.reset_search();
                over_count[gr][ch] = 0;
                if init_xrpow(gi, &mut xrpow) && plan.max_bits[gr][ch] > 0 {
                    over_count[gr][ch] = vbr_encode_granule(
                        session,
                        &mut rc.quant,
                        gi,
                        &plan.l3_xmin[gr][ch],
                        &mut xrpow,
                        ch,
                        plan.min_bits[gr][ch],
                        plan.max_bits[gr][ch],
                    );
                    if session.substep_shaping & 1 != 0 {
                        trancate_smallspectrums(session, gi, &plan.l3_xmin[gr][ch]);
                    }
                }
                used += finish_granule(session, side, gr, ch, ceiling.saturating_sub(used));
            }
        }

        let start = if plan.analog_silence { 1 } else { session.vbr_min_index };
        let index = lowest_index(session, &plan.frame_bits, start, used);
        if used <= plan.frame_bits[index] {
            break (index, used);
        }
        debug!("vbr frame needs {} bits, max {}; raising pressure", used, plan.frame_bits[index]);
        bitpressure_strategy(session, side, &mut plan.l3_xmin, &plan.min_bits, &mut plan.max_bits);
    };

    let budget = rc.reservoir.frame_begin(session.frame_bits(bitrate_index, false));
    rc.reservoir.adjust(used);
    rc.reservoir.frame_end(budget.mean_bits, side);
    Ok(FrameDecision { bitrate_index, used_bits: used, over_count })
}

/// VBR with a joint scalefactor search over the whole frame
pub fn vbr_new_iteration_loop(
    session: &SessionConfig,
    rc: &mut RateControl,
    side: &mut SideInfo,
    frame: &FrameAnalysis,
) -> Result<FrameDecision, InternalError> {
    let full = rc.reservoir.frame_begin(session.frame_bits(session.vbr_max_index, false));
    let mut pad = rc.reservoir.max();
    let avg = full.mean_bits;
    let frame_bits = get_framebits(session, &mut rc.reservoir);
    let maximum = frame_bits[session.vbr_max_index];

    let mut l3_xmin = [[[0.0f32; SFBMAX]; MAX_CHANNELS]; MAX_GRANULES];
    let mut max_bits = [[0i32; MAX_CHANNELS]; MAX_GRANULES];
    let mut analog_silence = true;
    let mut bits = 0;
    for gr in 0..session.mode_gr {
        max_bits[gr] = on_pe(session, &rc.reservoir, &frame.pe, avg, gr, false).targ_bits;
        if frame.mid_side {
            ms_convert(side, gr);
        }
        for ch in 0..session.channels {
            let gi = &mut side.tt[gr][ch];
            rc.quant.set_masking_lower(session, BlockType::Normal, 0.0);
            init_outer_loop(session, gi);
            let bands = calc_xmin(
                session,
                rc.quant.ath.factor,
                rc.quant.masking_lower,
                &frame.ratio[gr][ch],
                gi,
                &mut l3_xmin[gr][ch],
            );
            if bands > 0 {
                analog_silence = false;
            }
            bits += max_bits[gr][ch];
        }
    }
    for row in max_bits.iter_mut().take(session.mode_gr) {
        for b in row.iter_mut().take(session.channels) {
            if bits > maximum && bits > 0 {
                *b = (*b as i64 * maximum as i64 / bits as i64) as i32;
            }
        }
    }
    if analog_silence {
        pad = 0;
    }

    let mut xrpow = [[[0.0f32; GRANULE_SIZE]; MAX_CHANNELS]; MAX_GRANULES];
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            if !init_xrpow(&mut side.tt[gr][ch], &mut xrpow[gr][ch]) {
                max_bits[gr][ch] = 0;
            }
        }
    }

    let result = vbr_encode_frame(session, side, &xrpow, &l3_xmin, &max_bits, maximum);
    let used = result.used_bits;

    let start = if analog_silence { 1 } else { session.vbr_min_index };
    let lowest = lowest_index(session, &frame_bits, start, used);
    let bitrate_index = if pad > 0 {
        // Prefer a larger frame while its surplus still fits the reservoir
        (lowest + 1..=session.vbr_max_index)
            .rev()
            .find(|&j| frame_bits[j] - used <= pad)
            .unwrap_or(lowest)
    } else {
        lowest
    };

    if used > frame_bits[bitrate_index] {
        return Err(InternalError::FrameTooLarge { used_bits: used, max_bits: maximum });
    }
    let budget = rc.reservoir.frame_begin(session.frame_bits(bitrate_index, false));
    if used > budget.full_frame_bits {
        return Err(InternalError::FrameTooLarge { used_bits: used, max_bits: budget.full_frame_bits });
    }
    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            rc.reservoir.adjust(side.tt[gr][ch].main_data_bits());
        }
    }
    rc.reservoir.frame_end(budget.mean_bits, side);
    if used > maximum * 9 / 10 {
        warn!("vbr frame close to the bitrate ceiling: {} of {} bits", used, maximum);
    }

    Ok(FrameDecision { bitrate_index, used_bits: used, over_count: result.over_count })
}
