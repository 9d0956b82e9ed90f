//! Bit counting for quantized granules
//!
//! Everything here measures exactly what the bitstream writer will emit:
//! Huffman bits of the big_values and count1 regions, and scalefactor bits
//! for both MPEG-1 and MPEG-2 packing.

use crate::config::SessionConfig;
use crate::huffman::{count1_index, HUFFMAN_TABLE};
use crate::quantize::quantize_xrpow;
use crate::tables::{
    ipow20, IXMAX_VAL, LOG2TAB, MAX_RANGE_SFAC_TAB, NR_OF_SFB_BLOCK, PRETAB, SCALE_LONG,
    SCALE_MIXED, SCALE_SHORT, SLEN1_TAB, SLEN2_TAB,
};
use crate::types::{BlockType, GrInfo, SideInfo, GRANULE_SIZE, LARGE_BITS, SBMAX_L, SBPSY_L};

/// Exclusive upper bounds of the scalefactors representable by each
/// scalefac_compress value (`1 << slen`)
const SLEN1_N: [i32; 16] = [1, 1, 1, 1, 8, 2, 2, 2, 4, 4, 4, 8, 8, 8, 16, 16];
const SLEN2_N: [i32; 16] = [1, 2, 4, 8, 1, 2, 4, 8, 2, 4, 8, 2, 4, 8, 4, 8];

/// Long band boundaries of the four scfsi groups
const SCFSI_BAND: [usize; 5] = [0, 6, 11, 16, 21];

/// Quantize with the granule's global gain and count the Huffman bits.
/// Returns `LARGE_BITS` when the gain is too small for the Huffman range.
pub fn count_bits(session: &SessionConfig, xrpow: &[f32; GRANULE_SIZE], gi: &mut GrInfo) -> i32 {
    let istep = ipow20(gi.global_gain);
    if gi.xrpow_max > IXMAX_VAL as f32 / istep {
        return LARGE_BITS;
    }
    quantize_xrpow(xrpow, &mut gi.l3_enc, istep, gi.max_nonzero_coeff);
    noquant_count_bits(session, gi)
}

/// Huffman cost of coding `ix` as pairs with table `t`, sign and escape bits included
fn table_cost(t: usize, ix: &[i32]) -> i32 {
    let tab = &HUFFMAN_TABLE[t];
    let mut bits = 0u32;
    for pair in ix.chunks_exact(2) {
        let (mut x, mut y) = (pair[0] as usize, pair[1] as usize);
        if x >= 15 && tab.linbits > 0 {
            x = 15;
            bits += tab.linbits;
        }
        if y >= 15 && tab.linbits > 0 {
            y = 15;
            bits += tab.linbits;
        }
        bits += tab.bits(x, y);
        bits += (pair[0] != 0) as u32 + (pair[1] != 0) as u32;
    }
    bits as i32
}

/// Pick the cheapest of `candidates` for `ix`, add its cost to `bits`
fn cheapest(candidates: &[usize], ix: &[i32], bits: &mut i32) -> i32 {
    let mut best_table = candidates[0];
    let mut best_cost = table_cost(best_table, ix);
    for &t in &candidates[1..] {
        let cost = table_cost(t, ix);
        if cost < best_cost {
            best_cost = cost;
            best_table = t;
        }
    }
    *bits += best_cost;
    best_table as i32
}

/// Choose the Huffman table for a run of quantized magnitudes and add its
/// cost to `bits`. An empty or all-zero run uses table 0 at no cost.
pub fn choose_table(ix: &[i32], bits: &mut i32) -> i32 {
    let max = ix.iter().copied().max().unwrap_or(0);
    match max {
        0 => 0,
        1 => cheapest(&[1], ix, bits),
        2 => cheapest(&[2, 3], ix, bits),
        3 => cheapest(&[5, 6], ix, bits),
        4 | 5 => cheapest(&[7, 8, 9], ix, bits),
        6 | 7 => cheapest(&[10, 11, 12], ix, bits),
        8..=15 => cheapest(&[13, 15], ix, bits),
        m if m > IXMAX_VAL => {
            *bits += LARGE_BITS;
            0
        }
        m => {
            let fits = |t: &usize| HUFFMAN_TABLE[*t].linmax >= m as u32;
            let mut candidates = [0usize; 2];
            let mut n = 0;
            for family in [16..24, 24..32] {
                if let Some(t) = family.clone().find(fits) {
                    candidates[n] = t;
                    n += 1;
                }
            }
            cheapest(&candidates[..n], ix, bits)
        }
    }
}

/// Count1 cost of the quadruple ending at `i` with tables A and B
#[inline]
fn quad_costs(ix: &[i32; GRANULE_SIZE], i: usize) -> (i32, i32) {
    let p = count1_index(ix[i - 4], ix[i - 3], ix[i - 2], ix[i - 1]);
    let signs = (ix[i - 4] + ix[i - 3] + ix[i - 2] + ix[i - 1]) as u32;
    (
        (HUFFMAN_TABLE[32].quad(p).1 + signs) as i32,
        (HUFFMAN_TABLE[33].quad(p).1 + signs) as i32,
    )
}

/// Start lines of regions 1 and 2 of the big_values area, capped at big_values
pub fn region_bounds(session: &SessionConfig, gi: &GrInfo) -> (usize, usize) {
    let bv = gi.big_values as usize;
    let (a1, a2) = match gi.block_type {
        BlockType::Normal => (
            session.sfb.l[gi.region0_count as usize + 1],
            session.sfb.l[(gi.region0_count + gi.region1_count) as usize + 2],
        ),
        BlockType::Short => (3 * session.sfb.s[3], bv),
        BlockType::Start | BlockType::Stop => (session.sfb.l[8], bv),
    };
    (a1.min(bv), a2.min(bv))
}

/// Count the Huffman bits of the already quantized `gi.l3_enc`, choosing
/// region boundaries and tables on the way
pub fn noquant_count_bits(session: &SessionConfig, gi: &mut GrInfo) -> i32 {
    let ix = &gi.l3_enc;
    let mut i = (((gi.max_nonzero_coeff + 2) >> 1) << 1).min(GRANULE_SIZE);

    while i > 1 {
        if ix[i - 1] | ix[i - 2] != 0 {
            break;
        }
        i -= 2;
    }
    gi.count1 = i as i32;

    let (mut a1, mut a2) = (0, 0);
    while i > 3 {
        if (ix[i - 1] | ix[i - 2] | ix[i - 3] | ix[i - 4]) as u32 > 1 {
            break;
        }
        let (c32, c33) = quad_costs(ix, i);
        a1 += c32;
        a2 += c33;
        i -= 4;
    }

    let mut bits = a1;
    gi.count1table_select = 0;
    if a1 > a2 {
        bits = a2;
        gi.count1table_select = 1;
    }
    gi.count1bits = bits;
    gi.big_values = i as i32;
    if i == 0 {
        return bits;
    }

    match gi.block_type {
        BlockType::Normal => {
            gi.region0_count = session.bv_scf[i - 2] as i32;
            gi.region1_count = session.bv_scf[i - 1] as i32;
        }
        BlockType::Short => {}
        BlockType::Start | BlockType::Stop => {
            gi.region0_count = 7;
            gi.region1_count = (SBMAX_L - 1 - 7 - 1) as i32;
        }
    }

    let (a1, a2) = region_bounds(session, gi);
    let ix = &gi.l3_enc;
    if a1 > 0 {
        gi.table_select[0] = choose_table(&ix[..a1], &mut bits);
    }
    if a2 > a1 {
        gi.table_select[1] = choose_table(&ix[a1..a2], &mut bits);
    }
    if i > a2 {
        gi.table_select[2] = choose_table(&ix[a2..i], &mut bits);
    }
    bits
}

/// Best (bits, region0_count, table0, table1) for each region0 + region1 split
struct DivideTable {
    bits: [i32; 23],
    div: [i32; 23],
    r0_tbl: [i32; 23],
    r1_tbl: [i32; 23],
}

fn recalc_divide_init(session: &SessionConfig, gi: &GrInfo) -> DivideTable {
    let mut table = DivideTable {
        bits: [LARGE_BITS; 23],
        div: [0; 23],
        r0_tbl: [0; 23],
        r1_tbl: [0; 23],
    };
    let bigv = gi.big_values as usize;
    let ix = &gi.l3_enc;

    for r0 in 0..16 {
        let a1 = session.sfb.l[r0 + 1];
        if a1 >= bigv {
            break;
        }
        let mut r0bits = 0;
        let r0t = choose_table(&ix[..a1], &mut r0bits);
        for r1 in 0..8 {
            let a2 = session.sfb.l[r0 + r1 + 2];
            if a2 >= bigv {
                break;
            }
            let mut bits = r0bits;
            let r1t = choose_table(&ix[a1..a2], &mut bits);
            if table.bits[r0 + r1] > bits {
                table.bits[r0 + r1] = bits;
                table.div[r0 + r1] = r0 as i32;
                table.r0_tbl[r0 + r1] = r0t;
                table.r1_tbl[r0 + r1] = r1t;
            }
        }
    }
    table
}

fn recalc_divide_sub(
    session: &SessionConfig,
    trial: &GrInfo,
    gi: &mut GrInfo,
    table: &DivideTable,
) {
    let bigv = trial.big_values as usize;
    for r2 in 2..SBMAX_L + 1 {
        let a2 = session.sfb.l[r2];
        if a2 >= bigv {
            break;
        }
        let mut bits = table.bits[r2 - 2] + trial.count1bits;
        if gi.part2_3_length <= bits {
            break;
        }
        let r2t = choose_table(&trial.l3_enc[a2..bigv], &mut bits);
        if gi.part2_3_length <= bits {
            continue;
        }
        *gi = trial.clone();
        gi.part2_3_length = bits;
        gi.region0_count = table.div[r2 - 2];
        gi.region1_count = r2 as i32 - 2 - table.div[r2 - 2];
        gi.table_select = [table.r0_tbl[r2 - 2], table.r1_tbl[r2 - 2], r2t];
    }
}

/// Exhaustively re-split the big_values regions and try moving the last
/// big_values pair into the count1 area. Only ever lowers `part2_3_length`.
pub fn best_huffman_divide(session: &SessionConfig, gi: &mut GrInfo) {
    if gi.block_type.is_short() && session.mode_gr == 1 {
        return;
    }

    let original = gi.clone();
    let divide = if gi.block_type == BlockType::Normal {
        let table = recalc_divide_init(session, gi);
        recalc_divide_sub(session, &original, gi, &table);
        Some(table)
    } else {
        None
    };

    let bv = original.big_values as usize;
    let ix = &original.l3_enc;
    if bv == 0 || (ix[bv - 2] | ix[bv - 1]) as u32 > 1 {
        return;
    }
    let mut i = gi.count1 as usize + 2;
    if i > GRANULE_SIZE {
        return;
    }

    let mut trial = gi.clone();
    trial.count1 = i as i32;
    let (mut a1, mut a2) = (0, 0);
    while i > trial.big_values as usize {
        let (c32, c33) = quad_costs(&trial.l3_enc, i);
        a1 += c32;
        a2 += c33;
        i -= 4;
    }
    trial.big_values = i as i32;
    trial.count1table_select = 0;
    if a1 > a2 {
        a1 = a2;
        trial.count1table_select = 1;
    }
    trial.count1bits = a1;

    match divide {
        Some(table) => recalc_divide_sub(session, &trial, gi, &table),
        None => {
            trial.part2_3_length = a1;
            let (r1, _) = region_bounds(session, &trial);
            if r1 > 0 {
                trial.table_select[0] = choose_table(&trial.l3_enc[..r1], &mut trial.part2_3_length);
            }
            if i > r1 {
                trial.table_select[1] = choose_table(&trial.l3_enc[r1..i], &mut trial.part2_3_length);
            }
            if gi.part2_3_length > trial.part2_3_length {
                *gi = trial;
            }
        }
    }
}

/// Choose scalefactor packing and set `part2_length`.
/// Returns `true` when some scalefactor exceeds what the format can carry.
pub fn scale_bitcount(session: &SessionConfig, gi: &mut GrInfo) -> bool {
    if session.mode_gr == 2 {
        mpeg1_scale_bitcount(gi)
    } else {
        mpeg2_scale_bitcount(gi)
    }
}

fn mpeg1_scale_bitcount(gi: &mut GrInfo) -> bool {
    let tab = if gi.block_type.is_short() {
        if gi.mixed_block_flag {
            &SCALE_MIXED
        } else {
            &SCALE_SHORT
        }
    } else {
        if gi.preflag == 0 && (11..SBPSY_L).all(|sfb| gi.scalefac[sfb] >= PRETAB[sfb]) {
            gi.preflag = 1;
            for sfb in 11..SBPSY_L {
                gi.scalefac[sfb] -= PRETAB[sfb];
            }
        }
        &SCALE_LONG
    };

    let max1 = gi.scalefac[..gi.sfbdivide].iter().copied().max().unwrap_or(0).max(0);
    let max2 = gi.scalefac[gi.sfbdivide..gi.sfbmax].iter().copied().max().unwrap_or(0).max(0);

    gi.part2_length = LARGE_BITS;
    for k in 0..16 {
        if max1 < SLEN1_N[k] && max2 < SLEN2_N[k] && gi.part2_length > tab[k] as i32 {
            gi.part2_length = tab[k] as i32;
            gi.scalefac_compress = k as i32;
        }
    }
    gi.part2_length == LARGE_BITS
}

fn mpeg2_scale_bitcount(gi: &mut GrInfo) -> bool {
    let table_number = if gi.preflag != 0 { 2 } else { 0 };
    let mut max_sfac = [0i32; 4];

    let row = if gi.block_type.is_short() {
        let partitions = &NR_OF_SFB_BLOCK[table_number][1];
        let mut sfb = 0;
        for (partition, &nr) in partitions.iter().enumerate() {
            for _ in 0..nr / 3 {
                for window in 0..3 {
                    max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb * 3 + window]);
                }
                sfb += 1;
            }
        }
        1
    } else {
        let partitions = &NR_OF_SFB_BLOCK[table_number][0];
        let mut sfb = 0;
        for (partition, &nr) in partitions.iter().enumerate() {
            for _ in 0..nr {
                max_sfac[partition] = max_sfac[partition].max(gi.scalefac[sfb]);
                sfb += 1;
            }
        }
        0
    };

    let over = max_sfac
        .iter()
        .zip(MAX_RANGE_SFAC_TAB[table_number].iter())
        .any(|(&max, &range)| max > range);
    if over {
        return true;
    }

    for (slen, &max) in gi.slen.iter_mut().zip(max_sfac.iter()) {
        *slen = LOG2TAB[max as usize];
    }
    let [s1, s2, s3, s4] = gi.slen.map(|s| s as i32);
    gi.scalefac_compress = match table_number {
        0 => ((s1 * 5 + s2) << 4) + (s3 << 2) + s4,
        1 => 400 + ((s1 * 5 + s2) << 2) + s3,
        _ => 500 + s1 * 3 + s2,
    };
    gi.partition_table = table_number;
    gi.part2_length = gi
        .slen
        .iter()
        .zip(NR_OF_SFB_BLOCK[table_number][row].iter())
        .map(|(&slen, &nr)| (slen as usize * nr) as i32)
        .sum();
    false
}

/// Share scalefactor groups of the second granule with the first and pick
/// the cheapest packing for what remains
fn scfsi_calc(side: &mut SideInfo, ch: usize) {
    let (first, second) = side.tt.split_at_mut(1);
    let g0 = &first[0][ch];
    let gi = &mut second[0][ch];

    for i in 0..SCFSI_BAND.len() - 1 {
        let group = SCFSI_BAND[i]..SCFSI_BAND[i + 1];
        let shared = group
            .clone()
            .all(|sfb| g0.scalefac[sfb] == gi.scalefac[sfb] || gi.scalefac[sfb] < 0);
        if shared {
            // The decoder reuses granule 0's values for the whole group
            gi.scalefac[group.clone()].copy_from_slice(&g0.scalefac[group]);
            side.scfsi[ch][i] = 1;
        }
    }

    let scfsi = side.scfsi[ch];
    let sent = |sfb: usize| scfsi[SCFSI_BAND[1..].iter().take_while(|&&end| end <= sfb).count()] == 0;
    let (mut s1, mut c1) = (0, 0);
    for sfb in (0..11).filter(|&sfb| sent(sfb)) {
        c1 += 1;
        s1 = s1.max(gi.scalefac[sfb]);
    }
    let (mut s2, mut c2) = (0, 0);
    for sfb in (11..SBPSY_L).filter(|&sfb| sent(sfb)) {
        c2 += 1;
        s2 = s2.max(gi.scalefac[sfb]);
    }

    gi.part2_length = LARGE_BITS;
    for k in 0..16 {
        if s1 < SLEN1_N[k] && s2 < SLEN2_N[k] {
            let c = SLEN1_TAB[k] as i32 * c1 + SLEN2_TAB[k] as i32 * c2;
            if gi.part2_length > c {
                gi.part2_length = c;
                gi.scalefac_compress = k as i32;
            }
        }
    }
}

/// Final scalefactor clean-up once a granule's quantization is settled.
///
/// Bands that quantized to all zeros may take any scalefactor, so they are
/// marked free (-2) first. Then the cheapest equivalent representation is
/// chosen: halving under `scalefac_scale`, extracting `preflag`, and on the
/// second MPEG-1 granule sharing groups with the first. Band gains of bands
/// with nonzero content never change.
pub fn best_scalefac_store(session: &SessionConfig, side: &mut SideInfo, gr: usize, ch: usize) {
    let mut recalc = false;
    {
        let gi = &mut side.tt[gr][ch];
        let mut j = 0;
        for sfb in 0..gi.sfbmax {
            let width = gi.width[sfb];
            if gi.l3_enc[j..j + width].iter().all(|&v| v == 0) {
                gi.scalefac[sfb] = -2;
                recalc = true;
            }
            j += width;
        }

        if gi.scalefac_scale == 0 && gi.preflag == 0 {
            let s = gi.scalefac[..gi.sfbmax]
                .iter()
                .filter(|&&v| v > 0)
                .fold(0, |acc, &v| acc | v);
            if s & 1 == 0 && s != 0 {
                for sf in gi.scalefac[..gi.sfbmax].iter_mut().filter(|v| **v > 0) {
                    *sf >>= 1;
                }
                gi.scalefac_scale = 1;
                recalc = true;
            }
        }

        if gi.preflag == 0 && !gi.block_type.is_short() && session.mode_gr == 2 {
            let fits = (11..SBPSY_L).all(|sfb| gi.scalefac[sfb] >= PRETAB[sfb] || gi.scalefac[sfb] == -2);
            if fits {
                for sfb in 11..SBPSY_L {
                    if gi.scalefac[sfb] > 0 {
                        gi.scalefac[sfb] -= PRETAB[sfb];
                    }
                }
                gi.preflag = 1;
                recalc = true;
            }
        }
    }

    side.scfsi[ch] = [0; 4];
    if session.mode_gr == 2
        && gr == 1
        && !side.tt[0][ch].block_type.is_short()
        && !side.tt[1][ch].block_type.is_short()
    {
        scfsi_calc(side, ch);
        recalc = false;
    }

    let gi = &mut side.tt[gr][ch];
    for sf in gi.scalefac[..gi.sfbmax].iter_mut() {
        if *sf == -2 {
            *sf = 0;
        }
    }
    if recalc {
        scale_bitcount(session, gi);
    }
}
