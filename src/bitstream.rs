//! Bitstream writing for Layer III frames
//!
//! `BitstreamWriter` packs bits MSB first through a 32-bit cache.
//! `FrameFormatter` assembles complete frames: header and side information
//! go to the front of each frame, while main data is a continuous stream
//! that starts `main_data_begin` bytes before the frame's own payload. A
//! frame is only handed out once later main data has filled all of its
//! payload.

use std::collections::VecDeque;

use crate::bit_count::region_bounds;
use crate::config::{MpegVersion, SessionConfig, StereoMode};
use crate::error::{EncodingError, EncodingResult};
use crate::huffman::{count1_index, HUFFMAN_TABLE};
use crate::tables::{NR_OF_SFB_BLOCK, SLEN1_TAB, SLEN2_TAB};
use crate::types::{BlockType, GrInfo, SideInfo, MAX_CHANNELS, MAX_GRANULES};
use log::{error, trace};

/// Scalefactor bands covered by each scfsi flag
const SCFSI_GROUPS: [std::ops::Range<usize>; 4] = [0..6, 6..11, 11..16, 16..21];

/// MSB-first bit writer
#[derive(Debug, Default)]
pub struct BitstreamWriter {
    data: Vec<u8>,
    /// Pending bits, left aligned
    cache: u32,
    /// Free bits in cache
    cache_bits: i32,
}

impl BitstreamWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            cache: 0,
            cache_bits: 32,
        }
    }

    /// Write the low `n` bits of `val`
    pub fn put_bits(&mut self, val: u32, n: i32) -> EncodingResult<()> {
        if !(0..=32).contains(&n) {
            return Err(EncodingError::BitstreamError(format!(
                "cannot write {} bits at once",
                n
            )));
        }
        if n < 32 && (val >> n) != 0 {
            return Err(EncodingError::BitstreamError(format!(
                "value 0x{:X} does not fit in {} bits",
                val, n
            )));
        }
        if n == 0 {
            return Ok(());
        }

        if self.cache_bits > n {
            self.cache_bits -= n;
            self.cache |= val << self.cache_bits;
        } else {
            let remaining = n - self.cache_bits;
            self.cache |= if remaining == 32 { 0 } else { val >> remaining };
            self.data.extend_from_slice(&self.cache.to_be_bytes());
            self.cache_bits = 32 - remaining;
            self.cache = if remaining == 0 { 0 } else { val << self.cache_bits };
        }
        Ok(())
    }

    /// Write `n` zero bits
    pub fn put_zeros(&mut self, mut n: i32) -> EncodingResult<()> {
        while n > 0 {
            let chunk = n.min(32);
            self.put_bits(0, chunk)?;
            n -= chunk;
        }
        Ok(())
    }

    /// Number of bits written so far
    pub fn get_bits_count(&self) -> i32 {
        self.data.len() as i32 * 8 + (32 - self.cache_bits)
    }

    /// Pad with zero bits to the next byte boundary and move the cache into
    /// the buffer
    pub fn byte_align(&mut self) -> EncodingResult<()> {
        let pad = (8 - self.get_bits_count() % 8) % 8;
        self.put_bits(0, pad)?;
        let bytes = ((32 - self.cache_bits) / 8) as usize;
        self.data.extend_from_slice(&self.cache.to_be_bytes()[..bytes]);
        self.cache = 0;
        self.cache_bits = 32;
        Ok(())
    }

    /// Byte align and hand out everything written, leaving the writer empty
    pub fn take_bytes(&mut self) -> EncodingResult<Vec<u8>> {
        self.byte_align()?;
        Ok(std::mem::take(&mut self.data))
    }
}

/// Header fields that vary per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub bitrate_index: usize,
    pub padding: bool,
    /// Joint stereo frame coded as mid/side
    pub mid_side: bool,
}

fn write_header(bs: &mut BitstreamWriter, session: &SessionConfig, header: &FrameHeader) -> EncodingResult<()> {
    let (mode, mode_ext) = match session.mode {
        StereoMode::Stereo => (0, 0),
        StereoMode::JointStereo => (1, if header.mid_side { 2 } else { 0 }),
        StereoMode::Mono => (3, 0),
    };
    bs.put_bits(0x7ff, 11)?;
    bs.put_bits(session.version.header_bits(), 2)?;
    bs.put_bits(1, 2)?; // Layer III
    bs.put_bits(1, 1)?; // no CRC
    bs.put_bits(header.bitrate_index as u32, 4)?;
    bs.put_bits((session.samplerate_index % 3) as u32, 2)?;
    bs.put_bits(header.padding as u32, 1)?;
    bs.put_bits(0, 1)?;
    bs.put_bits(mode, 2)?;
    bs.put_bits(mode_ext, 2)?;
    bs.put_bits(session.copyright as u32, 1)?;
    bs.put_bits(session.original as u32, 1)?;
    bs.put_bits(session.emphasis as u32, 2)
}

fn write_granule_info(bs: &mut BitstreamWriter, mpeg1: bool, gi: &GrInfo) -> EncodingResult<()> {
    bs.put_bits(gi.main_data_bits() as u32, 12)?;
    bs.put_bits((gi.big_values / 2) as u32, 9)?;
    bs.put_bits(gi.global_gain as u32, 8)?;
    bs.put_bits(gi.scalefac_compress as u32, if mpeg1 { 4 } else { 9 })?;

    if gi.block_type != BlockType::Normal {
        bs.put_bits(1, 1)?; // window switching
        bs.put_bits(gi.block_type as u32, 2)?;
        bs.put_bits(gi.mixed_block_flag as u32, 1)?;
        bs.put_bits(gi.table_select[0] as u32, 5)?;
        bs.put_bits(gi.table_select[1] as u32, 5)?;
        for &sbg in &gi.subblock_gain[..3] {
            bs.put_bits(sbg as u32, 3)?;
        }
    } else {
        bs.put_bits(0, 1)?;
        for &t in &gi.table_select {
            bs.put_bits(t as u32, 5)?;
        }
        bs.put_bits(gi.region0_count as u32, 4)?;
        bs.put_bits(gi.region1_count as u32, 3)?;
    }

    if mpeg1 {
        bs.put_bits(gi.preflag as u32, 1)?;
    }
    bs.put_bits(gi.scalefac_scale as u32, 1)?;
    bs.put_bits(gi.count1table_select as u32, 1)
}

/// Header and side information, exactly `sideinfo_len` bytes
fn write_side_info(
    bs: &mut BitstreamWriter,
    session: &SessionConfig,
    side: &SideInfo,
    header: &FrameHeader,
) -> EncodingResult<()> {
    write_header(bs, session, header)?;
    let mpeg1 = session.version == MpegVersion::Mpeg1;
    let stereo = session.channels == 2;

    if mpeg1 {
        bs.put_bits(side.main_data_begin as u32, 9)?;
        bs.put_bits(side.private_bits as u32, if stereo { 3 } else { 5 })?;
        for scfsi in &side.scfsi[..session.channels] {
            for &flag in scfsi {
                bs.put_bits(flag as u32, 1)?;
            }
        }
    } else {
        bs.put_bits(side.main_data_begin as u32, 8)?;
        bs.put_bits(side.private_bits as u32, if stereo { 2 } else { 1 })?;
    }

    for gr in 0..session.mode_gr {
        for ch in 0..session.channels {
            write_granule_info(bs, mpeg1, &side.tt[gr][ch])?;
        }
    }
    Ok(())
}

fn write_scalefactors(
    bs: &mut BitstreamWriter,
    session: &SessionConfig,
    side: &SideInfo,
    gr: usize,
    ch: usize,
) -> EncodingResult<()> {
    let gi = &side.tt[gr][ch];
    let value = |sfb: usize| gi.scalefac[sfb] as u32;

    if session.mode_gr == 2 {
        let slen1 = SLEN1_TAB[gi.scalefac_compress as usize] as i32;
        let slen2 = SLEN2_TAB[gi.scalefac_compress as usize] as i32;
        if gi.block_type.is_short() {
            for sfb in 0..gi.sfbmax {
                bs.put_bits(value(sfb), if sfb < gi.sfbdivide { slen1 } else { slen2 })?;
            }
        } else {
            for (group, bands) in SCFSI_GROUPS.iter().enumerate() {
                if gr == 1 && side.scfsi[ch][group] != 0 {
                    continue;
                }
                for sfb in bands.clone() {
                    bs.put_bits(value(sfb), if sfb < 11 { slen1 } else { slen2 })?;
                }
            }
        }
    } else {
        let row = usize::from(gi.block_type.is_short());
        let mut sfb = 0;
        for (&slen, &nr) in gi.slen.iter().zip(NR_OF_SFB_BLOCK[gi.partition_table][row].iter()) {
            for _ in 0..nr {
                bs.put_bits(value(sfb), slen as i32)?;
                sfb += 1;
            }
        }
    }
    Ok(())
}

#[inline]
fn sign_bit(x: f32) -> u32 {
    (x < 0.0) as u32
}

fn write_pair(bs: &mut BitstreamWriter, table: usize, gi: &GrInfo, i: usize) -> EncodingResult<()> {
    let h = &HUFFMAN_TABLE[table];
    let (x, y) = (gi.l3_enc[i] as u32, gi.l3_enc[i + 1] as u32);
    let (sx, sy) = (sign_bit(gi.xr[i]), sign_bit(gi.xr[i + 1]));

    if h.linbits > 0 {
        let (cx, cy) = (x.min(15), y.min(15));
        let (code, len) = h.code(cx as usize, cy as usize);
        bs.put_bits(code, len as i32)?;
        let mut ext = 0u32;
        let mut xbits = 0u32;
        if cx == 15 {
            ext = x - 15;
            xbits += h.linbits;
        }
        if x != 0 {
            ext = (ext << 1) | sx;
            xbits += 1;
        }
        if cy == 15 {
            ext = (ext << h.linbits) | (y - 15);
            xbits += h.linbits;
        }
        if y != 0 {
            ext = (ext << 1) | sy;
            xbits += 1;
        }
        bs.put_bits(ext, xbits as i32)
    } else {
        let (mut code, mut len) = h.code(x as usize, y as usize);
        if x != 0 {
            code = (code << 1) | sx;
            len += 1;
        }
        if y != 0 {
            code = (code << 1) | sy;
            len += 1;
        }
        bs.put_bits(code, len as i32)
    }
}

/// Huffman code the big_values and count1 regions of `gi`, returning the
/// number of bits written
fn write_huffman(bs: &mut BitstreamWriter, session: &SessionConfig, gi: &GrInfo) -> EncodingResult<i32> {
    let start = bs.get_bits_count();
    let bv = gi.big_values as usize;
    let (a1, a2) = region_bounds(session, gi);

    for i in (0..bv).step_by(2) {
        let region = usize::from(i >= a1) + usize::from(i >= a2);
        let table = gi.table_select[region] as usize;
        if table != 0 {
            write_pair(bs, table, gi, i)?;
        }
    }

    let h = &HUFFMAN_TABLE[32 + gi.count1table_select as usize];
    for i in (bv..gi.count1 as usize).step_by(4) {
        let q = &gi.l3_enc[i..i + 4];
        let (code, len) = h.quad(count1_index(q[0], q[1], q[2], q[3]));
        bs.put_bits(code, len as i32)?;
        for k in 0..4 {
            if q[k] != 0 {
                bs.put_bits(sign_bit(gi.xr[i + k]), 1)?;
            }
        }
    }
    Ok(bs.get_bits_count() - start)
}

/// Write the main data of one granule and check it against the side info
fn write_granule_data(
    bs: &mut BitstreamWriter,
    session: &SessionConfig,
    side: &SideInfo,
    gr: usize,
    ch: usize,
) -> EncodingResult<i32> {
    let gi = &side.tt[gr][ch];
    let start = bs.get_bits_count();
    write_scalefactors(bs, session, side, gr, ch)?;
    let part2 = bs.get_bits_count() - start;
    let huffman = write_huffman(bs, session, gi)?;

    if part2 != gi.part2_length || huffman != gi.part2_3_length {
        error!(
            "gr {} ch {}: wrote {}+{} bits, side info says {}+{}",
            gr, ch, part2, huffman, gi.part2_length, gi.part2_3_length
        );
        return Err(EncodingError::BitstreamError(format!(
            "granule {} channel {} length mismatch: {} != {}",
            gr,
            ch,
            part2 + huffman,
            gi.main_data_bits()
        )));
    }
    Ok(part2 + huffman)
}

/// Frame whose payload is still being filled with main data
#[derive(Debug, Clone)]
struct PendingFrame {
    bytes: Vec<u8>,
    /// Payload bytes not yet filled
    free: usize,
}

/// Result of formatting one frame
#[derive(Debug, Clone, Default)]
pub struct FormattedFrame {
    /// Frames completed by this call, in stream order
    pub bytes: Vec<u8>,
    /// Main data bits actually written per granule and channel
    pub granule_bits: [[i32; MAX_CHANNELS]; MAX_GRANULES],
}

/// Assembles frames from side info and quantized granules
#[derive(Debug, Clone, Default)]
pub struct FrameFormatter {
    pending: VecDeque<PendingFrame>,
    frames_written: u64,
}

impl FrameFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes of emitted-but-incomplete frames, which the next frame's
    /// `main_data_begin` points back into
    pub fn free_bytes(&self) -> usize {
        self.pending.iter().map(|f| f.free).sum()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Format one frame.
    ///
    /// The main data stream is the previous-frame stuffing
    /// (`resv_drain_pre`), the granules in order, then this frame's stuffing
    /// (`resv_drain_post`). It must start exactly where the free space of
    /// the pending frames begins.
    pub fn format_frame(
        &mut self,
        session: &SessionConfig,
        side: &SideInfo,
        header: &FrameHeader,
    ) -> EncodingResult<FormattedFrame> {
        let free = self.free_bytes();
        let expected = side.main_data_begin as usize + (side.resv_drain_pre / 8) as usize;
        if expected != free {
            return Err(EncodingError::BitstreamError(format!(
                "main data starts {} bytes back but {} bytes are free",
                expected, free
            )));
        }

        let frame_bytes = (session.frame_bits(header.bitrate_index, header.padding) / 8) as usize;
        let mut head = BitstreamWriter::new(session.sideinfo_len);
        write_side_info(&mut head, session, side, header)?;
        let head = head.take_bytes()?;
        debug_assert_eq!(head.len(), session.sideinfo_len);

        let mut main = BitstreamWriter::new(frame_bytes);
        main.put_zeros(side.resv_drain_pre)?;
        let mut granule_bits = [[0; MAX_CHANNELS]; MAX_GRANULES];
        for gr in 0..session.mode_gr {
            for ch in 0..session.channels {
                granule_bits[gr][ch] = write_granule_data(&mut main, session, side, gr, ch)?;
            }
        }
        main.put_zeros(side.resv_drain_post)?;
        if main.get_bits_count() % 8 != 0 {
            return Err(EncodingError::BitstreamError(format!(
                "main data of {} bits is not byte aligned",
                main.get_bits_count()
            )));
        }
        let main = main.take_bytes()?;

        let payload = frame_bytes - head.len();
        let mut bytes = Vec::with_capacity(frame_bytes);
        bytes.extend_from_slice(&head);
        self.pending.push_back(PendingFrame { bytes, free: payload });
        self.frames_written += 1;

        let mut data = main.as_slice();
        for frame in self.pending.iter_mut() {
            if data.is_empty() {
                break;
            }
            let n = frame.free.min(data.len());
            frame.bytes.extend_from_slice(&data[..n]);
            frame.free -= n;
            data = &data[n..];
        }
        if !data.is_empty() {
            return Err(EncodingError::BitstreamError(format!(
                "{} bytes of main data do not fit the frame",
                data.len()
            )));
        }

        trace!("formatted frame of {} bytes, {} bytes free", frame_bytes, self.free_bytes());
        Ok(FormattedFrame { bytes: self.take_complete(), granule_bits })
    }

    fn take_complete(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.pending.front().is_some_and(|f| f.free == 0) {
            if let Some(frame) = self.pending.pop_front() {
                out.extend_from_slice(&frame.bytes);
            }
        }
        out
    }

    /// Zero fill the remaining payload and hand out every pending frame
    pub fn flush(&mut self) -> Vec<u8> {
        for frame in self.pending.iter_mut() {
            frame.bytes.resize(frame.bytes.len() + frame.free, 0);
            frame.free = 0;
        }
        self.take_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::quantize::init_outer_loop;
    use proptest::prelude::*;

    fn session(cfg: EncoderConfig) -> SessionConfig {
        SessionConfig::from_config(&cfg).unwrap()
    }

    fn silent_side(s: &SessionConfig) -> SideInfo {
        let mut side = SideInfo::default();
        for gr in 0..s.mode_gr {
            for ch in 0..s.channels {
                init_outer_loop(s, &mut side.tt[gr][ch]);
            }
        }
        side
    }

    #[test]
    fn test_put_bits_packs_msb_first() {
        let mut bs = BitstreamWriter::new(8);
        bs.put_bits(0b101, 3).unwrap();
        bs.put_bits(0x1f, 5).unwrap();
        bs.put_bits(0xabcdef, 24).unwrap();
        bs.put_bits(1, 1).unwrap();
        assert_eq!(bs.get_bits_count(), 33);
        assert_eq!(bs.take_bytes().unwrap(), vec![0xbf, 0xab, 0xcd, 0xef, 0x80]);
    }

    #[test]
    fn test_put_bits_rejects_wide_values() {
        let mut bs = BitstreamWriter::new(4);
        assert!(bs.put_bits(4, 2).is_err());
        assert!(bs.put_bits(0, 33).is_err());
        assert!(bs.put_bits(u32::MAX, 32).is_ok());
    }

    #[test]
    fn test_silent_frame_layout() {
        let s = session(EncoderConfig::default());
        let mut side = silent_side(&s);
        let mut fmt = FrameFormatter::new();
        let header = FrameHeader { bitrate_index: s.bitrate_index, padding: false, mid_side: false };
        side.resv_drain_post = (s.frame_bits(s.bitrate_index, false) - 8 * s.sideinfo_len as i32) / 8 * 8;
        let out = fmt.format_frame(&s, &side, &header).unwrap();
        assert_eq!(out.bytes.len(), 417);
        assert_eq!(&out.bytes[..2], &[0xff, 0xfb]);
        assert_eq!(fmt.free_bytes(), 0);
    }

    #[test]
    fn test_frame_waits_for_borrowed_payload() {
        let s = session(EncoderConfig::default());
        let mut fmt = FrameFormatter::new();
        let header = FrameHeader { bitrate_index: s.bitrate_index, padding: false, mid_side: false };
        let side = silent_side(&s);
        // nothing written: the whole payload stays free for the next frame
        let out = fmt.format_frame(&s, &side, &header).unwrap();
        assert!(out.bytes.is_empty());
        assert_eq!(fmt.free_bytes(), 417 - 36);

        let mut next = silent_side(&s);
        next.main_data_begin = 100;
        next.resv_drain_pre = 8 * (417 - 36 - 100);
        let out = fmt.format_frame(&s, &next, &header).unwrap();
        assert_eq!(out.bytes.len(), 417);
        assert_eq!(fmt.free_bytes(), 417 - 36);
        assert_eq!(fmt.flush().len(), 417);
        assert_eq!(fmt.free_bytes(), 0);
    }

    #[test]
    fn test_mismatched_back_pointer_is_rejected() {
        let s = session(EncoderConfig::default());
        let mut fmt = FrameFormatter::new();
        let header = FrameHeader { bitrate_index: s.bitrate_index, padding: false, mid_side: false };
        let mut side = silent_side(&s);
        side.main_data_begin = 3;
        assert!(fmt.format_frame(&s, &side, &header).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 100,
            verbose: 0,
            max_shrink_iters: 0,
            failure_persistence: None,
            ..ProptestConfig::default()
        })]

        #[test]
        fn property_bit_count_matches_writer(values in prop::collection::vec(-3i32..=3, 64..200)) {
            let s = session(EncoderConfig::default());
            let mut side = silent_side(&s);
            let gi = &mut side.tt[0][0];
            for (i, &v) in values.iter().enumerate() {
                gi.l3_enc[i] = v.abs();
                gi.xr[i] = v as f32;
            }
            gi.max_nonzero_coeff = values.len() | 1;
            let bits = crate::bit_count::noquant_count_bits(&s, gi);
            gi.part2_3_length = bits;
            let mut bs = BitstreamWriter::new(64);
            let written = write_huffman(&mut bs, &s, &side.tt[0][0]).unwrap();
            prop_assert_eq!(written, bits);
        }
    }
}
