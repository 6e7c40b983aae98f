//! The CELT frame decoder.
///
/// One `decode_frame` call turns a compressed payload into a block of PCM samples at 48 kHz,
/// driving the whole pipeline: frame flags, coarse/fine band energies, time-frequency resolution,
/// dynamic allocation boosts, the allocation search, the PVQ band loop, anti-collapse, band
/// denormalisation, the inverse MDCT with overlap-add, and the de-emphasis filter.
///
/// The decoder owns the inter-frame state: previous band energies, the MDCT overlap tail, the
/// de-emphasis memory, and the noise generator seed. A frame depends on all of them, which is
/// why even silence runs the full synthesis chain; skipping it would corrupt the first 120
/// samples of the next frame.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3
use log::debug;

use cadenza_core::dsp::mdct::Imdct;
use cadenza_core::errors::Result;

use crate::celt::bands::{anti_collapse, denormalise_bands, quant_all_bands};
use crate::celt::energy::{unquant_coarse_energy, unquant_energy_finalise, unquant_fine_energy};
use crate::celt::mode::{Bandwidth, Mode, MAX_BANDS, MAX_FRAME_SIZE, SHORT_BLOCK_SIZE};
use crate::celt::rate::{band_width, compute_allocation, init_caps};
use crate::celt::tables::{POSTFILTER_TAPS, SPREAD_ICDF, TAPSET_ICDF, TF_SELECT_TABLE, TRIM_ICDF};
use crate::celt::trace::CeltTrace;
use crate::celt::vq::Spread;
use crate::celt::window::WINDOW;
use crate::error::Error;
use crate::range::RangeDecoder;

/// The window overlap between consecutive MDCTs, fixed for all frame sizes.
const OVERLAP: usize = SHORT_BLOCK_SIZE;

/// Shortest post-filter pitch period.
const MIN_PERIOD: usize = 15;

/// The de-emphasis filter coefficient.
const DEEMPH_COEF: f32 = 0.85;

/// Energy floor in log2 units for silent or out-of-range bands.
const ENERGY_FLOOR: f32 = -28.0;

/// Post-filter parameters parsed from the frame header. The filter itself is applied by an
/// outer layer; the decoder only decodes and surfaces the values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostFilter {
    pub period: usize,
    pub gain: f32,
    pub tapset: usize,
    pub gains: [f32; 3],
}

/// A CELT decoder instance. One instance decodes one mono or stereo stream.
pub struct CeltDecoder {
    channels: usize,
    bandwidth: Bandwidth,

    /// Working band energies, also the inter-frame prediction state.
    band_energy: [f32; 2 * MAX_BANDS],
    /// Band energies of the previous frame.
    prev_energy: [f32; 2 * MAX_BANDS],
    /// Band energies of the frame before that.
    prev_energy2: [f32; 2 * MAX_BANDS],

    /// Windowed MDCT tail awaiting overlap-add with the next frame, per channel.
    overlap: Vec<f32>,
    deemph_mem: [f32; 2],

    /// Noise generator state shared by folding, anti-collapse, and noise fill.
    rng: u32,

    spread_decision: Spread,
    tapset_decision: usize,
    postfilter: Option<PostFilter>,
    disable_inv: bool,

    trace: Option<Box<dyn CeltTrace>>,

    // Per-frame scratch, arena style. Logically rebuilt each frame.
    coeffs: Vec<Vec<f32>>,
    freq: Vec<f32>,
    block_in: Vec<f32>,
    block_out: Vec<f32>,
    syn: Vec<f32>,
    out: Vec<f32>,
    norm_arena: Vec<f32>,
    scratch_arena: Vec<f32>,

    /// IMDCT instances per block size, created on first use.
    imdcts: [Option<Imdct>; 4],
}

impl CeltDecoder {
    pub fn try_new(channels: usize) -> Result<Self> {
        if channels != 1 && channels != 2 {
            return Err(Error::InvalidChannelCount.into());
        }

        return Ok(CeltDecoder {
            channels,
            bandwidth: Bandwidth::FullBand,
            band_energy: [0.0; 2 * MAX_BANDS],
            prev_energy: [0.0; 2 * MAX_BANDS],
            prev_energy2: [0.0; 2 * MAX_BANDS],
            overlap: vec![0.0; channels * OVERLAP],
            deemph_mem: [0.0; 2],
            rng: 0,
            spread_decision: Spread::Normal,
            tapset_decision: 0,
            postfilter: None,
            disable_inv: false,
            trace: None,
            coeffs: vec![vec![0.0; MAX_FRAME_SIZE]; channels],
            freq: vec![0.0; MAX_FRAME_SIZE],
            block_in: vec![0.0; MAX_FRAME_SIZE],
            block_out: vec![0.0; 2 * MAX_FRAME_SIZE],
            syn: vec![0.0; MAX_FRAME_SIZE + OVERLAP],
            out: vec![0.0; channels * MAX_FRAME_SIZE],
            norm_arena: Vec::new(),
            scratch_arena: Vec::new(),
            imdcts: [None, None, None, None],
        });
    }

    /// Reset all inter-frame state, as after a decoder recreation.
    pub fn reset(&mut self) {
        self.band_energy.fill(0.0);
        self.prev_energy.fill(0.0);
        self.prev_energy2.fill(0.0);
        self.overlap.fill(0.0);
        self.deemph_mem = [0.0; 2];
        self.rng = 0;
        self.spread_decision = Spread::Normal;
        self.tapset_decision = 0;
        self.postfilter = None;

        // Scratch may feed folding sources; do not leak previous frame data through a reset.
        for coeffs in self.coeffs.iter_mut() {
            coeffs.fill(0.0);
        }
        self.freq.fill(0.0);
        self.out.fill(0.0);
    }

    /// Restrict decoding to the bands within `bandwidth` for subsequent frames.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.bandwidth = bandwidth;
    }

    /// Install a tracing hook.
    pub fn set_trace(&mut self, trace: Box<dyn CeltTrace>) {
        self.trace = Some(trace);
    }

    pub fn channels(&self) -> usize {
        return self.channels;
    }

    pub fn bandwidth(&self) -> Bandwidth {
        return self.bandwidth;
    }

    pub fn prev_energy(&self) -> &[f32] {
        return &self.prev_energy[..self.channels * MAX_BANDS];
    }

    pub fn prev_energy2(&self) -> &[f32] {
        return &self.prev_energy2[..self.channels * MAX_BANDS];
    }

    pub fn overlap_buffer(&self) -> &[f32] {
        return &self.overlap;
    }

    /// The post-filter parameters of the most recent frame, if the frame coded any.
    pub fn postfilter(&self) -> Option<PostFilter> {
        return self.postfilter;
    }

    /// Decode one frame. Returns `frame_size` samples per channel; stereo output is interleaved
    /// L, R.
    pub fn decode_frame(&mut self, payload: &[u8], frame_size: usize) -> Result<&[f32]> {
        let mode = *Mode::for_frame_size(frame_size)?;
        let lm = mode.lm;
        let m = mode.multiplier();
        let channels = self.channels;
        let start = 0usize;
        let end = self.bandwidth.end_band();

        let mut rd = RangeDecoder::new(payload);
        let total_bits = rd.total_bits();

        // Silence probe. A frame that is out of bits before it starts is silent by definition.
        let silence = rd.tell() >= total_bits || rd.decode_bit_logp(15);
        if silence {
            // Pretend to be at the end of the buffer so every remaining symbol decodes to its
            // sentinel.
            rd.to_end();
        }

        // Post-filter parameters are decoded here but applied by an outer layer.
        self.postfilter = None;
        if start == 0 && rd.tell() + 16 <= total_bits && rd.decode_bit_logp(1) {
            let octave = rd.decode_uniform(6);
            let period = (16usize << octave) + rd.decode_raw_bits(4 + octave) as usize - 1;
            let gain = 0.09375 * (rd.decode_raw_bits(3) + 1) as f32;

            let tapset = if rd.tell() + 2 <= total_bits { rd.decode_icdf(&TAPSET_ICDF, 2) } else { 0 };
            self.tapset_decision = tapset;

            let taps = &POSTFILTER_TAPS[tapset];
            self.postfilter = Some(PostFilter {
                period: period.max(MIN_PERIOD),
                gain,
                tapset,
                gains: [taps[0] * gain, taps[1] * gain, taps[2] * gain],
            });

            debug!("postfilter: octave {}, period {}, gain {}, tapset {}", octave, period, gain, tapset);
        }

        let transient = lm > 0 && rd.tell() + 3 <= total_bits && rd.decode_bit_logp(3);
        let short_blocks = if transient { mode.short_blocks } else { 1 };

        let intra = rd.tell() + 3 <= total_bits && rd.decode_bit_logp(3);

        debug!("frame: size {}, transient {}, intra {}, silence {}", frame_size, transient, intra, silence);

        if let Some(trace) = self.trace.as_mut() {
            trace.header(frame_size, transient, intra, silence);
        }

        unquant_coarse_energy(&mut self.band_energy, start, end, intra, &mut rd, channels, lm);

        let mut tf_res = [0i8; MAX_BANDS];
        tf_decode(start, end, transient, &mut tf_res, lm, &mut rd);

        self.spread_decision = if rd.tell() + 4 <= total_bits {
            Spread::from_index(rd.decode_icdf(&SPREAD_ICDF, 5))
        }
        else {
            Spread::Normal
        };

        let mut cap = [0i32; MAX_BANDS];
        init_caps(&mut cap, lm, channels, end);

        // Dynalloc boosts. The flag probability starts at 1/64 and rises towards 1/4 as bands
        // use boosts.
        let total_bits_q3 = (total_bits << 3) as i32;
        let mut offsets = [0i32; MAX_BANDS];
        let mut dynalloc_logp = 6u32;
        let mut total_boost = 0i32;
        let mut tell_frac = rd.tell_frac() as i32;

        for band in start..end {
            let width = ((channels * (band_width(band) as usize)) << lm) as i32;

            // One sixth-bit quantum per boost, but at least 1/8 bit per sample and at most one
            // bit per sample.
            let quanta = (width << 3).min((6 << 3).max(width));

            let mut loop_logp = dynalloc_logp;
            let mut boost = 0;

            while tell_frac + ((loop_logp as i32) << 3) < total_bits_q3 - total_boost
                && boost < cap[band]
            {
                let flag = rd.decode_bit_logp(loop_logp);
                tell_frac = rd.tell_frac() as i32;
                if !flag {
                    break;
                }
                boost += quanta;
                total_boost += quanta;
                loop_logp = 1;
            }

            offsets[band] = boost;

            if boost > 0 {
                dynalloc_logp = 2.max(dynalloc_logp - 1);
            }
        }

        let alloc_trim = if rd.tell_frac() as i32 + (6 << 3) <= total_bits_q3 - total_boost {
            rd.decode_icdf(&TRIM_ICDF, 7) as i32
        }
        else {
            5
        };

        let mut bits = total_bits_q3 - rd.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if transient && lm >= 2 && bits >= ((lm as i32) + 2) << 3 { 1 << 3 } else { 0 };
        bits -= anti_collapse_rsv;

        let mut pulses = [0i32; MAX_BANDS];
        let mut fine_quant = [0i32; MAX_BANDS];
        let mut fine_priority = [false; MAX_BANDS];

        let alloc = compute_allocation(
            start,
            end,
            &offsets,
            &cap,
            alloc_trim,
            bits,
            &mut pulses,
            &mut fine_quant,
            &mut fine_priority,
            channels,
            lm,
            &mut rd,
        );

        if let Some(trace) = self.trace.as_mut() {
            for band in start..end {
                trace.allocation(band, pulses[band], fine_quant[band]);
            }
        }

        unquant_fine_energy(&mut self.band_energy, start, end, &fine_quant, &mut rd, channels);

        // Decode the band shapes.
        let mut collapse = [0u8; 2 * MAX_BANDS];
        {
            let coeffs_len = m * crate::celt::tables::EBANDS[MAX_BANDS] as usize;
            let (first, rest) = self.coeffs.split_at_mut(1);
            let x = &mut first[0][..coeffs_len];
            let y = if channels == 2 { Some(&mut rest[0][..coeffs_len]) } else { None };

            quant_all_bands(
                start,
                end,
                x,
                y,
                &mut collapse[..channels * MAX_BANDS],
                &pulses,
                short_blocks > 1,
                self.spread_decision,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits_q3 - anti_collapse_rsv,
                alloc.balance,
                &mut rd,
                lm,
                alloc.coded_bands,
                &mut self.rng,
                self.disable_inv,
                &mut self.norm_arena,
                &mut self.scratch_arena,
            );
        }

        let anti_collapse_on = anti_collapse_rsv > 0 && rd.decode_raw_bits(1) != 0;

        unquant_energy_finalise(
            &mut self.band_energy,
            start,
            end,
            &fine_quant,
            &fine_priority,
            total_bits as i32 - rd.tell() as i32,
            &mut rd,
            channels,
        );

        if let Some(trace) = self.trace.as_mut() {
            for c in 0..channels {
                for band in start..end {
                    trace.energy(band, c, self.band_energy[c * MAX_BANDS + band]);
                    trace.pvq(band, c, collapse[band * channels + c]);
                }
            }
        }

        if anti_collapse_on {
            anti_collapse(
                &mut self.coeffs,
                &collapse[..channels * MAX_BANDS],
                lm,
                channels,
                start,
                end,
                &self.band_energy,
                &self.prev_energy,
                &self.prev_energy2,
                &pulses,
                self.rng,
            );
        }

        if silence {
            self.band_energy.fill(ENERGY_FLOOR);
        }

        self.synthesize(&mode, transient, silence, start, end);

        // Energy history. A transient frame only lowers the floor so anti-collapse stays armed.
        if transient {
            for (prev, &cur) in self.prev_energy.iter_mut().zip(self.band_energy.iter()) {
                *prev = prev.min(cur);
            }
        }
        else {
            self.prev_energy2 = self.prev_energy;
            for (prev, &cur) in self.prev_energy.iter_mut().zip(self.band_energy.iter()) {
                *prev = cur.max(ENERGY_FLOOR);
            }
        }

        // Bands outside the coded range hold no usable history.
        for c in 0..2 {
            for band in end..MAX_BANDS {
                self.band_energy[c * MAX_BANDS + band] = 0.0;
                self.prev_energy[c * MAX_BANDS + band] = ENERGY_FLOOR;
                self.prev_energy2[c * MAX_BANDS + band] = ENERGY_FLOOR;
            }
        }

        return Ok(&self.out[..channels * frame_size]);
    }

    /// Denormalise, run the IMDCT(s), overlap-add, and de-emphasise each channel.
    fn synthesize(&mut self, mode: &Mode, transient: bool, silence: bool, start: usize, end: usize) {
        let n = mode.frame_size;
        let m = mode.multiplier();
        let blocks = if transient { mode.short_blocks } else { 1 };
        let block_len = n / blocks;

        let lm_block = block_len / SHORT_BLOCK_SIZE;
        let imdct_index = lm_block.trailing_zeros() as usize;
        let imdct =
            self.imdcts[imdct_index].get_or_insert_with(|| Imdct::new(block_len));

        let window = &*WINDOW;

        for c in 0..self.channels {
            denormalise_bands(
                &self.coeffs[c],
                &mut self.freq[..n],
                &self.band_energy[c * MAX_BANDS..(c + 1) * MAX_BANDS],
                start,
                end,
                m,
                silence,
            );

            if let Some(trace) = self.trace.as_mut() {
                trace.coeffs(c, &self.freq[..n]);
            }

            // Each short block owns a 120-sample overlap with its neighbour; the last block's
            // tail becomes the next frame's overlap.
            let syn = &mut self.syn[..n + OVERLAP];
            syn.fill(0.0);

            for blk in 0..blocks {
                // Coefficients of the short blocks are interleaved.
                for (j, v) in self.block_in[..block_len].iter_mut().enumerate() {
                    *v = self.freq[j * blocks + blk];
                }

                let out = &mut self.block_out[..2 * block_len];
                imdct.imdct(&self.block_in[..block_len], out);

                // Window the centre block_len + overlap samples and overlap-add into place.
                let half = (block_len - OVERLAP) / 2;
                let base = blk * block_len;

                for i in 0..block_len + OVERLAP {
                    let w = if i < OVERLAP {
                        window[i]
                    }
                    else if i < block_len {
                        1.0
                    }
                    else {
                        window[block_len + OVERLAP - 1 - i]
                    };

                    syn[base + i] += (f64::from(out[half + i]) * w) as f32;
                }
            }

            // Overlap-add against the tail of the previous frame.
            let prev = &mut self.overlap[c * OVERLAP..(c + 1) * OVERLAP];
            for i in 0..OVERLAP {
                syn[i] += prev[i];
            }
            prev.copy_from_slice(&syn[n..n + OVERLAP]);

            // First order de-emphasis, state held across frames.
            let mut mem = self.deemph_mem[c];
            for (i, s) in syn[..n].iter().enumerate() {
                let value = s + mem;
                mem = DEEMPH_COEF * value;
                self.out[i * self.channels + c] = value;
            }
            self.deemph_mem[c] = mem;

            if let Some(trace) = self.trace.as_mut() {
                trace.synthesis(c, &self.syn[..n]);
            }
        }
    }
}

/// Decode the per-band time-frequency resolution switches.
fn tf_decode(
    start: usize,
    end: usize,
    transient: bool,
    tf_res: &mut [i8; MAX_BANDS],
    lm: usize,
    rd: &mut RangeDecoder<'_>,
) {
    let mut budget = rd.total_bits();
    let mut tell = rd.tell();

    let mut logp: u32 = if transient { 2 } else { 4 };

    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    budget -= u32::from(tf_select_rsv);

    let mut curr = false;
    let mut tf_changed = false;

    for res in tf_res[start..end].iter_mut() {
        if tell + logp <= budget {
            curr ^= rd.decode_bit_logp(logp);
            tell = rd.tell();
            tf_changed |= curr;
        }
        *res = i8::from(curr);
        logp = if transient { 4 } else { 5 };
    }

    let row = &TF_SELECT_TABLE[lm];
    let base = 4 * usize::from(transient);

    let mut tf_select = 0usize;
    if tf_select_rsv
        && row[base + usize::from(tf_changed)] != row[base + 2 + usize::from(tf_changed)]
    {
        tf_select = usize::from(rd.decode_bit_logp(1));
    }

    for res in tf_res[start..end].iter_mut() {
        *res = row[base + 2 * tf_select + (*res as usize)];
    }
}

#[cfg(test)]
mod tests {
    use std::sync::LazyLock;

    use serial_test::serial;

    use super::*;

    static LOGGER: LazyLock<(), fn()> = LazyLock::new(init_logger);
    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    #[serial]
    fn mono_silence_frame() {
        LazyLock::force(&LOGGER);
        // A one byte payload has no bits to spend, which is a silence frame.
        let mut decoder = CeltDecoder::try_new(1).unwrap();
        let samples = decoder.decode_frame(&[0x80], 960).unwrap();

        assert_eq!(samples.len(), 960);
        assert!(samples.iter().all(|&s| s.abs() < 1e-12));
    }

    #[test]
    fn stereo_silence_frame() {
        let mut decoder = CeltDecoder::try_new(2).unwrap();
        let samples = decoder.decode_frame(&[0x80], 960).unwrap();

        assert_eq!(samples.len(), 2 * 960);
        assert!(samples.iter().all(|&s| s.abs() < 1e-12));
    }

    #[test]
    fn empty_payload_probe() {
        // An empty payload still produces a full, finite frame.
        let mut decoder = CeltDecoder::try_new(1).unwrap();
        let samples = decoder.decode_frame(&[], 480).unwrap();

        assert_eq!(samples.len(), 480);
        assert!(samples.iter().all(|s| s.is_finite()));
        assert!(samples.iter().all(|s| s.abs() <= 0.25));
    }

    #[test]
    fn consecutive_empty_payloads_keep_frame_size() {
        let mut decoder = CeltDecoder::try_new(1).unwrap();

        for _ in 0..5 {
            let samples = decoder.decode_frame(&[], 960).unwrap();
            assert_eq!(samples.len(), 960);
            assert!(samples.iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn invalid_frame_size_is_fatal_and_state_preserving() {
        let mut decoder = CeltDecoder::try_new(1).unwrap();

        let before = *decoder.prev_energy().first().unwrap();
        assert!(decoder.decode_frame(&[0x80, 0x11, 0x22], 100).is_err());
        assert_eq!(*decoder.prev_energy().first().unwrap(), before);

        for frame_size in [0usize, 119, 121, 1920] {
            assert!(decoder.decode_frame(&[0x80], frame_size).is_err());
        }
    }

    #[test]
    fn all_frame_sizes_produce_exact_lengths() {
        for &frame_size in &[120usize, 240, 480, 960] {
            let mut decoder = CeltDecoder::try_new(1).unwrap();
            let samples = decoder.decode_frame(&[0x42; 50], frame_size).unwrap();
            assert_eq!(samples.len(), frame_size);
            assert!(samples.iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn stereo_output_is_interleaved_and_sized() {
        for &frame_size in &[120usize, 960] {
            let mut decoder = CeltDecoder::try_new(2).unwrap();
            let samples = decoder.decode_frame(&[0x42; 80], frame_size).unwrap();
            assert_eq!(samples.len(), 2 * frame_size);
        }
    }

    #[test]
    fn reset_clears_all_history() {
        let mut decoder = CeltDecoder::try_new(2).unwrap();
        decoder.decode_frame(&[0xA7; 100], 960).unwrap();
        decoder.reset();

        assert!(decoder.prev_energy().iter().all(|&e| e == 0.0));
        assert!(decoder.prev_energy2().iter().all(|&e| e == 0.0));
        assert!(decoder.overlap_buffer().iter().all(|&s| s == 0.0));
        assert_eq!(decoder.deemph_mem, [0.0; 2]);
        assert_eq!(decoder.rng, 0);
    }

    #[test]
    #[serial]
    fn silence_drains_the_overlap_buffer() {
        LazyLock::force(&LOGGER);
        let mut decoder = CeltDecoder::try_new(1).unwrap();

        // A non-silent noisy frame charges the overlap buffer.
        decoder.decode_frame(&[0x1F; 120], 960).unwrap();

        // Consecutive silence frames must walk the overlap tail to zero.
        let mut peak = f32::MAX;
        for _ in 0..8 {
            decoder.decode_frame(&[0x80], 960).unwrap();
            let tail = decoder.overlap_buffer().iter().fold(0.0f32, |a, &s| a.max(s.abs()));
            assert!(tail <= peak || tail < 1e-12);
            peak = tail;
        }

        assert!(decoder.overlap_buffer().iter().all(|&s| s.abs() < 1e-9));
    }

    #[test]
    fn zero_spectrum_synthesis_is_clean() {
        // Silence frames exercise IMDCT + overlap + de-emphasis over a zero spectrum for every
        // size; the output must stay NaN/Inf free and decay.
        for &frame_size in &[120usize, 240, 480, 960] {
            let mut decoder = CeltDecoder::try_new(1).unwrap();

            let first: Vec<f32> = decoder.decode_frame(&[0x80], frame_size).unwrap().to_vec();
            let second: Vec<f32> = decoder.decode_frame(&[0x80], frame_size).unwrap().to_vec();

            assert!(first.iter().chain(second.iter()).all(|s| s.is_finite()));

            let peak1 = first.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
            let peak2 = second.iter().fold(0.0f32, |a, &s| a.max(s.abs()));
            assert!(peak2 <= peak1 + 1e-12);
        }
    }

    #[test]
    fn postfilter_parameters_are_surfaced() {
        // Drive many arbitrary payloads; whenever a post-filter is parsed its parameters are
        // sane.
        for seed in 0u8..32 {
            let payload: Vec<u8> = (0..60).map(|i| seed.wrapping_mul(31).wrapping_add(i * 7)).collect();
            let mut decoder = CeltDecoder::try_new(1).unwrap();
            decoder.decode_frame(&payload, 480).unwrap();

            if let Some(pf) = decoder.postfilter() {
                assert!(pf.period >= MIN_PERIOD);
                assert!(pf.gain > 0.0 && pf.gain <= 0.75);
                assert!(pf.tapset < 3);
            }
        }
    }

    #[test]
    fn bandwidth_cap_limits_decoded_bands() {
        let mut decoder = CeltDecoder::try_new(1).unwrap();
        decoder.set_bandwidth(Bandwidth::NarrowBand);

        decoder.decode_frame(&[0x3C; 60], 480).unwrap();

        // Bands beyond the cap carry the silent-history floor.
        for band in Bandwidth::NarrowBand.end_band()..MAX_BANDS {
            assert_eq!(decoder.prev_energy()[band], ENERGY_FLOOR);
        }
    }

    #[test]
    fn arbitrary_payloads_never_panic() {
        // Structured garbage of every flavour must decode to a finite frame.
        for seed in 0u16..64 {
            let payload: Vec<u8> =
                (0..(seed as usize % 200)).map(|i| (seed as usize * 131 + i * 17) as u8).collect();

            let mut decoder = CeltDecoder::try_new(1 + (seed as usize) % 2).unwrap();
            let samples = decoder.decode_frame(&payload, 960).unwrap();
            assert!(samples.iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn deemphasis_memory_carries_across_frames() {
        // After a non-silent frame, a silence frame's samples past the overlap region are pure
        // filter decay: y[n] = 0.85 * y[n-1].
        let mut decoder = CeltDecoder::try_new(1).unwrap();
        decoder.decode_frame(&[0x2D; 100], 480).unwrap();

        let samples: Vec<f32> = decoder.decode_frame(&[0x80], 480).unwrap().to_vec();

        for i in OVERLAP + 1..480 {
            let predicted = DEEMPH_COEF * samples[i - 1];
            assert!(
                (samples[i] - predicted).abs() <= 1e-6 * (1.0 + predicted.abs()),
                "sample {}: {} != {}",
                i,
                samples[i],
                predicted
            );
        }
    }

    #[test]
    fn trace_hook_sees_every_stage() {
        #[derive(Default)]
        struct Recorder {
            headers: usize,
            energies: usize,
            allocations: usize,
            pvq: usize,
            coeffs: usize,
            synthesis: usize,
        }

        impl CeltTrace for Recorder {
            fn header(&mut self, _: usize, _: bool, _: bool, _: bool) {
                self.headers += 1;
            }
            fn energy(&mut self, _: usize, _: usize, _: f32) {
                self.energies += 1;
            }
            fn allocation(&mut self, _: usize, _: i32, _: i32) {
                self.allocations += 1;
            }
            fn pvq(&mut self, _: usize, _: usize, _: u8) {
                self.pvq += 1;
            }
            fn coeffs(&mut self, _: usize, _: &[f32]) {
                self.coeffs += 1;
            }
            fn synthesis(&mut self, _: usize, _: &[f32]) {
                self.synthesis += 1;
            }
        }

        // The hook is invoked inline, so drive a frame and pull the recorder back out through
        // a fresh decode observing the same counts.
        struct Shared(std::sync::Arc<std::sync::Mutex<Recorder>>);
        impl CeltTrace for Shared {
            fn header(&mut self, a: usize, b: bool, c: bool, d: bool) {
                self.0.lock().unwrap().header(a, b, c, d);
            }
            fn energy(&mut self, a: usize, b: usize, c: f32) {
                self.0.lock().unwrap().energy(a, b, c);
            }
            fn allocation(&mut self, a: usize, b: i32, c: i32) {
                self.0.lock().unwrap().allocation(a, b, c);
            }
            fn pvq(&mut self, a: usize, b: usize, c: u8) {
                self.0.lock().unwrap().pvq(a, b, c);
            }
            fn coeffs(&mut self, a: usize, b: &[f32]) {
                self.0.lock().unwrap().coeffs(a, b);
            }
            fn synthesis(&mut self, a: usize, b: &[f32]) {
                self.0.lock().unwrap().synthesis(a, b);
            }
        }

        let recorder = std::sync::Arc::new(std::sync::Mutex::new(Recorder::default()));

        let mut decoder = CeltDecoder::try_new(2).unwrap();
        decoder.set_trace(Box::new(Shared(std::sync::Arc::clone(&recorder))));
        decoder.decode_frame(&[0x51; 120], 960).unwrap();

        let recorder = recorder.lock().unwrap();
        assert_eq!(recorder.headers, 1);
        assert_eq!(recorder.energies, 2 * MAX_BANDS);
        assert_eq!(recorder.allocations, MAX_BANDS);
        assert_eq!(recorder.pvq, 2 * MAX_BANDS);
        assert_eq!(recorder.coeffs, 2);
        assert_eq!(recorder.synthesis, 2);
    }

    #[test]
    fn tf_decode_defaults_without_bits() {
        let mut rd = RangeDecoder::new(&[]);
        let mut tf_res = [9i8; MAX_BANDS];

        tf_decode(0, MAX_BANDS, false, &mut tf_res, 3, &mut rd);

        // With no bits, every band takes entry zero of the select table.
        assert!(tf_res[..MAX_BANDS].iter().all(|&r| r == TF_SELECT_TABLE[3][0]));
    }
}
