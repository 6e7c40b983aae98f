//! Band shape decoding, folding, and the stereo split machinery.
///
/// Every coded band is reduced to unit-norm PVQ shapes by a recursive splitter. Long-MDCT bands
/// split in half until each partition fits a 32-bit codebook index; stereo bands split into mid
/// and side weighted by a coded angle theta; transient bands interleave their short blocks
/// through a Hadamard transform so one vector spans all blocks. Bands that receive no pulses
/// fold a copy of the most recent coded spectrum below them, or plain noise when there is none.
///
/// The decoder-side state threaded through the recursion lives in `BandCtx`. Collapse masks are
/// tracked per (band, channel) so anti-collapse and the next frame's folding know which short
/// blocks went silent.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3.4
use log::warn;

use crate::celt::cwrs::get_pulses;
use crate::celt::math::{bitexact_cos, bitexact_log2tan, frac_mul16, isqrt32, lcg_rand};
use crate::celt::mode::MAX_BANDS;
use crate::celt::rate::{band_width, bits2pulses, cache_row, pulses2bits};
use crate::celt::tables::{
    BIT_DEINTERLEAVE_TABLE, BIT_INTERLEAVE_TABLE, EBANDS, EMEANS, EXP2_TABLE8, LOG_N,
    ORDERY_TABLE,
};
use crate::celt::vq::{alg_unquant, renormalise_vector, Spread};
use crate::range::RangeDecoder;

const QTHETA_OFFSET: i32 = 4;
const QTHETA_OFFSET_TWOPHASE: i32 = 16;

/// Decoder-side state threaded through the band recursion.
pub struct BandCtx<'a, 'b> {
    pub rd: &'a mut RangeDecoder<'b>,
    /// Band currently being decoded.
    pub band: usize,
    pub intensity: usize,
    pub spread: Spread,
    pub tf_change: i8,
    pub remaining_bits: i32,
    pub seed: u32,
    pub disable_inv: bool,
    /// Scratch for PVQ expansion.
    pub iy: Vec<i32>,
    pub row: Vec<u32>,
    /// Scratch for the Hadamard reorderings.
    pub reorder: Vec<f32>,
}

/// In-place single-level Haar transform over `n0` samples at the given stride.
fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    const INV_SQRT2: f32 = std::f32::consts::FRAC_1_SQRT_2;

    let n0 = n0 >> 1;
    for i in 0..stride {
        for j in 0..n0 {
            let a = INV_SQRT2 * x[stride * 2 * j + i];
            let b = INV_SQRT2 * x[stride * (2 * j + 1) + i];
            x[stride * 2 * j + i] = a + b;
            x[stride * (2 * j + 1) + i] = a - b;
        }
    }
}

fn ordery(stride: usize) -> &'static [usize] {
    // Rows for strides 2, 4, 8, and 16 are concatenated.
    return match stride {
        2 => &ORDERY_TABLE[0..2],
        4 => &ORDERY_TABLE[2..6],
        8 => &ORDERY_TABLE[6..14],
        16 => &ORDERY_TABLE[14..30],
        _ => unreachable!(),
    };
}

/// Reorganize samples from time order back to frequency order.
fn interleave_hadamard(x: &mut [f32], scratch: &mut Vec<f32>, n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;

    scratch.clear();
    scratch.resize(n, 0.0);

    if hadamard {
        let ordery = ordery(stride);

        for i in 0..stride {
            for j in 0..n0 {
                scratch[j * stride + i] = x[ordery[i] * n0 + j];
            }
        }
    }
    else {
        for i in 0..stride {
            for j in 0..n0 {
                scratch[j * stride + i] = x[i * n0 + j];
            }
        }
    }

    x[..n].copy_from_slice(&scratch[..n]);
}

/// Reorganize samples from frequency order into time order.
fn deinterleave_hadamard(x: &mut [f32], scratch: &mut Vec<f32>, n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;

    scratch.clear();
    scratch.resize(n, 0.0);

    if hadamard {
        let ordery = ordery(stride);

        for i in 0..stride {
            for j in 0..n0 {
                scratch[ordery[i] * n0 + j] = x[j * stride + i];
            }
        }
    }
    else {
        for i in 0..stride {
            for j in 0..n0 {
                scratch[i * n0 + j] = x[j * stride + i];
            }
        }
    }

    x[..n].copy_from_slice(&scratch[..n]);
}

/// Number of quantisation steps for the theta angle of a split of width `n` with `b` bits.
fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    let mut n2 = 2 * (n as i32) - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }

    // The upper limit keeps enough bits for at least one pulse in the side; a collapsed side
    // cannot be folded.
    let mut qb = (b + n2 * offset) / n2;
    qb = qb.min(b - pulse_cap - (4 << 3));
    qb = qb.min(8 << 3);

    if qb < (1 << 3 >> 1) {
        return 1;
    }

    let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> 3));
    let qn = ((qn + 1) >> 1) << 1;
    debug_assert!(qn <= 256);

    return qn;
}

struct SplitCtx {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Decode the theta angle controlling a mid/side or time split, and derive the gain weights and
/// bit imbalance for the two halves.
fn compute_theta(
    ctx: &mut BandCtx<'_, '_>,
    n: usize,
    b: &mut i32,
    b_blocks: usize,
    b0: usize,
    lm: i32,
    stereo: bool,
    fill: &mut u32,
) -> SplitCtx {
    let pulse_cap = i32::from(LOG_N[ctx.band]) + (lm << 3);
    let offset =
        (pulse_cap >> 1) - if stereo && n == 2 { QTHETA_OFFSET_TWOPHASE } else { QTHETA_OFFSET };

    let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
    if stereo && ctx.band >= ctx.intensity {
        qn = 1;
    }

    let tell = ctx.rd.tell_frac() as i32;
    let mut itheta = 0i32;
    let mut inv = false;

    if qn != 1 {
        // Entropy coding of the angle: a step pdf for wide stereo splits, a uniform pdf for time
        // splits, and a triangular pdf for the rest.
        if stereo && n > 2 {
            let p0 = 3i32;
            let x0 = qn / 2;
            let ft = (p0 * (x0 + 1) + x0) as u32;

            let fs = ctx.rd.decode(ft) as i32;

            let x = if fs < (x0 + 1) * p0 { fs / p0 } else { x0 + 1 + (fs - (x0 + 1) * p0) };

            let (fl, fh) = if x <= x0 {
                (p0 * x, p0 * (x + 1))
            }
            else {
                ((x - 1 - x0) + (x0 + 1) * p0, (x - x0) + (x0 + 1) * p0)
            };

            ctx.rd.dec_update(fl as u32, fh as u32, ft);
            itheta = x;
        }
        else if b0 > 1 || stereo {
            itheta = ctx.rd.decode_uniform(qn as u32 + 1) as i32;
        }
        else {
            let qn_h = qn >> 1;
            let ft = ((qn_h + 1) * (qn_h + 1)) as u32;

            let fm = ctx.rd.decode(ft) as i32;

            let (fl, fs);
            if fm < (qn_h * (qn_h + 1)) >> 1 {
                itheta = ((isqrt32(8 * fm as u32 + 1) as i32) - 1) >> 1;
                fs = itheta + 1;
                fl = (itheta * (itheta + 1)) >> 1;
            }
            else {
                itheta = (2 * (qn + 1) - isqrt32(8 * (ft as i32 - fm - 1) as u32 + 1) as i32) >> 1;
                fs = qn + 1 - itheta;
                fl = ft as i32 - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1);
            }

            ctx.rd.dec_update(fl as u32, (fl + fs) as u32, ft);
        }

        debug_assert!(itheta >= 0);
        itheta = itheta * 16384 / qn;
    }
    else if stereo {
        // A single step: only the inversion flag may be coded.
        inv = if *b > 2 << 3 && ctx.remaining_bits > 2 << 3 {
            ctx.rd.decode_bit_logp(2)
        }
        else {
            false
        };

        if ctx.disable_inv {
            inv = false;
        }
    }

    let qalloc = ctx.rd.tell_frac() as i32 - tell;
    *b -= qalloc;

    let (imid, iside, delta);
    if itheta == 0 {
        imid = 32767;
        iside = 0;
        *fill &= (1u32 << b_blocks) - 1;
        delta = -16384;
    }
    else if itheta == 16384 {
        imid = 0;
        iside = 32767;
        *fill &= ((1u32 << b_blocks) - 1) << b_blocks;
        delta = 16384;
    }
    else {
        imid = i32::from(bitexact_cos(itheta as i16));
        iside = i32::from(bitexact_cos((16384 - itheta) as i16));
        // The mid/side allocation that minimizes squared error in the band.
        delta = frac_mul16(((n as i32) - 1) << 7, bitexact_log2tan(iside, imid));
    }

    return SplitCtx { inv, imid, iside, delta, itheta, qalloc };
}

/// Decode a single-coefficient band: one sign per channel.
fn quant_band_n1(
    ctx: &mut BandCtx<'_, '_>,
    x: &mut [f32],
    y: Option<&mut [f32]>,
    lowband_out: Option<&mut [f32]>,
) -> u32 {
    let mut decode_one = |ctx: &mut BandCtx<'_, '_>, x: &mut [f32]| {
        let mut sign = 0;
        if ctx.remaining_bits >= 1 << 3 {
            sign = ctx.rd.decode_raw_bits(1);
            ctx.remaining_bits -= 1 << 3;
        }
        x[0] = if sign != 0 { -1.0 } else { 1.0 };
    };

    decode_one(ctx, x);
    let x0 = x[0];

    if let Some(y) = y {
        decode_one(ctx, y);
    }

    if let Some(lowband_out) = lowband_out {
        lowband_out[0] = x0;
    }

    return 1;
}

/// Recursively decode one partition of a band, splitting while more bits remain than the largest
/// codebook can absorb.
fn quant_partition(
    ctx: &mut BandCtx<'_, '_>,
    x: &mut [f32],
    b: i32,
    b_blocks: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    gain: f32,
    fill: u32,
) -> u32 {
    let n = x.len();
    let cache = cache_row(ctx.band, (lm + 1) as usize);

    // Split whenever the budget exceeds what the largest codebook can use.
    if lm != -1 && b > i32::from(cache[cache[0] as usize]) + 12 && n > 2 {
        let half = n >> 1;
        let lm = lm - 1;

        let b0 = b_blocks;
        let mut fill = fill;
        let mut b_blocks = b_blocks;

        if b_blocks == 1 {
            fill = (fill & 1) | (fill << 1);
        }
        b_blocks = (b_blocks + 1) >> 1;

        let mut b = b;
        let sctx = compute_theta(ctx, half, &mut b, b_blocks, b0, lm, false, &mut fill);

        let mid = sctx.imid as f32 / 32768.0;
        let side = sctx.iside as f32 / 32768.0;
        let mut delta = sctx.delta;

        // Give more bits to low-energy MDCTs than they would otherwise deserve.
        if b0 > 1 && (sctx.itheta & 0x3fff) != 0 {
            if sctx.itheta > 8192 {
                // A rough approximation of pre-echo masking.
                delta -= delta >> (4 - lm);
            }
            else {
                // A forward-masking slope of about 1.5 dB per 10 ms.
                delta = 0.min(delta + (((half as i32) << 3) >> (5 - lm)));
            }
        }

        let mbits = 0.max(b.min((b - delta) / 2));
        let sbits = b - mbits;
        ctx.remaining_bits -= sctx.qalloc;

        let (xa, xb) = x.split_at_mut(half);
        let (lowband_a, lowband_b) = match lowband {
            Some(lowband) => (Some(&lowband[..half]), Some(&lowband[half..])),
            None => (None, None),
        };

        let mut cm;
        let rebalance = ctx.remaining_bits;

        if mbits >= sbits {
            cm = quant_partition(ctx, xa, mbits, b_blocks, lowband_a, lm, gain * mid, fill);

            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            let mut sbits = sbits;
            if rebalance > 3 << 3 && sctx.itheta != 0 {
                sbits += rebalance - (3 << 3);
            }

            cm |= quant_partition(ctx, xb, sbits, b_blocks, lowband_b, lm, gain * side, fill >> b_blocks)
                << (b0 >> 1);
        }
        else {
            cm = quant_partition(ctx, xb, sbits, b_blocks, lowband_b, lm, gain * side, fill >> b_blocks)
                << (b0 >> 1);

            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            let mut mbits = mbits;
            if rebalance > 3 << 3 && sctx.itheta != 16384 {
                mbits += rebalance - (3 << 3);
            }

            cm |= quant_partition(ctx, xa, mbits, b_blocks, lowband_a, lm, gain * mid, fill);
        }

        return cm;
    }

    // Leaf partition: decode the pulses, or fold.
    let mut q = bits2pulses(&cache, b);
    let mut curr_bits = pulses2bits(&cache, q);
    ctx.remaining_bits -= curr_bits;

    // Never bust the budget.
    while ctx.remaining_bits < 0 && q > 0 {
        ctx.remaining_bits += curr_bits;
        q -= 1;
        curr_bits = pulses2bits(&cache, q);
        ctx.remaining_bits -= curr_bits;
    }

    if q != 0 {
        let k = get_pulses(q);
        let BandCtx { rd, iy, row, spread, .. } = ctx;
        return alg_unquant(x, k, *spread, b_blocks, rd, gain, iy, row);
    }

    // No pulses: fill the band anyway.
    let cm_mask = (1u32 << b_blocks) - 1;
    let fill = fill & cm_mask;

    if fill == 0 {
        x.fill(0.0);
        return 0;
    }

    let cm = match lowband {
        None => {
            // Noise-based fill.
            for v in x.iter_mut() {
                ctx.seed = lcg_rand(ctx.seed);
                *v = ((ctx.seed as i32) >> 20) as f32;
            }
            cm_mask
        }
        Some(lowband) => {
            // Folded spectrum, with dither about 48 dB below the folding level.
            for (v, &l) in x.iter_mut().zip(lowband.iter()) {
                ctx.seed = lcg_rand(ctx.seed);
                let dither = if ctx.seed & 0x8000 != 0 { 1.0 / 256.0 } else { -1.0 / 256.0 };
                *v = l + dither;
            }
            fill
        }
    };

    renormalise_vector(x, gain);

    return cm;
}

/// Decode one band of one channel, taking care of time-frequency resolution changes and the
/// Hadamard reordering of transient blocks around the partition recursion.
#[allow(clippy::too_many_arguments)]
fn quant_band<'a>(
    ctx: &mut BandCtx<'_, '_>,
    x: &mut [f32],
    b: i32,
    b_blocks: usize,
    mut lowband: Option<&'a mut [f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    gain: f32,
    lowband_scratch: Option<&'a mut [f32]>,
    mut fill: u32,
) -> u32 {
    let n0 = x.len();
    let mut n_b = n0 / b_blocks;
    let long_blocks = b_blocks == 1;

    if n0 == 1 {
        return quant_band_n1(ctx, x, None, lowband_out);
    }

    let recombine = ctx.tf_change.max(0) as usize;

    // If the fold source will be transformed, work on a copy.
    if let Some(scratch) = lowband_scratch {
        if lowband.is_some()
            && (recombine != 0 || ((n_b & 1) == 0 && ctx.tf_change < 0) || b_blocks > 1)
        {
            let src = lowband.take().unwrap();
            scratch[..n0].copy_from_slice(src);
            lowband = Some(&mut scratch[..n0]);
        }
    }

    // Band recombining to increase frequency resolution.
    for k in 0..recombine {
        if let Some(lowband) = lowband.as_deref_mut() {
            haar1(lowband, n0 >> k, 1 << k);
        }
        fill = u32::from(BIT_INTERLEAVE_TABLE[(fill & 0xF) as usize])
            | u32::from(BIT_INTERLEAVE_TABLE[(fill >> 4) as usize]) << 2;
    }

    let mut b_cur = b_blocks >> recombine;
    n_b <<= recombine;

    // Increasing the time resolution.
    let mut time_divide = 0usize;
    let mut tf_change = ctx.tf_change;
    while (n_b & 1) == 0 && tf_change < 0 {
        if let Some(lowband) = lowband.as_deref_mut() {
            haar1(lowband, n_b, b_cur);
        }
        fill |= fill << b_cur;
        b_cur <<= 1;
        n_b >>= 1;
        time_divide += 1;
        tf_change += 1;
    }

    let b0 = b_cur;
    let n_b0 = n_b;

    // Reorganize the samples in time order instead of frequency order.
    if b0 > 1 {
        if let Some(lowband) = lowband.as_deref_mut() {
            let BandCtx { reorder, .. } = ctx;
            deinterleave_hadamard(lowband, reorder, n_b >> recombine, b0 << recombine, long_blocks);
        }
    }

    let mut cm = quant_partition(ctx, x, b, b_cur, lowband.as_deref(), lm, gain, fill);

    // Undo the sample reorganization.
    if b0 > 1 {
        let BandCtx { reorder, .. } = ctx;
        interleave_hadamard(x, reorder, n_b >> recombine, b0 << recombine, long_blocks);
    }

    // Undo the time-freq changes.
    let mut n_b = n_b0;
    let mut b_cur = b0;
    for _ in 0..time_divide {
        b_cur >>= 1;
        n_b <<= 1;
        cm |= cm >> b_cur;
        haar1(x, n_b, b_cur);
    }

    for k in 0..recombine {
        cm = u32::from(BIT_DEINTERLEAVE_TABLE[cm as usize]);
        haar1(x, n0 >> k, 1 << k);
    }
    let b_cur = b_cur << recombine;

    // Scale the output for later folding.
    if let Some(lowband_out) = lowband_out {
        let n = (n0 as f32).sqrt();
        for (o, &v) in lowband_out.iter_mut().zip(x.iter()) {
            *o = n * v;
        }
    }

    return cm & ((1u32 << b_cur) - 1);
}

/// Decode one band jointly for both channels of a coupled stereo pair.
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    ctx: &mut BandCtx<'_, '_>,
    x: &mut [f32],
    y: &mut [f32],
    b: i32,
    b_blocks: usize,
    lowband: Option<&mut [f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    lowband_scratch: Option<&mut [f32]>,
    fill: u32,
) -> u32 {
    let n = x.len();

    if n == 1 {
        return quant_band_n1(ctx, x, Some(y), lowband_out);
    }

    let orig_fill = fill;
    let mut b = b;
    let mut fill = fill;

    let sctx = compute_theta(ctx, n, &mut b, b_blocks, b_blocks, lm, true, &mut fill);
    let SplitCtx { inv, imid, iside, delta, itheta, qalloc } = sctx;

    let mid = imid as f32 / 32768.0;
    let side = iside as f32 / 32768.0;

    let cm;

    if n == 2 {
        // Two-sample stereo: mid and side are orthogonal, so one bit codes the side.
        let mut sbits = 0;
        if itheta != 0 && itheta != 16384 {
            sbits = 1 << 3;
        }
        let mbits = b - sbits;

        ctx.remaining_bits -= qalloc + sbits;

        let sign = if sbits != 0 { ctx.rd.decode_raw_bits(1) as i32 } else { 0 };
        let sign = 1 - 2 * sign;

        // The channel holding more energy carries the shape.
        let swapped = itheta > 8192;
        let (x2, y2): (&mut [f32], &mut [f32]) = if swapped { (y, x) } else { (x, y) };

        // orig_fill is used so the side folds even when itheta has cleared fill's low bits.
        cm = quant_band(
            ctx,
            x2,
            mbits,
            b_blocks,
            lowband,
            lm,
            lowband_out,
            1.0,
            lowband_scratch,
            orig_fill,
        );

        y2[0] = -(sign as f32) * x2[1];
        y2[1] = (sign as f32) * x2[0];

        // Undo the swap; the mid gain always applies to the first channel.
        let (x, y) = if swapped { (y2, x2) } else { (x2, y2) };

        x[0] *= mid;
        x[1] *= mid;
        y[0] *= side;
        y[1] *= side;

        let tmp = x[0];
        x[0] = tmp - y[0];
        y[0] = tmp + y[0];
        let tmp = x[1];
        x[1] = tmp - y[1];
        y[1] = tmp + y[1];

        if inv {
            for v in y.iter_mut() {
                *v = -*v;
            }
        }

        return cm;
    }

    // Normal split. The mid is not scaled here; folding needs it normalized.
    let mbits = 0.max(b.min((b - delta) / 2));
    let sbits = b - mbits;
    ctx.remaining_bits -= qalloc;

    let rebalance = ctx.remaining_bits;

    if mbits >= sbits {
        let mut cm_acc = quant_band(
            ctx,
            x,
            mbits,
            b_blocks,
            lowband,
            lm,
            lowband_out,
            1.0,
            lowband_scratch,
            fill,
        );

        let rebalance = mbits - (rebalance - ctx.remaining_bits);
        let mut sbits = sbits;
        if rebalance > 3 << 3 && itheta != 0 {
            sbits += rebalance - (3 << 3);
        }

        // In a stereo split the high bits of fill are zero: the side never folds.
        cm_acc |=
            quant_band(ctx, y, sbits, b_blocks, None, lm, None, side, None, fill >> b_blocks);
        cm = cm_acc;
    }
    else {
        let mut cm_acc =
            quant_band(ctx, y, sbits, b_blocks, None, lm, None, side, None, fill >> b_blocks);

        let rebalance = sbits - (rebalance - ctx.remaining_bits);
        let mut mbits = mbits;
        if rebalance > 3 << 3 && itheta != 16384 {
            mbits += rebalance - (3 << 3);
        }

        cm_acc |= quant_band(
            ctx,
            x,
            mbits,
            b_blocks,
            lowband,
            lm,
            lowband_out,
            1.0,
            lowband_scratch,
            fill,
        );
        cm = cm_acc;
    }

    stereo_merge(x, y, mid);

    if inv {
        for v in y.iter_mut() {
            *v = -*v;
        }
    }

    return cm;
}

/// Rebuild left/right from a normalized mid and a scaled side.
fn stereo_merge(x: &mut [f32], y: &mut [f32], mid: f32) {
    let mut xp = 0.0f32;
    let mut side_e = 0.0f32;

    for (&xv, &yv) in x.iter().zip(y.iter()) {
        xp += xv * yv;
        side_e += yv * yv;
    }

    // Compensate for the mid normalization.
    xp *= mid;

    let el = mid * mid + side_e - 2.0 * xp;
    let er = mid * mid + side_e + 2.0 * xp;

    if er < 6e-4 || el < 6e-4 {
        y.copy_from_slice(x);
        return;
    }

    let lgain = 1.0 / el.sqrt();
    let rgain = 1.0 / er.sqrt();

    for (xv, yv) in x.iter_mut().zip(y.iter_mut()) {
        let l = mid * *xv;
        let r = *yv;
        *xv = lgain * (l - r);
        *yv = rgain * (l + r);
    }
}

/// Decode the shapes of every band for all channels.
#[allow(clippy::too_many_arguments)]
pub fn quant_all_bands(
    start: usize,
    end: usize,
    x_coeffs: &mut [f32],
    y_coeffs: Option<&mut [f32]>,
    collapse_masks: &mut [u8],
    pulses: &[i32],
    short_blocks: bool,
    spread: Spread,
    dual_stereo: bool,
    intensity: usize,
    tf_res: &[i8],
    total_bits: i32,
    balance: i32,
    rd: &mut RangeDecoder<'_>,
    lm: usize,
    coded_bands: usize,
    seed: &mut u32,
    disable_inv: bool,
    norm_arena: &mut Vec<f32>,
    scratch_arena: &mut Vec<f32>,
) {
    let m = 1usize << lm;
    let b_blocks = if short_blocks { m } else { 1 };
    let channels = if y_coeffs.is_some() { 2usize } else { 1 };
    let norm_offset = m * EBANDS[start] as usize;

    // No fold output is needed for the last band.
    let norm_len = m * EBANDS[MAX_BANDS - 1] as usize - norm_offset;
    norm_arena.clear();
    norm_arena.resize(channels * norm_len, 0.0);
    let (norm_x, norm_y) = norm_arena.split_at_mut(norm_len);

    scratch_arena.clear();
    scratch_arena.resize(m * band_width(MAX_BANDS - 1) as usize, 0.0);

    let mut y_coeffs = y_coeffs;
    let mut dual_stereo = dual_stereo;
    let mut balance = balance;
    let mut lowband_offset = 0usize;
    let mut update_lowband = true;

    let mut ctx = BandCtx {
        rd,
        band: start,
        intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        seed: *seed,
        disable_inv,
        iy: Vec::new(),
        row: Vec::new(),
        reorder: Vec::new(),
    };

    for band in start..end {
        let last = band == end - 1;
        let band_start = m * EBANDS[band] as usize;
        let band_end = m * EBANDS[band + 1] as usize;
        let n = band_end - band_start;

        ctx.band = band;
        ctx.tf_change = tf_res[band];

        let tell = ctx.rd.tell_frac() as i32;

        if band != start {
            balance -= tell;
        }

        let remaining_bits = total_bits - tell - 1;
        ctx.remaining_bits = remaining_bits;

        let b = if band < coded_bands {
            let curr_balance = balance / (3.min(coded_bands - band) as i32);
            0.max(16383.min((remaining_bits + 1).min(pulses[band] + curr_balance)))
        }
        else {
            0
        };

        // Remember where the most recent fold source starts.
        if (band_start as i32 - n as i32 >= m as i32 * i32::from(EBANDS[start]) || band == start + 1)
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = band;
        }

        // A conservative estimate of the collapse masks of the bands we fold from.
        let mut effective_lowband: Option<usize> = None;
        let mut x_cm: u32;
        let mut y_cm: u32;

        if lowband_offset != 0
            && (spread != Spread::Aggressive || b_blocks > 1 || ctx.tf_change < 0)
        {
            let eff = 0.max(
                (m * EBANDS[lowband_offset] as usize) as i32 - norm_offset as i32 - n as i32,
            ) as usize;
            effective_lowband = Some(eff);

            // Never repeat spectral content within one band.
            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if m * EBANDS[fold_start] as usize <= eff + norm_offset {
                    break;
                }
            }

            let mut fold_end = lowband_offset - 1;
            loop {
                fold_end += 1;
                if !(fold_end < band && (m * EBANDS[fold_end] as usize) < eff + norm_offset + n) {
                    break;
                }
            }

            x_cm = 0;
            y_cm = 0;
            for fold_i in fold_start..fold_end.max(fold_start + 1) {
                x_cm |= u32::from(collapse_masks[fold_i * channels]);
                y_cm |= u32::from(collapse_masks[fold_i * channels + channels - 1]);
            }
        }
        else {
            // The LCG will fill, so all blocks are (almost surely) non-zero.
            x_cm = (1u32 << b_blocks) - 1;
            y_cm = x_cm;
        }

        if dual_stereo && band == intensity {
            // Switch off dual stereo to do intensity.
            dual_stereo = false;
            for j in 0..band_start - norm_offset {
                norm_x[j] = 0.5 * (norm_x[j] + norm_y[j]);
            }
        }

        let x = &mut x_coeffs[band_start..band_end];
        let out_start = band_start - norm_offset;

        if dual_stereo {
            let y = y_coeffs.as_deref_mut().unwrap();
            let y = &mut y[band_start..band_end];

            {
                let (head, tail) = norm_x.split_at_mut(out_start);
                let lowband = effective_lowband.map(|eff| &mut head[eff..eff + n]);
                let lowband_out = if last { None } else { Some(&mut tail[..n]) };
                let scratch = if last { None } else { Some(&mut scratch_arena[..n]) };

                x_cm = quant_band(
                    &mut ctx,
                    x,
                    b / 2,
                    b_blocks,
                    lowband,
                    lm as i32,
                    lowband_out,
                    1.0,
                    scratch,
                    x_cm,
                );
            }

            {
                let (head, tail) = norm_y.split_at_mut(out_start);
                let lowband = effective_lowband.map(|eff| &mut head[eff..eff + n]);
                let lowband_out = if last { None } else { Some(&mut tail[..n]) };
                let scratch = if last { None } else { Some(&mut scratch_arena[..n]) };

                y_cm = quant_band(
                    &mut ctx,
                    y,
                    b / 2,
                    b_blocks,
                    lowband,
                    lm as i32,
                    lowband_out,
                    1.0,
                    scratch,
                    y_cm,
                );
            }
        }
        else {
            let (head, tail) = norm_x.split_at_mut(out_start);
            let lowband = effective_lowband.map(|eff| &mut head[eff..eff + n]);
            let lowband_out = if last { None } else { Some(&mut tail[..n]) };
            let scratch = if last { None } else { Some(&mut scratch_arena[..n]) };

            if let Some(y) = y_coeffs.as_deref_mut() {
                let y = &mut y[band_start..band_end];

                x_cm = quant_band_stereo(
                    &mut ctx,
                    x,
                    y,
                    b,
                    b_blocks,
                    lowband,
                    lm as i32,
                    lowband_out,
                    scratch,
                    x_cm | y_cm,
                );
            }
            else {
                x_cm = quant_band(
                    &mut ctx,
                    x,
                    b,
                    b_blocks,
                    lowband,
                    lm as i32,
                    lowband_out,
                    1.0,
                    scratch,
                    x_cm | y_cm,
                );
            }
            y_cm = x_cm;
        }

        collapse_masks[band * channels] = x_cm as u8;
        collapse_masks[band * channels + channels - 1] = y_cm as u8;

        balance += pulses[band] + tell;

        // Keep the folding position only while there is at least a bit per sample of depth.
        update_lowband = b > (n as i32) << 3;
    }

    *seed = ctx.seed;
}

/// Inject shaped noise into transient bands whose short blocks collapsed, and renormalise.
#[allow(clippy::too_many_arguments)]
pub fn anti_collapse(
    coeffs: &mut [Vec<f32>],
    collapse_masks: &[u8],
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    log_e: &[f32],
    prev1_log_e: &[f32],
    prev2_log_e: &[f32],
    pulses: &[i32],
    mut seed: u32,
) {
    for band in start..end {
        let n0 = band_width(band) as usize;

        // Depth in bits per sample the band was coded at.
        let depth = ((1 + pulses[band]) / (n0 as i32)) >> lm;

        let thresh = 0.5 * (-0.125 * depth as f32).exp2();
        let sqrt_1 = 1.0 / ((n0 << lm) as f32).sqrt();

        for c in 0..channels {
            let mut prev1 = prev1_log_e[c * MAX_BANDS + band];
            let mut prev2 = prev2_log_e[c * MAX_BANDS + band];

            if channels == 1 {
                // A stereo stream may have preceded this mono one.
                prev1 = prev1.max(prev1_log_e[MAX_BANDS + band]);
                prev2 = prev2.max(prev2_log_e[MAX_BANDS + band]);
            }

            let ediff = (log_e[c * MAX_BANDS + band] - prev1.min(prev2)).max(0.0);

            let mut r = 2.0 * (-ediff).exp2();
            if lm == 3 {
                r *= 1.41421356;
            }
            r = r.min(thresh) * sqrt_1;

            let band_start = (EBANDS[band] as usize) << lm;
            let x = &mut coeffs[c][band_start..band_start + (n0 << lm)];

            let mut renormalize = false;
            for k in 0..(1usize << lm) {
                // Detect collapse.
                if collapse_masks[band * channels + c] & (1 << k) == 0 {
                    // Fill with noise.
                    for j in 0..n0 {
                        seed = lcg_rand(seed);
                        x[(j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    }
                    renormalize = true;
                }
            }

            if renormalize {
                renormalise_vector(x, 1.0);
            }
        }
    }
}

/// Scale unit-norm band shapes back to MDCT coefficients by the decoded energies.
pub fn denormalise_bands(
    x: &[f32],
    freq: &mut [f32],
    energies: &[f32],
    start: usize,
    end: usize,
    m: usize,
    silence: bool,
) {
    let n = freq.len();

    let (bound, start, end) = if silence { (0, 0, 0) } else { (m * EBANDS[end] as usize, start, end) };

    for f in freq[..m * EBANDS[start] as usize].iter_mut() {
        *f = 0.0;
    }

    for band in start..end {
        let band_start = m * EBANDS[band] as usize;
        let band_end = m * EBANDS[band + 1] as usize;

        let lg = energies[band] + EMEANS[band];
        if lg > 32.0 {
            // A malformed payload can code absurd energies; clamp rather than overflow.
            warn!("clamping band {} energy", band);
        }
        let g = lg.min(32.0).exp2();

        for (f, &v) in freq[band_start..band_end].iter_mut().zip(&x[band_start..band_end]) {
            *f = v * g;
        }
    }

    for f in freq[bound..n].iter_mut() {
        *f = 0.0;
    }
}
