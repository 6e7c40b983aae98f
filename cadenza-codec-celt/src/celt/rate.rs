//! Bit allocation.
///
/// The allocation engine turns the bit budget left after the frame header into per-band PVQ and
/// fine energy bits. A fixed table of quality steps gives each band a base allocation; a binary
/// search finds the highest affordable step, a six-step interpolation refines between two
/// adjacent steps, and a top-down walk decides which high bands are skipped entirely. Stereo
/// frames additionally reserve bits for the intensity threshold and the dual-stereo flag, which
/// are coded as part of the search.
///
/// All quantities are in Q3 (1/8) bits unless noted.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3.3
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use once_cell::sync::Lazy;
use std::sync::RwLock;

use crate::celt::cwrs::{fits_in32, get_pulses, get_required_bits, LOG_MAX_PSEUDO, MAX_PSEUDO};
use crate::celt::mode::MAX_BANDS;
use crate::celt::tables::{ALLOC_VECTORS, CACHE_CAPS, EBANDS, LOG2_FRAC_TABLE, LOG_N};
use crate::range::RangeDecoder;

/// Fine energy bits are capped here; beyond this the PVQ shape carries the information better.
pub const MAX_FINE_BITS: i32 = 8;

/// Bias between fine energy and shape bits.
const FINE_OFFSET: i32 = 21;

/// Resolution of the interpolation between allocation quality steps.
const ALLOC_STEPS: i32 = 6;

/// Width of band `band` in 2.5 ms bins.
#[inline]
pub fn band_width(band: usize) -> i32 {
    return i32::from(EBANDS[band + 1] - EBANDS[band]);
}

/// Process-wide pulse count cache, keyed by vector dimension. Each row holds, per pseudo-pulse
/// count `k`, one less than the Q3 size of the codebook with `get_pulses(k)` pulses; entry zero
/// holds the largest valid pseudo-pulse count.
static PULSE_CACHE: Lazy<RwLock<HashMap<usize, Arc<Vec<u8>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn build_cache_row(n: usize) -> Vec<u8> {
    debug!("building pulse cache row for n={}", n);

    let mut max_k = 0usize;
    while max_k < MAX_PSEUDO && fits_in32(n, get_pulses(max_k + 1)) {
        max_k += 1;
    }

    let mut bits = vec![0i32; get_pulses(max_k) + 1];
    get_required_bits(&mut bits, n, get_pulses(max_k), 3);

    let mut row = vec![0u8; max_k + 1];
    row[0] = max_k as u8;
    for k in 1..=max_k {
        row[k] = (bits[get_pulses(k)] - 1) as u8;
    }

    return row;
}

/// The pulse cache row for a partition of band `band` at level `lm_plus_1 = LM + 1`. The
/// partition dimension is `width << (LM + 1) >> 1`, which accounts for the final half-band split
/// at `LM == -1`.
pub fn cache_row(band: usize, lm_plus_1: usize) -> Arc<Vec<u8>> {
    let n = ((band_width(band) as usize) << lm_plus_1) >> 1;
    debug_assert!(n > 0);

    if let Some(row) = PULSE_CACHE.read().unwrap().get(&n) {
        return Arc::clone(row);
    }

    let mut map = PULSE_CACHE.write().unwrap();
    return Arc::clone(map.entry(n).or_insert_with(|| Arc::new(build_cache_row(n))));
}

/// The largest pseudo-pulse count whose codebook costs at most `bits` Q3 bits, rounding to the
/// nearest codebook size.
pub fn bits2pulses(row: &[u8], bits: i32) -> usize {
    let mut lo = 0usize;
    let mut hi = row[0] as usize;
    let bits = bits - 1;

    for _ in 0..LOG_MAX_PSEUDO {
        let mid = (lo + hi + 1) >> 1;
        if i32::from(row[mid]) >= bits {
            hi = mid;
        }
        else {
            lo = mid;
        }
    }

    let lo_cost = if lo == 0 { -1 } else { i32::from(row[lo]) };
    if bits - lo_cost <= i32::from(row[hi]) - bits {
        return lo;
    }
    else {
        return hi;
    }
}

/// The Q3 cost of `pulses` pseudo-pulses.
pub fn pulses2bits(row: &[u8], pulses: usize) -> i32 {
    if pulses == 0 {
        return 0;
    }
    return i32::from(row[pulses]) + 1;
}

/// Per-band caps on usefully spendable Q3 bits. Also the ceiling for dynalloc boosts.
pub fn init_caps(caps: &mut [i32], lm: usize, channels: usize, end: usize) {
    let c = channels as i32;
    for (band, cap) in caps[..end].iter_mut().enumerate() {
        let n = band_width(band) << lm;
        *cap = (i32::from(CACHE_CAPS[lm][channels - 1][band]) + 64) * c * n >> 2;
    }
}

/// Results of the allocation search, alongside the `pulses`/`ebits`/`fine_priority` outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Bands actually coded; bands above this are skipped or folded.
    pub coded_bands: usize,
    /// Q3 bits left over for the band loop to redistribute.
    pub balance: i32,
    /// First band coded as intensity stereo.
    pub intensity: usize,
    /// Whether mid/side coding is replaced by independent channels.
    pub dual_stereo: bool,
}

/// Distribute `total` Q3 bits over the bands.
///
/// Fills `pulses` (Q3 shape bits per band), `ebits` (whole fine energy bits per band and
/// channel), and `fine_priority`. The skip, intensity, and dual-stereo decisions are decoded from
/// the range decoder as part of the search.
#[allow(clippy::too_many_arguments)]
pub fn compute_allocation(
    start: usize,
    end: usize,
    offsets: &[i32],
    cap: &[i32],
    alloc_trim: i32,
    total: i32,
    pulses: &mut [i32],
    ebits: &mut [i32],
    fine_priority: &mut [bool],
    channels: usize,
    lm: usize,
    rd: &mut RangeDecoder<'_>,
) -> Allocation {
    let c = channels as i32;
    let alloc_floor = c << 3;
    let num_rows = ALLOC_VECTORS.len();

    let mut total = total.max(0);
    let mut skip_start = start;

    // Reserve a bit to signal the end of manually skipped bands.
    let skip_rsv = if total >= 1 << 3 { 1 << 3 } else { 0 };
    total -= skip_rsv;

    // Reserve bits for the intensity and dual stereo parameters.
    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if channels == 2 {
        intensity_rsv = i32::from(LOG2_FRAC_TABLE[end - start]);
        if intensity_rsv > total {
            intensity_rsv = 0;
        }
        else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << 3 { 1 << 3 } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let mut thresh = [0i32; MAX_BANDS];
    let mut trim_offset = [0i32; MAX_BANDS];

    for j in start..end {
        let w = band_width(j);

        // Below this threshold a band cannot usefully take PVQ bits.
        thresh[j] = alloc_floor.max((3 * w << lm << 3) >> 4);

        // Tilt of the allocation curve.
        trim_offset[j] =
            c * w * (alloc_trim - 5 - lm as i32) * ((end - j - 1) as i32) * (1 << (lm + 3)) >> 6;

        // Single-bin bands get more from one coarse value per coefficient.
        if (w << lm) == 1 {
            trim_offset[j] -= alloc_floor;
        }
    }

    // Binary search for the highest quality step that fits the budget.
    let mut lo = 1usize;
    let mut hi = num_rows - 1;

    loop {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;

        for j in (start..end).rev() {
            let mut bitsj = c * band_width(j) * i32::from(ALLOC_VECTORS[mid][j]) << lm >> 2;
            if bitsj > 0 {
                bitsj = 0.max(bitsj + trim_offset[j]);
            }
            bitsj += offsets[j];

            if bitsj >= thresh[j] || done {
                done = true;
                psum += bitsj.min(cap[j]);
            }
            else if bitsj >= alloc_floor {
                psum += alloc_floor;
            }
        }

        if psum > total {
            hi = mid - 1;
        }
        else {
            lo = mid + 1;
        }

        if lo > hi {
            break;
        }
    }

    let hi = lo;
    let lo = lo - 1;

    let mut bits1 = [0i32; MAX_BANDS];
    let mut bits2 = [0i32; MAX_BANDS];

    for j in start..end {
        let w = band_width(j);

        let mut b1 = c * w * i32::from(ALLOC_VECTORS[lo][j]) << lm >> 2;
        let mut b2 = if hi >= num_rows {
            cap[j]
        }
        else {
            c * w * i32::from(ALLOC_VECTORS[hi][j]) << lm >> 2
        };

        if b1 > 0 {
            b1 = 0.max(b1 + trim_offset[j]);
        }
        if b2 > 0 {
            b2 = 0.max(b2 + trim_offset[j]);
        }
        if lo > 0 {
            b1 += offsets[j];
        }
        b2 += offsets[j];

        if offsets[j] > 0 {
            skip_start = j;
        }

        bits1[j] = b1;
        bits2[j] = 0.max(b2 - b1);
    }

    // Interpolate between the two steps.
    let mut ilo = 0i32;
    let mut ihi = 1 << ALLOC_STEPS;

    for _ in 0..ALLOC_STEPS {
        let mid = (ilo + ihi) >> 1;
        let mut psum = 0;
        let mut done = false;

        for j in (start..end).rev() {
            let tmp = bits1[j] + (mid * bits2[j] >> ALLOC_STEPS);

            if tmp >= thresh[j] || done {
                done = true;
                psum += tmp.min(cap[j]);
            }
            else if tmp >= alloc_floor {
                psum += alloc_floor;
            }
        }

        if psum > total {
            ihi = mid;
        }
        else {
            ilo = mid;
        }
    }

    let mut psum = 0;
    let mut done = false;

    for j in (start..end).rev() {
        let mut tmp = bits1[j] + (ilo * bits2[j] >> ALLOC_STEPS);

        if tmp < thresh[j] && !done {
            tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
        }
        else {
            done = true;
        }

        let tmp = tmp.min(cap[j]);
        pulses[j] = tmp;
        psum += tmp;
    }

    // Decide which bands to skip, working backwards from the end. The first band and dynalloc
    // boosted bands are never skipped.
    let mut coded_bands = end;

    loop {
        let j = coded_bands - 1;

        if j <= skip_start {
            // Give the bit reserved to end skipping to the current band.
            total += skip_rsv;
            break;
        }

        // Left-over bits this band would inherit, including bits stolen back from higher,
        // skipped bands.
        let left = (total - psum).max(0);
        let denom = i32::from(EBANDS[coded_bands] - EBANDS[start]);
        let percoeff = left / denom;
        let left = left - denom * percoeff;
        let rem = 0.max(left - i32::from(EBANDS[j] - EBANDS[start]));
        let width = i32::from(EBANDS[coded_bands] - EBANDS[j]);
        let mut band_bits = pulses[j] + percoeff * width + rem;

        // Only code a skip decision above the threshold; otherwise the band is force-skipped.
        if band_bits >= thresh[j].max(alloc_floor + (1 << 3)) {
            if rd.decode_bit_logp(1) {
                break;
            }
            psum += 1 << 3;
            band_bits -= 1 << 3;
        }

        // Reclaim the bits originally allocated to this band.
        psum -= pulses[j] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = i32::from(LOG2_FRAC_TABLE[j - start]);
        }
        psum += intensity_rsv;

        if band_bits >= alloc_floor {
            // Keep a fine energy bit per channel.
            psum += alloc_floor;
            pulses[j] = alloc_floor;
        }
        else {
            pulses[j] = 0;
        }

        coded_bands -= 1;
    }

    debug_assert!(coded_bands > start);

    // Code the intensity and dual stereo parameters.
    let intensity = if intensity_rsv > 0 {
        start + rd.decode_uniform((coded_bands + 1 - start) as u32) as usize
    }
    else {
        0
    };

    if intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }

    let dual_stereo = if dual_stereo_rsv > 0 { rd.decode_bit_logp(1) } else { false };

    // Allocate the remaining bits proportionally to band width.
    let left = (total - psum).max(0);
    let denom = i32::from(EBANDS[coded_bands] - EBANDS[start]);
    let percoeff = left / denom;
    let mut left = left - denom * percoeff;

    for j in start..coded_bands {
        pulses[j] += percoeff * band_width(j);
    }
    for j in start..coded_bands {
        let tmp = left.min(band_width(j));
        pulses[j] += tmp;
        left -= tmp;
    }

    // Split each band's allocation into fine energy bits and PVQ bits, carrying any excess over
    // a band's cap into the next band.
    let mut balance = 0;
    let log_m = (lm as i32) << 3;
    let stereo = if channels == 2 { 1 } else { 0 };

    for j in start..coded_bands {
        let n = band_width(j) << lm;
        let bit = pulses[j] + balance;
        let excess;

        debug_assert!(pulses[j] >= 0);

        if n > 1 {
            excess = 0.max(bit - cap[j]);
            pulses[j] = bit - excess;

            // Compensate for the extra degree of freedom in coupled stereo.
            let den =
                c * n + if channels == 2 && n > 2 && !dual_stereo && j < intensity { 1 } else { 0 };

            let nc_log_n = den * (i32::from(LOG_N[j]) + log_m);

            // Offset the fine bits by log2(N)/2 relative to their fair share.
            let mut offset = (nc_log_n >> 1) - den * FINE_OFFSET;

            // N of two is the only point that does not match the curve.
            if n == 2 {
                offset += den << 3 >> 2;
            }

            // Shift the break-points for the second and third fine bit.
            if pulses[j] + offset < (den * 2) << 3 {
                offset += nc_log_n >> 2;
            }
            else if pulses[j] + offset < (den * 3) << 3 {
                offset += nc_log_n >> 3;
            }

            // Divide with rounding.
            let mut fine = 0.max(pulses[j] + offset + (den << 2));
            fine = (fine / den) >> 3;

            // Not more than the band can pay for.
            if c * fine > pulses[j] >> 3 {
                fine = pulses[j] >> stereo >> 3;
            }

            fine = fine.min(MAX_FINE_BITS);

            // A band that rounded down or was capped is first in line for leftover bits.
            fine_priority[j] = fine * (den << 3) >= pulses[j] + offset;

            pulses[j] -= c * fine << 3;
            ebits[j] = fine;
        }
        else {
            // For a single coefficient all bits beyond one sign bit per channel go to fine
            // energy.
            excess = 0.max(bit - alloc_floor);
            pulses[j] = bit - excess;

            let fine = (pulses[j] >> stereo >> 3).min(MAX_FINE_BITS);
            fine_priority[j] = true;

            pulses[j] -= c * fine << 3;
            ebits[j] = fine;
        }

        balance = excess;
    }

    // Skipped bands spend all their remaining bits on fine energy.
    for j in coded_bands..end {
        let fine = pulses[j] >> stereo >> 3;
        debug_assert!(c * fine << 3 == pulses[j]);
        ebits[j] = fine;
        pulses[j] = 0;
        fine_priority[j] = fine < 1;
    }

    return Allocation { coded_bands, balance, intensity, dual_stereo };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celt::mode::MAX_BANDS;

    fn run_allocation(
        total_bits: i32,
        channels: usize,
        lm: usize,
        payload: &[u8],
    ) -> ([i32; MAX_BANDS], [i32; MAX_BANDS], [bool; MAX_BANDS], Allocation) {
        let end = MAX_BANDS;

        let mut caps = [0i32; MAX_BANDS];
        init_caps(&mut caps, lm, channels, end);

        let offsets = [0i32; MAX_BANDS];
        let mut pulses = [0i32; MAX_BANDS];
        let mut ebits = [0i32; MAX_BANDS];
        let mut fine_priority = [false; MAX_BANDS];

        let mut rd = RangeDecoder::new(payload);

        let alloc = compute_allocation(
            0,
            end,
            &offsets,
            &caps,
            5,
            total_bits << 3,
            &mut pulses,
            &mut ebits,
            &mut fine_priority,
            channels,
            lm,
            &mut rd,
        );

        (pulses, ebits, fine_priority, alloc)
    }

    #[test]
    fn budget_is_never_exceeded() {
        // The sum of shape and fine bits must stay inside the Q3 budget for any budget.
        for &total_bits in &[100i32, 500, 1000, 2000] {
            for &channels in &[1usize, 2] {
                let (pulses, ebits, _, alloc) =
                    run_allocation(total_bits, channels, 3, &[0x5A; 300]);

                let c = channels as i32;
                let spent: i32 =
                    pulses.iter().sum::<i32>() + ebits.iter().map(|&e| e * c * 8).sum::<i32>();

                assert!(
                    spent <= total_bits * 8,
                    "bits={} C={}: spent {} of {}",
                    total_bits,
                    channels,
                    spent,
                    total_bits * 8
                );
                assert!(alloc.coded_bands <= MAX_BANDS);
                assert!(alloc.coded_bands > 0);
            }
        }
    }

    #[test]
    fn bands_respect_their_caps() {
        let lm = 3;
        let mut caps = [0i32; MAX_BANDS];
        init_caps(&mut caps, lm, 1, MAX_BANDS);

        let (pulses, ebits, _, _) = run_allocation(2000, 1, lm, &[0xC3; 300]);

        for j in 0..MAX_BANDS {
            assert!(pulses[j] >= 0);
            assert!(pulses[j] + (ebits[j] * 8) <= caps[j] + 8, "band {}", j);
            assert!(ebits[j] <= MAX_FINE_BITS);
        }
    }

    #[test]
    fn allocation_is_idempotent() {
        // Two runs over identical inputs, including an identical bitstream position, must agree
        // exactly.
        let a = run_allocation(730, 2, 2, &[0x9D; 200]);
        let b = run_allocation(730, 2, 2, &[0x9D; 200]);

        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
        assert_eq!(a.2, b.2);
        assert_eq!(a.3, b.3);
    }

    #[test]
    fn zero_budget_allocates_nothing() {
        let (pulses, ebits, _, _) = run_allocation(0, 1, 0, &[0x00; 4]);
        assert!(pulses.iter().all(|&p| p == 0));
        assert!(ebits.iter().all(|&e| e == 0));
    }

    #[test]
    fn pulse_cache_rows_round_trip() {
        // bits2pulses inverts pulses2bits for every entry of a row.
        for &(band, lm_plus_1) in &[(0usize, 1usize), (5, 2), (12, 3), (18, 4), (20, 4)] {
            let row = cache_row(band, lm_plus_1);
            let max_k = row[0] as usize;
            assert!(max_k > 0);

            for k in 1..=max_k {
                let bits = pulses2bits(&row, k);
                assert!(bits > 0);
                assert_eq!(bits2pulses(&row, bits), k, "band={} lm+1={} k={}", band, lm_plus_1, k);
            }
        }
    }

    #[test]
    fn cache_rows_are_shared() {
        let a = cache_row(0, 2);
        let b = cache_row(1, 2);
        // Bands zero and one have the same width, so the rows are one allocation.
        assert!(Arc::ptr_eq(&a, &b));
    }
}
