//! Combinatorial indexing of PVQ pulse vectors.
///
/// A band shape is coded as a vector of N signed integer pulses with L1 norm K, identified by a
/// single index into an enumeration of all such vectors. `U(n, k)` counts the vectors of
/// dimension `n` and norm `k` whose first non-zero coefficient is positive; the full codebook
/// size is `V(n, k) = U(n, k) + U(n, k+1)`. `U` is symmetric in its arguments and satisfies
///
/// ```text
/// U(n, k) = U(n-1, k) + U(n, k-1) + U(n-1, k-1)
/// ```
///
/// Rather than embedding the triangle of `U` values, rows are built with the recurrence above and
/// walked back down one dimension at a time while decoding.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3.4.2
use crate::celt::math::log2_frac;
use crate::range::RangeDecoder;

/// Largest number of pseudo-pulses the rate cache tracks per band.
pub const MAX_PSEUDO: usize = 40;
/// log2 of `MAX_PSEUDO` rounded up; the depth of the pulse search.
pub const LOG_MAX_PSEUDO: u32 = 6;

/// Expand a pseudo-pulse count into an actual pulse count. Counts above eight grow
/// exponentially with a three-bit mantissa.
#[inline]
pub fn get_pulses(i: usize) -> usize {
    if i < 8 {
        i
    }
    else {
        (8 + (i & 7)) << ((i >> 3) - 1)
    }
}

/// Whether `V(n, k)` fits in 32 bits.
pub fn fits_in32(n: usize, k: usize) -> bool {
    const MAX_N: [i16; 15] =
        [32767, 32767, 32767, 1476, 283, 109, 60, 40, 29, 24, 20, 18, 16, 14, 13];
    const MAX_K: [i16; 15] =
        [32767, 32767, 32767, 32767, 1172, 238, 95, 53, 36, 27, 22, 18, 16, 15, 13];

    if n >= 14 {
        if k >= 14 {
            false
        }
        else {
            n <= MAX_N[k] as usize
        }
    }
    else {
        k <= MAX_K[n] as usize
    }
}

/// Replace the row `U(n, 0..len)` with `U(n+1, 0..len)` in place.
fn unext(row: &mut [u32]) {
    let mut old_km1 = row[0];
    for k in 1..row.len() {
        let old_k = row[k];
        row[k] = old_k + row[k - 1] + old_km1;
        old_km1 = old_k;
    }
}

/// Replace the row `U(n, 0..len)` with `U(n-1, 0..len)` in place.
fn uprev(row: &mut [u32]) {
    let mut old_km1 = row[0];
    for k in 1..row.len() {
        let old_k = row[k];
        row[k] = old_k - row[k - 1] - old_km1;
        old_km1 = old_k;
    }
}

/// Fill `row` with `U(n, 0..=kmax)`. The caller bounds `kmax` so that no entry overflows; rows
/// are never built past `U(n, k+1)` for a codebook `V(n, k)` that fits 32 bits.
fn build_u_row(n: usize, kmax: usize, row: &mut Vec<u32>) {
    debug_assert!(n >= 1);

    row.clear();
    row.resize(kmax + 1, 1);
    row[0] = 0;

    for _ in 1..n {
        unext(row);
    }
}

/// `U(n, k)`.
pub fn pvq_u(n: usize, k: usize) -> u32 {
    // The triangle is symmetric; build the smaller row.
    let (n, k) = if n < k { (n, k) } else { (k, n) };

    if n == 0 {
        return 0;
    }

    // Rows are cheap at the sizes this entry point sees; the decode hot path goes through
    // `cwrsi` with caller scratch instead.
    let mut row = Vec::new();
    build_u_row(n, k, &mut row);
    return row[k];
}

/// The codebook size `V(n, k)`.
pub fn pvq_v(n: usize, k: usize) -> u32 {
    return pvq_u(n, k) + pvq_u(n, k + 1);
}

/// Reconstruct the pulse vector for codebook index `i`. Returns the squared L2 norm of the
/// vector. `row` is caller-provided scratch.
pub fn cwrsi(n: usize, k: usize, i: u32, y: &mut [i32], row: &mut Vec<u32>) -> u32 {
    debug_assert!(n >= 2);
    debug_assert!(k > 0);

    let mut n = n;
    let mut k = k;
    let mut i = i;
    let mut yy = 0u32;
    let mut yi = 0usize;

    build_u_row(n, k + 1, row);

    while n > 2 {
        let (val, k_next) = if k >= n {
            // Lots of pulses: a run of pulses is likelier than a zero in this dimension.
            let p = row[k + 1];
            let negative = i >= p;
            if negative {
                i -= p;
            }

            let k0 = k;
            let q = row[n];

            if q > i {
                debug_assert!(p > q);
                k = n;
                loop {
                    k -= 1;
                    if row[k] <= i {
                        break;
                    }
                }
            }
            else {
                while row[k] > i {
                    k -= 1;
                }
            }
            i -= row[k];

            (signed_count(k0 - k, negative), k)
        }
        else {
            // Lots of dimensions: most dimensions hold no pulse at all.
            let p = row[k];
            let q = row[k + 1];

            if p <= i && i < q {
                i -= p;
                (0, k)
            }
            else {
                let negative = i >= q;
                if negative {
                    i -= q;
                }

                let k0 = k;
                loop {
                    k -= 1;
                    if row[k] <= i {
                        break;
                    }
                }
                i -= row[k];

                (signed_count(k0 - k, negative), k)
            }
        };

        y[yi] = val;
        yy += (val * val) as u32;
        yi += 1;
        k = k_next;
        n -= 1;
        uprev(row);
    }

    // Two dimensions left; U(2, k) = 2k - 1 closes the scan in constant time.
    {
        let p = 2 * (k as u32) + 1;
        let negative = i >= p;
        if negative {
            i -= p;
        }

        let k0 = k;
        k = ((i + 1) >> 1) as usize;
        if k > 0 {
            i -= 2 * (k as u32) - 1;
        }

        let val = signed_count(k0 - k, negative);
        y[yi] = val;
        yy += (val * val) as u32;
        yi += 1;
    }

    // Last dimension: only the sign remains.
    {
        debug_assert!(i <= 1);
        let val = if i != 0 { -(k as i32) } else { k as i32 };
        y[yi] = val;
        yy += (val * val) as u32;
    }

    return yy;
}

#[inline]
fn signed_count(count: usize, negative: bool) -> i32 {
    let count = count as i32;
    return if negative { -count } else { count };
}

/// Compute the codebook index of a pulse vector. The inverse of `cwrsi`.
pub fn icwrs(y: &[i32]) -> u32 {
    let n = y.len();
    debug_assert!(n >= 2);

    let mut j = n - 1;
    let mut i: u32 = if y[j] < 0 { 1 } else { 0 };
    let mut k = y[j].unsigned_abs() as usize;

    loop {
        j -= 1;
        i += pvq_u(n - j, k);
        k += y[j].unsigned_abs() as usize;
        if y[j] < 0 {
            i += pvq_u(n - j, k + 1);
        }
        if j == 0 {
            break;
        }
    }

    return i;
}

/// Decode a pulse vector of dimension `n` with `k` pulses from the range decoder. Returns the
/// squared L2 norm of the decoded vector.
pub fn decode_pulses(y: &mut [i32], n: usize, k: usize, rd: &mut RangeDecoder<'_>, row: &mut Vec<u32>) -> u32 {
    let index = rd.decode_uniform(pvq_v(n, k));
    return cwrsi(n, k, index, y, row);
}

/// Fill `bits[k]` with the Q`frac` size of the codebook for each pulse count `0..=max_k`.
pub fn get_required_bits(bits: &mut [i32], n: usize, max_k: usize, frac: u32) {
    debug_assert!(max_k > 0);

    bits[0] = 0;

    if n == 1 {
        // One dimension carries only a sign.
        for b in bits[1..=max_k].iter_mut() {
            *b = 1 << frac;
        }
    }
    else {
        let mut row = Vec::new();
        build_u_row(n, max_k + 1, &mut row);
        for (i, b) in bits[1..=max_k].iter_mut().enumerate() {
            // V(n, k) = U(n, k) + U(n, k + 1) for pulse count k = i + 1.
            *b = log2_frac(row[i + 1] + row[i + 2], frac);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u_known_values() {
        assert_eq!(pvq_u(0, 3), 0);
        assert_eq!(pvq_u(1, 5), 1);
        assert_eq!(pvq_u(2, 2), 3);
        assert_eq!(pvq_u(2, 3), 5);
        assert_eq!(pvq_u(3, 2), 5);
        // Symmetry.
        for n in 1..8 {
            for k in 1..8 {
                assert_eq!(pvq_u(n, k), pvq_u(k, n));
            }
        }
    }

    #[test]
    fn v_known_values() {
        // V(n, 1) = 2n: one pulse anywhere, either sign.
        for n in 1..10 {
            assert_eq!(pvq_v(n, 1), 2 * n as u32);
        }
        // V(n, 0) = 1: the empty vector.
        for n in 1..10 {
            assert_eq!(pvq_v(n, 0), 1);
        }
        // V(2, 3): all (a, b) with |a| + |b| = 3.
        assert_eq!(pvq_v(2, 3), 12);
    }

    #[test]
    fn cwrsi_enumerates_the_pyramid() {
        // Every index in the codebook decodes to a distinct vector with L1 norm K, and
        // re-encoding recovers the index.
        let mut row = Vec::new();

        for n in 2..=6usize {
            for k in 1..=5usize {
                let size = pvq_v(n, k);
                let mut y = vec![0i32; n];

                for i in 0..size {
                    let yy = cwrsi(n, k, i, &mut y, &mut row);

                    let l1: i32 = y.iter().map(|v| v.abs()).sum();
                    assert_eq!(l1 as usize, k, "n={} k={} i={} y={:?}", n, k, i, y);

                    let l2: i32 = y.iter().map(|v| v * v).sum();
                    assert_eq!(l2 as u32, yy);

                    assert_eq!(icwrs(&y), i, "n={} k={} y={:?}", n, k, y);
                }
            }
        }
    }

    #[test]
    fn get_required_bits_is_monotonic() {
        let mut bits = [0i32; 17];
        get_required_bits(&mut bits, 8, 16, 3);

        assert_eq!(bits[0], 0);
        for w in bits.windows(2) {
            assert!(w[1] > w[0]);
        }

        // V(8, 1) = 16, so one pulse costs exactly four bits.
        assert_eq!(bits[1], 4 << 3);
    }

    #[test]
    fn pseudo_pulse_expansion() {
        assert_eq!(get_pulses(0), 0);
        assert_eq!(get_pulses(7), 7);
        assert_eq!(get_pulses(8), 8);
        assert_eq!(get_pulses(15), 15);
        assert_eq!(get_pulses(16), 16);
        assert_eq!(get_pulses(17), 18);
        assert_eq!(get_pulses(24), 32);
        assert_eq!(get_pulses(39), 120);
    }

    #[test]
    fn fits_in32_bounds() {
        assert!(fits_in32(2, 1000));
        assert!(fits_in32(176, 4));
        assert!(!fits_in32(176, 5));
        assert!(!fits_in32(100, 100));
    }

    proptest::proptest! {
        #[test]
        fn cwrsi_round_trips_arbitrary_indices(
            n in 2usize..24,
            k in 1usize..12,
            i_seed in proptest::num::u32::ANY,
        ) {
            let size = pvq_v(n, k);
            let i = i_seed % size;

            let mut y = vec![0i32; n];
            let mut row = Vec::new();
            cwrsi(n, k, i, &mut y, &mut row);

            let l1: i32 = y.iter().map(|v| v.abs()).sum();
            proptest::prop_assert_eq!(l1 as usize, k);
            proptest::prop_assert_eq!(icwrs(&y), i);
        }
    }
}
