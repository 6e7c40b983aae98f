//! Pyramid vector decoding and shape operations.
///
/// A coded band shape arrives as a PVQ index, is expanded to an integer pulse vector, scaled to
/// unit L2 norm, and un-rotated by the spreading transform the encoder applied to flatten its
/// spectrum. Bands with multiple short blocks also report which blocks received pulses so that
/// later folding and anti-collapse know where energy actually landed.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3.4
use crate::celt::cwrs::decode_pulses;
use crate::range::RangeDecoder;

/// The spreading (rotation) strength applied to coded shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spread {
    None,
    Light,
    Normal,
    Aggressive,
}

impl Spread {
    pub fn from_index(index: usize) -> Spread {
        return match index {
            0 => Spread::None,
            1 => Spread::Light,
            2 => Spread::Normal,
            _ => Spread::Aggressive,
        };
    }

    /// Spreading factor; larger factors rotate less.
    fn factor(self) -> Option<i32> {
        return match self {
            Spread::None => None,
            Spread::Light => Some(15),
            Spread::Normal => Some(10),
            Spread::Aggressive => Some(5),
        };
    }
}

/// One stage of the rotation, a lattice of two-tap butterflies run forward and then backward.
fn exp_rotation1(x: &mut [f32], stride: usize, c: f32, s: f32) {
    let len = x.len();
    let ms = -s;

    for i in 0..len - stride {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    }

    if len > 2 * stride {
        for i in (0..=(len - 2 * stride - 1)).rev() {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 + s * x1;
            x[i] = c * x1 + ms * x2;
        }
    }
}

/// The spreading rotation. `dir` is 1 on the analysis side and -1 to undo it when decoding.
pub fn exp_rotation(x: &mut [f32], dir: i32, stride: usize, k: usize, spread: Spread) {
    let len = x.len();

    let factor = match spread.factor() {
        Some(factor) if 2 * k < len => factor,
        _ => return,
    };

    let gain = len as f32 / (len + (factor as usize) * k) as f32;
    let theta = 0.5 * gain * gain;

    let c = (0.5 * std::f32::consts::PI * theta).cos();
    let s = (0.5 * std::f32::consts::PI * (1.0 - theta)).cos();

    // A second rotation pass at roughly sqrt(len/stride) spacing widens the spreading for long
    // blocks.
    let mut stride2 = 0usize;
    if len >= 8 * stride {
        stride2 = 1;
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let len_per = len / stride;
    if len_per == 0 {
        return;
    }

    for chunk in x.chunks_exact_mut(len_per).take(stride) {
        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(chunk, stride2, s, c);
            }
            exp_rotation1(chunk, 1, c, s);
        }
        else {
            exp_rotation1(chunk, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(chunk, stride2, s, -c);
            }
        }
    }
}

/// Scale an integer pulse vector to a unit-norm shape times `gain`.
fn normalise_residual(iy: &[i32], x: &mut [f32], ryy: u32, gain: f32) {
    let g = gain / (ryy as f32).sqrt();

    for (x, &y) in x.iter_mut().zip(iy.iter()) {
        *x = g * y as f32;
    }
}

/// Scale `x` to L2 norm `gain`.
pub fn renormalise_vector(x: &mut [f32], gain: f32) {
    let e: f32 = 1e-15 + x.iter().map(|v| v * v).sum::<f32>();
    let g = gain / e.sqrt();

    for v in x.iter_mut() {
        *v *= g;
    }
}

/// Which of the `b` interleaved short blocks of `iy` hold any pulse.
fn extract_collapse_mask(iy: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }

    let n0 = iy.len() / b;
    let mut mask = 0u32;

    for (block, chunk) in iy.chunks_exact(n0).enumerate().take(b) {
        if chunk.iter().any(|&v| v != 0) {
            mask |= 1 << block;
        }
    }

    return mask;
}

/// Decode a band shape with `k` pulses into `x`, undoing the spreading rotation. Returns the
/// collapse mask over the band's `b` short blocks.
#[allow(clippy::too_many_arguments)]
pub fn alg_unquant(
    x: &mut [f32],
    k: usize,
    spread: Spread,
    b: usize,
    rd: &mut RangeDecoder<'_>,
    gain: f32,
    iy: &mut Vec<i32>,
    row: &mut Vec<u32>,
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0);
    debug_assert!(n > 1);

    iy.clear();
    iy.resize(n, 0);

    let ryy = decode_pulses(iy, n, k, rd, row);

    normalise_residual(iy, x, ryy, gain);
    exp_rotation(x, -1, b, k, spread);

    return extract_collapse_mask(iy, b);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2_norm(x: &[f32]) -> f32 {
        x.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    #[test]
    fn rotation_round_trips() {
        for &(n, k, b, spread) in &[
            (16usize, 3usize, 1usize, Spread::Normal),
            (24, 2, 1, Spread::Light),
            (32, 4, 2, Spread::Aggressive),
            (64, 1, 4, Spread::Normal),
        ] {
            let original: Vec<f32> =
                (0..n).map(|i| ((i * 7 + 3) % 11) as f32 / 11.0 - 0.5).collect();
            let mut x = original.clone();

            exp_rotation(&mut x, 1, b, k, spread);
            exp_rotation(&mut x, -1, b, k, spread);

            for (a, e) in x.iter().zip(&original) {
                assert!((a - e).abs() < 1e-5, "n={} k={}: {} != {}", n, k, a, e);
            }
        }
    }

    #[test]
    fn rotation_preserves_energy() {
        let mut x: Vec<f32> = (0..30).map(|i| ((i as f32) * 0.7).sin()).collect();
        let before = l2_norm(&x);

        exp_rotation(&mut x, -1, 1, 4, Spread::Normal);

        assert!((l2_norm(&x) - before).abs() < 1e-4);
    }

    #[test]
    fn no_rotation_when_dense_or_disabled() {
        let original: Vec<f32> = (0..8).map(|i| i as f32).collect();

        // Too many pulses relative to the length.
        let mut x = original.clone();
        exp_rotation(&mut x, -1, 1, 4, Spread::Normal);
        assert_eq!(x, original);

        // Spreading disabled outright.
        let mut x = original.clone();
        exp_rotation(&mut x, -1, 1, 1, Spread::None);
        assert_eq!(x, original);
    }

    #[test]
    fn renormalise_hits_target_gain() {
        let mut x: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        renormalise_vector(&mut x, 1.0);
        assert!((l2_norm(&x) - 1.0).abs() < 1e-6);

        renormalise_vector(&mut x, 0.5);
        assert!((l2_norm(&x) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn decoded_shape_has_unit_norm() {
        for payload in [[0x37u8; 40], [0xE1; 40], [0x00; 40]] {
            let mut rd = RangeDecoder::new(&payload);
            let mut x = vec![0.0f32; 16];
            let mut iy = Vec::new();
            let mut row = Vec::new();

            let mask =
                alg_unquant(&mut x, 4, Spread::Normal, 1, &mut rd, 1.0, &mut iy, &mut row);

            assert_eq!(mask, 1);
            assert!((l2_norm(&x) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn collapse_mask_tracks_blocks_with_pulses() {
        assert_eq!(extract_collapse_mask(&[0, 0, 1, 0], 1), 1);
        assert_eq!(extract_collapse_mask(&[0, 0, 1, 0], 2), 0b10);
        assert_eq!(extract_collapse_mask(&[2, 0, 1, 0], 2), 0b11);
        assert_eq!(extract_collapse_mask(&[0, 0, 0, 0], 4), 0);
    }
}
