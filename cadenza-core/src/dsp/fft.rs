// Cadenza
// Copyright (c) 2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `fft` module implements the Fast Fourier Transform (FFT).
//!
//! The complex (I)FFT in this module supports a size up-to 1024. The FFT is implemented using the
//! radix-2 Cooley-Tukey algorithm. Sizes of 8 or less use unrolled kernels.

use std::convert::TryInto;
use std::f64;

use lazy_static::lazy_static;

use super::complex::Complex;

macro_rules! fft_twiddle_table {
    ($bi:expr, $name:ident) => {
        lazy_static! {
            static ref $name: [Complex; (1 << $bi) >> 1] = {
                const N: usize = 1 << $bi;

                let mut table = [Default::default(); N >> 1];

                let theta = f64::consts::PI / (N >> 1) as f64;

                for (k, t) in table.iter_mut().enumerate() {
                    let angle = theta * k as f64;
                    *t = Complex::new(angle.cos(), -angle.sin());
                }

                table
            };
        }
    };
}

fft_twiddle_table!(4, FFT_TWIDDLE_TABLE_16);
fft_twiddle_table!(5, FFT_TWIDDLE_TABLE_32);
fft_twiddle_table!(6, FFT_TWIDDLE_TABLE_64);
fft_twiddle_table!(7, FFT_TWIDDLE_TABLE_128);
fft_twiddle_table!(8, FFT_TWIDDLE_TABLE_256);
fft_twiddle_table!(9, FFT_TWIDDLE_TABLE_512);
fft_twiddle_table!(10, FFT_TWIDDLE_TABLE_1024);

/// Get the twiddle factors for a FFT of size `n`.
fn fft_twiddle_factors(n: usize) -> &'static [Complex] {
    // FFT sizes <= 8 use unrolled FFT implementations with hard-coded twiddle factors.
    match n {
        16 => FFT_TWIDDLE_TABLE_16.as_ref(),
        32 => FFT_TWIDDLE_TABLE_32.as_ref(),
        64 => FFT_TWIDDLE_TABLE_64.as_ref(),
        128 => FFT_TWIDDLE_TABLE_128.as_ref(),
        256 => FFT_TWIDDLE_TABLE_256.as_ref(),
        512 => FFT_TWIDDLE_TABLE_512.as_ref(),
        1024 => FFT_TWIDDLE_TABLE_1024.as_ref(),
        _ => panic!("fft size too large"),
    }
}

/// The complex Fast Fourier Transform (FFT).
pub struct Fft {
    perm: Box<[u16]>,
}

impl Fft {
    /// The maximum FFT size.
    pub const MAX_SIZE: usize = 1 << 10;

    pub fn new(n: usize) -> Self {
        // The FFT size must be a power of two.
        assert!(n.is_power_of_two());
        // The permutation table uses 16-bit indicies, and the twiddle tables stop at 1024.
        assert!(n <= Fft::MAX_SIZE);

        // Calculate the bit reversal table.
        let n = n as u16;
        let shift = n.leading_zeros() + 1;
        let perm = (0..n).map(|i| i.reverse_bits() >> shift).collect();

        Self { perm }
    }

    /// Get the size of the FFT.
    pub fn size(&self) -> usize {
        self.perm.len()
    }

    /// Calculate the FFT.
    pub fn fft(&self, x: &[Complex], y: &mut [Complex]) {
        let n = x.len();
        assert_eq!(n, y.len());
        assert_eq!(n, self.perm.len());

        // Bit reversal using pre-computed permutation table.
        for (x, y) in self.perm.iter().map(|&i| x[usize::from(i)]).zip(y.iter_mut()) {
            *y = x;
        }

        Self::transform(y, n);
    }

    /// Calculate the inverse FFT.
    pub fn ifft(&self, x: &[Complex], y: &mut [Complex]) {
        let n = x.len();
        assert_eq!(n, y.len());
        assert_eq!(n, self.perm.len());

        // Bit reversal using the pre-computed permutation table, swapping the real and imaginary
        // components on the way in and out to compute the inverse with the forward transform.
        for (x, y) in self.perm.iter().map(|&i| x[usize::from(i)]).zip(y.iter_mut()) {
            *y = Complex { re: x.im, im: x.re };
        }

        // Do the forward FFT.
        Self::transform(y, n);

        // Output scale.
        let c = 1.0 / n as f64;

        for y in y.iter_mut() {
            *y = Complex { re: c * y.im, im: c * y.re };
        }
    }

    fn transform(x: &mut [Complex], n: usize) {
        fn to_arr(x: &mut [Complex]) -> Option<&mut [Complex; 8]> {
            x.try_into().ok()
        }

        if n < 8 {
            match n {
                1 => (),
                2 => fft2(x.try_into().unwrap()),
                4 => fft4(x.try_into().unwrap()),
                _ => unreachable!(),
            }
        }
        else if let Some(x) = to_arr(x) {
            fft8(x);
        }
        else {
            let n_half = n >> 1;

            let (even, odd) = x.split_at_mut(n_half);

            Self::transform(even, n_half);
            Self::transform(odd, n_half);

            let twiddle = fft_twiddle_factors(n);

            for ((e, o), w) in even.iter_mut().zip(odd.iter_mut()).zip(twiddle.iter()) {
                let p = *e;
                let q = *o * *w;

                *e = p + q;
                *o = p - q;
            }
        }
    }
}

fn fft2(x: &mut [Complex; 2]) {
    let x0 = x[0];
    let x1 = x[1];

    x[0] = x0 + x1;
    x[1] = x0 - x1;
}

fn fft4(x: &mut [Complex; 4]) {
    let x0 = x[0];
    let x1 = x[1];
    let x2 = x[2];
    let x3 = x[3];

    let p0 = x0 + x1;
    let m0 = x0 - x1;
    let p1 = x2 + x3;
    let m1 = x2 - x3;

    // The twiddle for the second butterfly column is -j.
    let m1j = Complex::new(m1.im, -m1.re);

    x[0] = p0 + p1;
    x[1] = m0 + m1j;
    x[2] = p0 - p1;
    x[3] = m0 - m1j;
}

fn fft8(x: &mut [Complex; 8]) {
    let mut x0 = [x[0], x[1], x[2], x[3]];
    let mut x1 = [x[4], x[5], x[6], x[7]];

    fft4(&mut x0);
    fft4(&mut x1);

    // W(1, 8) and W(3, 8) reduce to (±1 ∓ j) / sqrt(2).
    let a1 = f64::consts::FRAC_1_SQRT_2 * (x1[1].re + x1[1].im);
    let b1 = f64::consts::FRAC_1_SQRT_2 * (x1[1].im - x1[1].re);
    let a3 = f64::consts::FRAC_1_SQRT_2 * (x1[3].im - x1[3].re);
    let b3 = -f64::consts::FRAC_1_SQRT_2 * (x1[3].re + x1[3].im);

    let x1p = [
        x1[0],
        Complex::new(a1, b1),
        Complex::new(x1[2].im, -x1[2].re),
        Complex::new(a3, b3),
    ];

    x[0] = x0[0] + x1p[0];
    x[1] = x0[1] + x1p[1];
    x[2] = x0[2] + x1p[2];
    x[3] = x0[3] + x1p[3];

    x[4] = x0[0] - x1p[0];
    x[5] = x0[1] - x1p[1];
    x[6] = x0[2] - x1p[2];
    x[7] = x0[3] - x1p[3];
}

#[cfg(test)]
mod tests {
    use std::f64;

    use super::*;

    /// Compute the DFT directly from its definition.
    fn dft_analytical(x: &[Complex], y: &mut [Complex]) {
        let n = x.len();

        let theta = -2.0 * f64::consts::PI / n as f64;

        for (k, y) in y.iter_mut().enumerate() {
            let mut sum = Complex::default();

            for (i, x) in x.iter().enumerate() {
                let angle = theta * (k * i) as f64;
                sum = sum + *x * Complex::new(angle.cos(), angle.sin());
            }

            *y = sum;
        }
    }

    fn test_vector(n: usize) -> Vec<Complex> {
        // A deterministic, aperiodic test signal.
        (0..n)
            .map(|i| {
                let t = i as f64;
                Complex::new((0.3 * t).sin() + 0.25 * (1.7 * t).cos(), (0.9 * t).sin())
            })
            .collect()
    }

    #[test]
    fn verify_fft() {
        for &n in &[2, 4, 8, 16, 32, 64, 128, 256, 512, 1024] {
            let x = test_vector(n);
            let mut actual = vec![Complex::default(); n];
            let mut expected = vec![Complex::default(); n];

            Fft::new(n).fft(&x, &mut actual);
            dft_analytical(&x, &mut expected);

            for (a, e) in actual.iter().zip(&expected) {
                assert!((a.re - e.re).abs() < 1e-9, "n={}: {} != {}", n, a.re, e.re);
                assert!((a.im - e.im).abs() < 1e-9, "n={}: {} != {}", n, a.im, e.im);
            }
        }
    }

    #[test]
    fn verify_ifft_roundtrip() {
        for &n in &[8, 64, 256] {
            let x = test_vector(n);
            let mut y = vec![Complex::default(); n];
            let mut z = vec![Complex::default(); n];

            let fft = Fft::new(n);
            fft.fft(&x, &mut y);
            fft.ifft(&y, &mut z);

            for (a, e) in z.iter().zip(&x) {
                assert!((a.re - e.re).abs() < 1e-12);
                assert!((a.im - e.im).abs() < 1e-12);
            }
        }
    }
}
