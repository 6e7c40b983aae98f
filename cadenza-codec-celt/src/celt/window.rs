// Cadenza
// Copyright (c) 2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use once_cell::sync::Lazy;

use super::mode::SHORT_BLOCK_SIZE;

/// For a given overlap, generates the rising half of the Vorbis power-complementary window.
///
/// The window is kept in double precision; power complementarity holds to 1e-12, which single
/// precision storage would destroy.
fn generate_window(overlap: usize) -> Vec<f64> {
    let denom = overlap as f64;

    let mut window = vec![0.0; overlap];

    for (i, w) in window.iter_mut().enumerate() {
        let num = i as f64 + 0.5;
        let frac = std::f64::consts::FRAC_PI_2 * (num / denom);
        *w = (std::f64::consts::FRAC_PI_2 * frac.sin().powi(2)).sin();
    }

    window
}

/// The 120-sample overlap window shared by every frame size.
pub static WINDOW: Lazy<Vec<f64>> = Lazy::new(|| generate_window(SHORT_BLOCK_SIZE));
