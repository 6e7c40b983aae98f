// Cadenza
// Copyright (c) 2026 The Project Cadenza Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pure Rust CELT decoder.
//!
//! CELT is the MDCT layer of the Opus codec. An Opus decoder routes each frame through one or
//! both of the SILK and CELT decoders depending on the mode signalled in the table of contents:
//!```text
//!
//!                          +---------+    +------------+
//!                          |  SILK   |    |   Sample   |
//!                       +->| Decoder |--->|    Rate    |----+
//! Bit-    +---------+   |  |         |    | Conversion |    v
//! stream  |  Range  |---+  +---------+    +------------+  /---\  Audio
//! ------->| Decoder |                                     | + |------>
//!         |         |---+  +---------+    +------------+  \---/
//!         +---------+   |  |  CELT   |    | Decimation |    ^
//!                       +->| Decoder |--->| (Optional) |----+
//!                          |         |    |            |
//!                          +---------+    +------------+
//! ```
//! This crate implements the CELT block: one [`celt::CeltDecoder`] turns a compressed frame
//! payload into a block of PCM samples at 48 kHz, mono or stereo, for the four CELT frame sizes
//! of 2.5, 5, 10, and 20 ms. Framing, the SILK layer, packet loss concealment, post-filter
//! application, and resampling belong to the layers around this crate.
//!
//! https://datatracker.ietf.org/doc/html/rfc6716#section-4.3
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// The following lints are allowed in all Cadenza crates. Please see the workspace manifest for
// their justification.
#![allow(clippy::comparison_chain)]
#![allow(clippy::excessive_precision)]
#![allow(clippy::identity_op)]
#![allow(clippy::manual_range_contains)]
// Disable to better express the specification.
#![allow(clippy::collapsible_else_if)]
#![allow(clippy::needless_return)]

pub mod celt;
pub mod error;
pub mod range;

pub use celt::{Bandwidth, CeltDecoder, CeltTrace, NoTrace, PostFilter};
