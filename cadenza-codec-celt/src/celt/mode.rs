//! CELT operating modes.
///
/// The CELT layer runs on one of four frame sizes, all multiples of the 2.5 ms short block at
/// 48 kHz. A frame of `120 << LM` samples is coded as one long MDCT, or as `2^LM` short MDCTs
/// when the transient flag is set.
///
/// https://datatracker.ietf.org/doc/html/rfc6716#section-4.3
use std::convert::TryFrom;

use crate::error::Error;

/// Number of samples in one short block, and the window overlap, at 48 kHz.
pub const SHORT_BLOCK_SIZE: usize = 120;

/// Number of energy bands covering the full band.
pub const MAX_BANDS: usize = 21;

/// The largest supported frame, 20 ms at 48 kHz.
pub const MAX_FRAME_SIZE: usize = SHORT_BLOCK_SIZE << 3;

/// An immutable per-frame-size mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    /// Frame size in samples at 48 kHz.
    pub frame_size: usize,
    /// log2 of the frame size multiplier relative to 2.5 ms.
    pub lm: usize,
    /// Number of short blocks in a transient frame.
    pub short_blocks: usize,
    /// Number of coded energy bands.
    pub num_bands: usize,
}

const MODES: [Mode; 4] = [
    Mode { frame_size: 120, lm: 0, short_blocks: 1, num_bands: MAX_BANDS },
    Mode { frame_size: 240, lm: 1, short_blocks: 2, num_bands: MAX_BANDS },
    Mode { frame_size: 480, lm: 2, short_blocks: 4, num_bands: MAX_BANDS },
    Mode { frame_size: 960, lm: 3, short_blocks: 8, num_bands: MAX_BANDS },
];

impl Mode {
    /// Get the mode for a frame size. Only 120, 240, 480, and 960 sample frames exist.
    pub fn for_frame_size(frame_size: usize) -> Result<&'static Mode, Error> {
        return MODES
            .iter()
            .find(|mode| mode.frame_size == frame_size)
            .ok_or(Error::InvalidFrameSize);
    }

    /// The frame size multiplier, `M = 2^LM`.
    pub fn multiplier(&self) -> usize {
        return 1 << self.lm;
    }
}

/// The audio bandwidth occupied by a frame. Selects the highest coded band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    NarrowBand,
    MediumBand,
    WideBand,
    SuperWideBand,
    FullBand,
}

impl Bandwidth {
    /// The end band cap for this bandwidth.
    pub fn end_band(&self) -> usize {
        return match self {
            Bandwidth::NarrowBand => 13,
            Bandwidth::MediumBand => 17,
            Bandwidth::WideBand => 17,
            Bandwidth::SuperWideBand => 19,
            Bandwidth::FullBand => 21,
        };
    }
}

impl TryFrom<u8> for Bandwidth {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        return match value {
            0 => Ok(Bandwidth::NarrowBand),
            1 => Ok(Bandwidth::MediumBand),
            2 => Ok(Bandwidth::WideBand),
            3 => Ok(Bandwidth::SuperWideBand),
            4 => Ok(Bandwidth::FullBand),
            _ => Err(Error::MalformedPayload),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celt::tables::EBANDS;

    #[test]
    fn mode_map() {
        for (frame_size, lm) in [(120usize, 0usize), (240, 1), (480, 2), (960, 3)] {
            let mode = Mode::for_frame_size(frame_size).unwrap();
            assert_eq!(mode.lm, lm);
            assert_eq!(mode.frame_size, 120 << lm);
            assert_eq!(mode.short_blocks, 1 << lm);
            assert_eq!(mode.multiplier(), 1 << lm);
        }
    }

    #[test]
    fn invalid_frame_sizes() {
        for frame_size in [0usize, 100, 160, 320, 959, 961, 1920] {
            assert!(Mode::for_frame_size(frame_size).is_err());
        }
    }

    #[test]
    fn band_edges_are_strictly_increasing() {
        assert_eq!(EBANDS[0], 0);
        for w in EBANDS.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(EBANDS[MAX_BANDS] <= SHORT_BLOCK_SIZE as i16);
    }

    #[test]
    fn bandwidth_end_bands() {
        assert_eq!(Bandwidth::NarrowBand.end_band(), 13);
        assert_eq!(Bandwidth::MediumBand.end_band(), 17);
        assert_eq!(Bandwidth::WideBand.end_band(), 17);
        assert_eq!(Bandwidth::SuperWideBand.end_band(), 19);
        assert_eq!(Bandwidth::FullBand.end_band(), 21);
    }
}
