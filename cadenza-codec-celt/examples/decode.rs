//! Decode raw CELT frame payloads from a file and write PCM to stdout.
//!
//! Each input frame is a two byte big-endian length prefix followed by that many payload bytes.
//! Output is 32-bit float little-endian PCM at 48 kHz, interleaved for stereo.
//!
//! ```text
//! cargo run --example decode -- frames.bin 960 2 > out.f32
//! ```

use std::env;
use std::fs;
use std::io::{self, Write};

use cadenza_codec_celt::CeltDecoder;

fn main() {
    let mut args = env::args().skip(1);

    let path = args.next().expect("usage: decode <frames> [frame_size] [channels]");
    let frame_size: usize = args.next().map_or(960, |v| v.parse().expect("bad frame size"));
    let channels: usize = args.next().map_or(1, |v| v.parse().expect("bad channel count"));

    let data = fs::read(&path).expect("cannot read input");

    let mut decoder = CeltDecoder::try_new(channels).expect("bad channel count");
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut cursor = 0usize;
    let mut frames = 0usize;

    while cursor + 2 <= data.len() {
        let len = usize::from(data[cursor]) << 8 | usize::from(data[cursor + 1]);
        cursor += 2;

        let end = (cursor + len).min(data.len());
        let payload = &data[cursor..end];
        cursor = end;

        let samples = decoder.decode_frame(payload, frame_size).expect("decode failed");

        for sample in samples {
            out.write_all(&sample.to_le_bytes()).expect("write failed");
        }

        frames += 1;
    }

    eprintln!("decoded {} frames of {} samples", frames, frame_size);
}
