//! # PCM Codec
//!
//! Conversion between normalized float samples and 16-bit signed little-endian
//! PCM, bit-compatible with the ordering server and the deployed kiosks.
//!
//! ## Scale:
//! - **Encode**: clamp to [-1.0, 1.0]; negative values scale by 32768 (0x8000),
//!   non-negative values by 32767 (0x7FFF); round to nearest
//! - **Decode**: divide by 32768
//!
//! The asymmetric encode scale keeps both ends of the range in i16 without
//! overflow. It must not be "fixed".

use byteorder::{ByteOrder, LittleEndian};

const NEGATIVE_SCALE: f32 = 32768.0;
const POSITIVE_SCALE: f32 = 32767.0;
const DECODE_SCALE: f32 = 32768.0;

/// Encode one float sample. NaN encodes as silence.
pub fn encode_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 {
        s * NEGATIVE_SCALE
    } else {
        s * POSITIVE_SCALE
    };
    scaled.round() as i16
}

/// One 16-bit sample to a float in [-1.0, 1.0).
pub fn decode_sample(value: i16) -> f32 {
    value as f32 / DECODE_SCALE
}

/// Append the little-endian encoding of `samples` to `out`.
///
/// Does not allocate when `out` already has room for `2 * samples.len()` bytes.
pub fn encode_into(samples: &[f32], out: &mut Vec<u8>) {
    let mut pair = [0u8; 2];
    for &sample in samples {
        LittleEndian::write_i16(&mut pair, encode_sample(sample));
        out.extend_from_slice(&pair);
    }
}

/// Decode little-endian PCM bytes, handing each sample to `sink`.
///
/// A trailing odd byte is ignored. Returns the number of samples decoded.
pub fn decode_into<F: FnMut(f32)>(bytes: &[u8], mut sink: F) -> usize {
    let mut count = 0;
    for pair in bytes.chunks_exact(2) {
        sink(decode_sample(LittleEndian::read_i16(pair)));
        count += 1;
    }
    count
}
