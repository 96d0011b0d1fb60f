//! Conversions between the 16-bit wire form and normalized float samples.

use byteorder::{ByteOrder, LittleEndian};

/// Decode little-endian 16-bit PCM into floats in [-1.0, 1.0).
///
/// A trailing odd byte is ignored.
pub fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..samples.len() * 2], &mut samples);
    i16_to_f32(&samples)
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Encode floats as little-endian 16-bit PCM, clamping out of range values.
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let ints: Vec<i16> = samples
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect();

    let mut bytes = vec![0u8; ints.len() * 2];
    LittleEndian::write_i16_into(&ints, &mut bytes);
    bytes
}
