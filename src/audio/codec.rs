//! # PCM Codec
//!
//! Conversions between the sample formats used along the call pipeline:
//!
//! - **Capture**: normalized `f32` samples from the microphone are quantized to
//!   16-bit signed PCM, packed little-endian and base64-encoded for transport.
//! - **Playback**: base64 payloads from the agent are decoded to little-endian
//!   16-bit PCM and scaled back to normalized `f32` for the output device.
//!
//! ## Quantization rule:
//! `sample * 32768` is **truncated toward zero** and saturated to
//! `[-32768, 32767]`. Input is clamped to `[-1.0, 1.0]` first and `NaN`
//! becomes silence. Decoding divides by `32768`, so a round trip is accurate
//! to within one quantization step (`1 / 32768`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Full-scale divisor for 16-bit PCM.
pub const PCM16_SCALE: f32 = 32768.0;

/// Quantize normalized float samples to 16-bit PCM (truncation toward zero).
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
            // `as` truncates toward zero and saturates at the i32 bounds
            let scaled = (clamped * PCM16_SCALE) as i32;
            scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

/// Scale 16-bit PCM samples to the `[-1.0, 1.0)` float range.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / PCM16_SCALE).collect()
}

/// Pack samples as little-endian bytes.
pub fn pack_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Unpack little-endian bytes into samples.
///
/// The byte count must be even; a trailing odd byte means the payload was
/// truncated and the chunk is rejected.
pub fn unpack_le(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err(format!(
            "PCM payload length must be even for 16-bit samples, got {} bytes",
            data.len()
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode one capture frame into its transport text form.
pub fn encode_frame(samples: &[f32]) -> String {
    BASE64.encode(pack_le(&float_to_pcm16(samples)))
}

/// Decode one inbound transport payload into normalized float samples.
pub fn decode_chunk(payload: &str) -> Result<Vec<f32>, String> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| format!("Invalid base64 audio payload: {}", e))?;
    let samples = unpack_le(&bytes)?;
    Ok(pcm16_to_float(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_truncates_toward_zero() {
        // 0.5 / 32768 is half a step: truncation drops it on both sides of zero
        let half_step = 0.5 / PCM16_SCALE;
        assert_eq!(float_to_pcm16(&[half_step, -half_step]), vec![0, 0]);

        // 1.9 steps truncates to 1, -1.9 steps to -1
        let steps = 1.9 / PCM16_SCALE;
        assert_eq!(float_to_pcm16(&[steps, -steps]), vec![1, -1]);
    }

    #[test]
    fn test_quantization_saturates_and_clamps() {
        assert_eq!(float_to_pcm16(&[1.0, -1.0]), vec![32767, -32768]);
        assert_eq!(float_to_pcm16(&[4.0, -4.0]), vec![32767, -32768]);
        assert_eq!(float_to_pcm16(&[f32::NAN]), vec![0]);
    }

    #[test]
    fn test_pack_is_little_endian() {
        assert_eq!(pack_le(&[0x0102, -2]), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_unpack_rejects_odd_length() {
        assert!(unpack_le(&[0u8; 3]).is_err());
        assert_eq!(unpack_le(&[0x02, 0x01]).unwrap(), vec![0x0102]);
    }

    #[test]
    fn test_frame_round_trip_within_one_step() {
        let original: Vec<f32> = (0..4096)
            .map(|i| (i as f32 * 0.013).sin() * 0.8)
            .collect();

        let decoded = decode_chunk(&encode_frame(&original)).unwrap();

        assert_eq!(decoded.len(), original.len());
        for (before, after) in original.iter().zip(decoded.iter()) {
            let error = (before - after).abs();
            assert!(
                error <= 1.0 / PCM16_SCALE + f32::EPSILON,
                "Round trip error too large: {} vs {}",
                before,
                after
            );
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_chunk("not base64 !!").is_err());
    }
}
