//! 16-bit PCM conversions shared by capture and playback.

use base64::Engine;

/// Convert one float sample to PCM16 with hard clamping. Out-of-range input
/// saturates; it never wraps.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32767.0
}

/// Interpret raw little-endian bytes as PCM16 samples. An odd byte count is
/// a garbled frame and rejected as a whole.
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, String> {
    if bytes.len() % 2 != 0 {
        return Err(format!("odd PCM byte count: {}", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode one base64 PCM frame from the wire side channel.
pub fn decode_frame(data: &str) -> Result<Vec<i16>, String> {
    let bytes = base64::prelude::BASE64_STANDARD
        .decode(data)
        .map_err(|err| err.to_string())?;
    bytes_to_samples(&bytes)
}

pub fn encode_frame(samples: &[i16]) -> String {
    base64::prelude::BASE64_STANDARD.encode(samples_to_bytes(samples))
}
