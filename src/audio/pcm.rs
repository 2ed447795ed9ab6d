//! PCM16 conversion and linear resampling
//!
//! Everything here is pure: identical input always produces bit-identical
//! output, which is what the golden-file tests rely on.
//!
//! # Wire format
//!
//! Audio on the live protocol is mono signed 16-bit little-endian PCM,
//! base64-encoded inside a JSON string.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Sample rate the service expects for uploaded audio
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Mime type tagged onto every uploaded capture frame
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Resample `samples` from `source_rate` to `target_rate` using linear interpolation
///
/// Returns the input unchanged when the rates match. Positions past the end
/// of the input are clamped to the last sample.
///
/// # Arguments
/// * `samples` - Input samples in `[-1, 1]` at `source_rate`
/// * `source_rate` - Source sample rate (e.g., 48000)
/// * `target_rate` - Target sample rate (e.g., 16000)
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let new_len = (samples.len() as f64 / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let fraction = (position - index as f64) as f32;

            if index < last {
                samples[index] * (1.0 - fraction) + samples[index + 1] * fraction
            } else {
                samples[last]
            }
        })
        .collect()
}

/// Convert one float sample to PCM16: clamp to `[-1, 1]`, then `floor(s * 32767)`
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).floor() as i16
}

/// Convert a float buffer to PCM16
pub fn encode_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| f32_to_pcm16(s)).collect()
}

/// Resample to `target_rate` and encode as PCM16 in one pass
pub fn resample_to_pcm16(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<i16> {
    encode_pcm16(&resample_linear(samples, source_rate, target_rate))
}

/// Serialize PCM16 samples as little-endian bytes
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Base64-encode PCM16 samples for a `MediaChunk` payload
pub fn encode_base64_pcm16(samples: &[i16]) -> String {
    STANDARD.encode(pcm16_to_le_bytes(samples))
}

/// Decode little-endian PCM16 bytes into floats (`sample / 32768`)
///
/// A trailing odd byte is dropped; only complete sample pairs are decoded.
pub fn decode_pcm16_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}
