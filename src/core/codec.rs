//! Stateless audio conversion functions.
//!
//! - Window-averaging downsampler from float capture frames to 16-bit PCM
//! - G.711 µ-law compression and expansion (bit-exact with the peer's decoder)
//! - Inbound base64 PCM16 decoding to float samples

use base64::prelude::*;
use thiserror::Error;

/// Bias added before locating the µ-law segment.
const MULAW_BIAS: i32 = 0x84;

/// Largest magnitude representable before biasing.
const MULAW_CLIP: i32 = 32635;

/// Segment base values for expansion, indexed by exponent.
const MULAW_DECODE_TABLE: [i32; 8] = [0, 132, 396, 924, 1980, 4092, 8316, 16764];

/// Errors produced by codec functions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("downsampling rate should be lower than original sample rate ({target_rate} > {source_rate})")]
    UpsamplingNotSupported { source_rate: u32, target_rate: u32 },

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Round half toward positive infinity.
#[inline]
fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

/// Downsample float samples to 16-bit PCM by averaging fixed windows.
///
/// The output holds `round(len / (source_rate / target_rate))` samples. Output
/// sample `i` is the mean of the input window ending at `round((i + 1) * ratio)`,
/// scaled by 32767; an empty window produces 0.
pub fn downsample_buffer(input: &[f32], source_rate: u32, target_rate: u32) -> CodecResult<Vec<i16>> {
    if source_rate == 0 {
        return Err(CodecError::InvalidSampleRate(source_rate));
    }
    if target_rate == 0 {
        return Err(CodecError::InvalidSampleRate(target_rate));
    }
    if target_rate > source_rate {
        return Err(CodecError::UpsamplingNotSupported {
            source_rate,
            target_rate,
        });
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = round_half_up(input.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    let mut window_start = 0usize;
    for i in 0..output_len {
        let window_end = round_half_up((i + 1) as f64 * ratio) as usize;
        let end = window_end.min(input.len());

        let value = if window_start < end {
            let window = &input[window_start..end];
            let sum: f64 = window.iter().map(|&s| s as f64).sum();
            let mean = sum / window.len() as f64;
            round_half_up(mean * 32767.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16
        } else {
            0
        };

        output.push(value);
        window_start = window_end;
    }

    Ok(output)
}

/// Compress one 16-bit PCM sample to µ-law.
#[inline]
pub fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = (magnitude >> 8) & 0x80;
    if sign != 0 {
        magnitude = -magnitude;
    }
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Highest set bit of bits 7..=14 selects the segment.
    let segment = ((magnitude >> 7) & 0xFF) as u8;
    let exponent = if segment == 0 {
        0
    } else {
        7 - segment.leading_zeros() as i32
    };
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expand one µ-law byte to 16-bit PCM.
#[inline]
pub fn mulaw_decode_sample(encoded: u8) -> i16 {
    let byte = !encoded as i32;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as usize;
    let mantissa = byte & 0x0F;
    let magnitude = MULAW_DECODE_TABLE[exponent] + (mantissa << (exponent + 3));
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress a PCM buffer to µ-law.
pub fn mulaw_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| mulaw_encode_sample(s)).collect()
}

/// Expand a µ-law buffer to PCM.
pub fn mulaw_decode(encoded: &[u8]) -> Vec<i16> {
    encoded.iter().map(|&b| mulaw_decode_sample(b)).collect()
}

/// Downsample, compress and base64-encode one capture frame.
pub fn encode_capture_frame(frame: &[f32], source_rate: u32, target_rate: u32) -> CodecResult<String> {
    let pcm = downsample_buffer(frame, source_rate, target_rate)?;
    Ok(BASE64_STANDARD.encode(mulaw_encode(&pcm)))
}

/// Decode a base64 PCM16 little-endian payload to float samples in `[-1, 1]`.
///
/// An odd trailing byte is padded with zero to complete the last sample.
pub fn decode_pcm16_payload(payload: &str) -> CodecResult<Vec<f32>> {
    let mut bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode PCM16 samples as a base64 little-endian payload.
pub fn encode_pcm16_payload(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    BASE64_STANDARD.encode(bytes)
}
