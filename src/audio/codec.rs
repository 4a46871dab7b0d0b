//! PCM16LE codec: float samples ⇄ wire bytes ⇄ base64.
//!
//! Both providers move audio as 16-bit little-endian mono PCM. Capture
//! and playback work in f32 (the native sample format of the audio
//! backend), so every frame passes through here once in each direction.

use base64::Engine;

/// A decoded chunk of mono audio ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (always 1 for provider audio).
    pub channels: u16,
}

impl AudioBuffer {
    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }
}

// ── Float ⇄ PCM16LE ──────────────────────────────────────────────

/// Convert f32 samples to PCM16LE bytes.
///
/// Samples are clamped, so a full-scale 1.0 maps to 32767 rather than
/// wrapping.
pub fn floats_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Convert PCM16LE bytes to an [`AudioBuffer`] at the given rate.
///
/// Empty input yields an empty buffer. A trailing odd byte is dropped.
pub fn pcm16_to_buffer(data: &[u8], sample_rate: u32) -> AudioBuffer {
    let samples = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    AudioBuffer {
        samples,
        sample_rate,
        channels: 1,
    }
}

// ── Base64 framing ───────────────────────────────────────────────

/// Base64-encode PCM bytes for embedding in a JSON message.
pub fn encode_base64(pcm_data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm_data)
}

/// Decode a base64 audio payload back to PCM bytes.
pub fn decode_base64(payload: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| anyhow::anyhow!("Invalid base64 audio payload: {e}"))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_positive_clamps() {
        let bytes = floats_to_pcm16(&[1.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
    }

    #[test]
    fn full_scale_negative_is_exact() {
        let bytes = floats_to_pcm16(&[-1.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), -32768);
    }

    #[test]
    fn silence_encodes_to_zero_bytes() {
        assert_eq!(floats_to_pcm16(&[0.0, 0.0]), vec![0, 0, 0, 0]);
    }

    #[test]
    fn reference_vector_encodes_exactly() {
        let bytes = floats_to_pcm16(&[0.0, 0.5, -0.5, 1.0, -1.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(values, vec![0, 16384, -16384, 32767, -32768]);
    }

    #[test]
    fn over_range_samples_clamp_instead_of_wrapping() {
        let bytes = floats_to_pcm16(&[2.5, -2.5]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32768);
    }

    #[test]
    fn decode_empty_input_gives_empty_buffer() {
        let buffer = pcm16_to_buffer(&[], 24000);
        assert!(buffer.samples.is_empty());
        assert_eq!(buffer.duration_secs(), 0.0);
    }

    #[test]
    fn decode_drops_trailing_odd_byte() {
        let buffer = pcm16_to_buffer(&[0, 0, 7], 24000);
        assert_eq!(buffer.samples.len(), 1);
    }

    #[test]
    fn pcm_roundtrip_within_quantization() {
        let original = vec![0.0, 0.25, -0.5, 0.99];
        let decoded = pcm16_to_buffer(&floats_to_pcm16(&original), 16000);
        for (a, b) in original.iter().zip(decoded.samples.iter()) {
            assert!((a - b).abs() < 1.0 / 32768.0 + f32::EPSILON, "{a} vs {b}");
        }
    }

    #[test]
    fn duration_accounts_for_rate() {
        let buffer = AudioBuffer {
            samples: vec![0.0; 24000],
            sample_rate: 24000,
            channels: 1,
        };
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn base64_roundtrip() {
        let pcm = vec![1u8, 2, 3, 4, 255];
        let encoded = encode_base64(&pcm);
        assert_eq!(decode_base64(&encoded).unwrap(), pcm);
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(decode_base64("not base64 !!!").is_err());
    }
}
