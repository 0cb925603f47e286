//! Sample conversion between the engine's f32 samples and the 16-bit PCM wire format.
//!
//! Outbound audio is clamped to [-1.0, 1.0] before quantization so loud input
//! saturates instead of wrapping around. Inbound payloads carry no rate of their
//! own; the sample rate and channel count come from the message envelope.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Bytes per wire sample (16-bit signed little-endian).
pub const SAMPLE_WIDTH: usize = 2;

/// Default rate of inbound audio when the envelope does not say otherwise.
pub const DEFAULT_INBOUND_RATE: u32 = 24_000;

/// A decoded, playable buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to a single one.
    pub fn into_mono(self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples;
        }
        let channels = self.channels as usize;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Quantize f32 samples to 16-bit signed little-endian PCM.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    out
}

fn quantize(sample: f32) -> i16 {
    // NaN has no meaningful level; treat it as silence.
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Reconstruct f32 samples from a PCM payload.
///
/// The payload length must be a whole number of frames for `channels`.
pub fn decode(payload: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<DecodedAudio> {
    if sample_rate == 0 {
        return Err(VoiceError::Codec("Sample rate must be non-zero".to_string()));
    }
    if channels == 0 {
        return Err(VoiceError::Codec("Channel count must be non-zero".to_string()));
    }
    let frame_width = SAMPLE_WIDTH * channels as usize;
    if payload.len() % frame_width != 0 {
        return Err(VoiceError::Codec(format!(
            "Payload of {} bytes is not a multiple of the {}-byte frame width",
            payload.len(),
            frame_width
        )));
    }

    let samples = payload
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode a base64 payload and then its PCM samples.
pub fn decode_base64(data: &str, sample_rate: u32, channels: u16) -> VoiceResult<DecodedAudio> {
    let bytes = STANDARD.decode(data)?;
    decode(&bytes, sample_rate, channels)
}

pub fn encode_base64(pcm: &[u8]) -> String {
    STANDARD.encode(pcm)
}

/// Linear-interpolation resample of mono samples.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

/// Mime type announced for outbound PCM, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM mime type.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}
