//! Sample-level helpers for microphone audio: energy, PCM16 encoding and
//! fixed-size framing.

use bytes::{BufMut, Bytes, BytesMut};

/// Default sample rate negotiated with the backend (mono).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
/// Default number of samples per VAD frame.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Full-scale multipliers for positive and negative samples.
pub const PCM16_POSITIVE_SCALE: f32 = 32767.0;
pub const PCM16_NEGATIVE_SCALE: f32 = 32768.0;

/// A fixed-length buffer of mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }
}

/// Root-mean-square energy of a buffer; `0.0` for an empty one.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|&x| x * x).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Converts one float sample to PCM16. The sample is clamped to [-1, 1] and
/// scaled by the positive or negative full-scale constant depending on sign.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * PCM16_NEGATIVE_SCALE) as i16
    } else {
        (s * PCM16_POSITIVE_SCALE) as i16
    }
}

/// Encodes f32 samples as little-endian PCM16 bytes, ready for a binary frame.
pub fn encode_pcm16(pcm32: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(pcm32.len() * 2);
    for &sample in pcm32 {
        buf.put_i16_le(sample_to_i16(sample));
    }
    buf.freeze()
}

/// Regroups an arbitrary stream of sample buffers into frames of exactly
/// `frame_size` samples.
#[derive(Debug)]
pub struct FrameChunker {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Buffers `samples` and returns every frame that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
