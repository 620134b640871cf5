//! Energy-based voice activity detection over fixed-size microphone frames.
//!
//! Every frame is forwarded as PCM16 regardless of the decision; the detector
//! only reports when the user starts and stops talking. Starting requires
//! `min_confirmed_frames` loud frames, stopping requires `silence_duration`
//! without renewed speech.

use crate::audio_utils::{self, AudioFrame, DEFAULT_FRAME_SIZE, DEFAULT_SAMPLE_RATE};
use bytes::Bytes;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// RMS level a frame must exceed to count as speech.
    pub threshold: f32,
    pub min_confirmed_frames: u32,
    pub silence_duration: Duration,
    pub frame_size: usize,
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            min_confirmed_frames: 3,
            silence_duration: Duration::from_millis(800),
            frame_size: DEFAULT_FRAME_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// Receives the detector's output.
pub trait VoiceActivityHandler {
    /// Called for every frame, encoded as little-endian PCM16.
    fn on_chunk(&mut self, chunk: Bytes);
    fn on_speech_start(&mut self);
    fn on_speech_end(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceActivityState {
    pub speaking: bool,
    pub confirmed_frames: u32,
    pub silence_timer_armed: bool,
}

#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speaking: bool,
    confirmed_frames: u32,
    silence_deadline: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speaking: false,
            confirmed_frames: 0,
            silence_deadline: None,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn state(&self) -> VoiceActivityState {
        VoiceActivityState {
            speaking: self.speaking,
            confirmed_frames: self.confirmed_frames,
            silence_timer_armed: self.silence_deadline.is_some(),
        }
    }

    /// When the armed silence timer fires, if any.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Processes one frame observed at `now` and returns its RMS level.
    pub fn process_frame(
        &mut self,
        samples: &[f32],
        now: Instant,
        handler: &mut impl VoiceActivityHandler,
    ) -> f32 {
        // A timer that expired before this frame arrived has already fired.
        self.poll_silence(now, handler);

        let level = audio_utils::rms(samples);
        handler.on_chunk(audio_utils::encode_pcm16(samples));

        if level > self.config.threshold {
            self.confirmed_frames = self.confirmed_frames.saturating_add(1);
            if self.confirmed_frames >= self.config.min_confirmed_frames {
                self.silence_deadline = None;
                if !self.speaking {
                    self.speaking = true;
                    debug!(level, "Speech started");
                    handler.on_speech_start();
                }
            }
        } else {
            self.confirmed_frames = self.confirmed_frames.saturating_sub(1);
            if self.speaking && self.silence_deadline.is_none() {
                self.silence_deadline = Some(now + self.config.silence_duration);
            }
        }
        level
    }

    /// Fires the silence timer if it is armed and due. Returns whether speech
    /// ended.
    pub fn poll_silence(&mut self, now: Instant, handler: &mut impl VoiceActivityHandler) -> bool {
        match self.silence_deadline {
            Some(deadline) if now >= deadline => {
                self.silence_deadline = None;
                self.speaking = false;
                self.confirmed_frames = 0;
                debug!("Speech ended");
                handler.on_speech_end();
                true
            }
            _ => false,
        }
    }

    /// Disarms the silence timer and forgets all accumulated evidence.
    pub fn stop(&mut self) {
        self.silence_deadline = None;
        self.confirmed_frames = 0;
        self.speaking = false;
    }
}

/// Feeds frames from `frames` through `detector` until the channel closes,
/// firing the silence timer on time even when no frames arrive.
#[instrument(skip_all, fields(threshold = detector.config().threshold))]
pub async fn run_detector<H: VoiceActivityHandler>(
    mut detector: VoiceActivityDetector,
    mut frames: mpsc::Receiver<AudioFrame>,
    mut handler: H,
) -> H {
    loop {
        let deadline = detector.silence_deadline();
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    detector.process_frame(&frame.samples, Instant::now(), &mut handler);
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                detector.poll_silence(Instant::now(), &mut handler);
            }
        }
    }
    detector.stop();
    debug!("Frame source closed, detector stopped");
    handler
}
