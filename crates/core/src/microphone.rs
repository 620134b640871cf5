//! Scoped microphone acquisition.
//!
//! Only one [`Microphone`] may exist at a time. The guard tears the capture
//! graph down in a fixed order whether it is stopped, dropped, or fails to
//! open.

use crate::{
    audio_utils::{AudioFrame, DEFAULT_FRAME_SIZE, DEFAULT_SAMPLE_RATE},
    error::DeviceError,
    vad::VadConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static MICROPHONE_IN_USE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Samples per delivered frame.
    pub frame_size: usize,
    /// Frames buffered between the device callback and the consumer.
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            channel_capacity: 32,
        }
    }
}

impl From<&VadConfig> for CaptureConfig {
    fn from(vad: &VadConfig) -> Self {
        Self {
            sample_rate: vad.sample_rate,
            frame_size: vad.frame_size,
            ..Self::default()
        }
    }
}

/// The parts of a capture graph, in teardown order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStage {
    /// The node that slices audio into frames.
    Processor,
    /// The node reading from the device.
    Source,
    /// The device tracks themselves.
    Tracks,
    Context,
}

impl ReleaseStage {
    pub const ORDER: [ReleaseStage; 4] = [
        ReleaseStage::Processor,
        ReleaseStage::Source,
        ReleaseStage::Tracks,
        ReleaseStage::Context,
    ];
}

/// A platform audio capture backend.
pub trait AudioInput {
    /// Starts capturing, delivering fixed-size mono frames into `frames`.
    fn open(
        &mut self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<(), DeviceError>;

    /// Releases one stage of the graph. Called for every stage even if
    /// `open` failed part-way, so it must tolerate stages that never started.
    fn release(&mut self, stage: ReleaseStage);
}

/// Exclusive handle on the microphone.
pub struct Microphone {
    input: Box<dyn AudioInput>,
}

impl Microphone {
    /// Opens `input` and returns the guard with the receiving end of its
    /// frame channel.
    pub fn acquire(
        input: Box<dyn AudioInput>,
        config: &CaptureConfig,
    ) -> Result<(Self, mpsc::Receiver<AudioFrame>), DeviceError> {
        if MICROPHONE_IN_USE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::Busy);
        }

        let (frames_tx, frames_rx) = mpsc::channel(config.channel_capacity.max(1));
        let mut microphone = Self { input };
        match microphone.input.open(config, frames_tx) {
            Ok(()) => {
                info!(
                    sample_rate = config.sample_rate,
                    frame_size = config.frame_size,
                    "Microphone acquired"
                );
                Ok((microphone, frames_rx))
            }
            Err(e) => {
                warn!(error = %e, "Failed to open microphone");
                // Dropping the guard releases whatever was opened.
                Err(e)
            }
        }
    }

    pub fn is_in_use() -> bool {
        MICROPHONE_IN_USE.load(Ordering::Acquire)
    }

    pub fn stop(self) {
        info!("Microphone stopped");
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        for stage in ReleaseStage::ORDER {
            debug!(?stage, "Releasing capture stage");
            self.input.release(stage);
        }
        MICROPHONE_IN_USE.store(false, Ordering::Release);
    }
}
