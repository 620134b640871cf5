//! Microphone capture through `cpal`, resampled to the negotiated rate.
//!
//! Built only with the `cpal` feature; without it [`open_microphone`] reports
//! the microphone as unavailable.

use tokio::sync::mpsc;
use tutor_core::{
    audio_utils::AudioFrame,
    error::DeviceError,
    microphone::{CaptureConfig, Microphone},
};

/// Acquires the default input device.
pub fn open_microphone(
    config: &CaptureConfig,
) -> Result<(Microphone, mpsc::Receiver<AudioFrame>), DeviceError> {
    #[cfg(feature = "cpal")]
    {
        Microphone::acquire(Box::new(device::CpalInput::default()), config)
    }
    #[cfg(not(feature = "cpal"))]
    {
        let _ = config;
        Err(DeviceError::Unavailable(
            "this build has no microphone support (enable the `cpal` feature)".to_string(),
        ))
    }
}

#[cfg(feature = "cpal")]
mod device {
    use super::*;
    use cpal::{
        FromSample, Sample, SampleFormat, SizedSample,
        traits::{DeviceTrait, HostTrait, StreamTrait},
    };
    use rubato::{FastFixedIn, PolynomialDegree, Resampler};
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use tracing::{debug, info, warn};
    use tutor_core::{audio_utils::FrameChunker, microphone::{AudioInput, ReleaseStage}};

    /// Creates a resampler to convert between audio sample rates.
    pub fn create_resampler(
        in_sampling_rate: f64,
        out_sampling_rate: f64,
        chunk_size: usize,
    ) -> Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
        FastFixedIn::<f32>::new(
            out_sampling_rate / in_sampling_rate,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
    }

    /// Turns device callbacks into fixed-size mono frames at the target rate.
    pub struct FramePipeline {
        channels: usize,
        resampler: Option<(FastFixedIn<f32>, Vec<f32>)>,
        chunker: FrameChunker,
        sample_rate: u32,
    }

    impl FramePipeline {
        pub fn new(
            device_rate: u32,
            channels: usize,
            config: &CaptureConfig,
        ) -> Result<Self, DeviceError> {
            let resampler = if device_rate == config.sample_rate {
                None
            } else {
                let resampler = create_resampler(
                    device_rate as f64,
                    config.sample_rate as f64,
                    1024,
                )
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
                Some((resampler, Vec::new()))
            };
            Ok(Self {
                channels: channels.max(1),
                resampler,
                chunker: FrameChunker::new(config.frame_size),
                sample_rate: config.sample_rate,
            })
        }

        /// Feeds interleaved device samples and returns completed frames.
        pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
            let mono: Vec<f32> = interleaved
                .chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect();

            let samples = match &mut self.resampler {
                None => mono,
                Some((resampler, pending)) => {
                    pending.extend_from_slice(&mono);
                    let mut resampled = Vec::new();
                    loop {
                        let needed = resampler.input_frames_next();
                        if pending.len() < needed {
                            break;
                        }
                        let chunk: Vec<f32> = pending.drain(..needed).collect();
                        match resampler.process(&[chunk], None) {
                            Ok(out) => resampled.extend_from_slice(&out[0]),
                            Err(e) => warn!(error = %e, "Resampling failed, dropping audio"),
                        }
                    }
                    resampled
                }
            };

            self.chunker
                .push(&samples)
                .into_iter()
                .map(|frame| AudioFrame::new(frame, self.sample_rate))
                .collect()
        }
    }

    fn map_error(e: impl std::fmt::Display) -> DeviceError {
        let message = e.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("permission") || lowered.contains("denied") {
            DeviceError::PermissionDenied
        } else {
            DeviceError::Unavailable(message)
        }
    }

    /// The default input device of the default host.
    #[derive(Default)]
    pub struct CpalInput {
        device: Option<cpal::Device>,
        stream: Option<cpal::Stream>,
        forwarding: Arc<AtomicBool>,
    }

    impl CpalInput {
        fn build_stream<T>(
            &self,
            device: &cpal::Device,
            stream_config: &cpal::StreamConfig,
            mut pipeline: FramePipeline,
            frames: mpsc::Sender<AudioFrame>,
        ) -> Result<cpal::Stream, DeviceError>
        where
            T: SizedSample,
            f32: FromSample<T>,
        {
            let forwarding = self.forwarding.clone();
            device
                .build_input_stream(
                    stream_config,
                    move |data: &[T], _: &cpal::InputCallbackInfo| {
                        if !forwarding.load(Ordering::Acquire) {
                            return;
                        }
                        let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                        for frame in pipeline.push(&samples) {
                            if frames.try_send(frame).is_err() {
                                debug!("Frame consumer is behind, dropping a frame");
                            }
                        }
                    },
                    |e| warn!(error = %e, "Microphone stream error"),
                    None,
                )
                .map_err(map_error)
        }
    }

    impl AudioInput for CpalInput {
        fn open(
            &mut self,
            config: &CaptureConfig,
            frames: mpsc::Sender<AudioFrame>,
        ) -> Result<(), DeviceError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| DeviceError::Unavailable("no input device found".to_string()))?;
            let supported = device.default_input_config().map_err(map_error)?;
            let sample_format = supported.sample_format();
            let stream_config = supported.config();

            let pipeline = FramePipeline::new(
                stream_config.sample_rate.0,
                stream_config.channels as usize,
                config,
            )?;
            self.forwarding.store(true, Ordering::Release);
            let stream = match sample_format {
                SampleFormat::F32 => {
                    self.build_stream::<f32>(&device, &stream_config, pipeline, frames)?
                }
                SampleFormat::I16 => {
                    self.build_stream::<i16>(&device, &stream_config, pipeline, frames)?
                }
                SampleFormat::U16 => {
                    self.build_stream::<u16>(&device, &stream_config, pipeline, frames)?
                }
                other => {
                    return Err(DeviceError::Unavailable(format!(
                        "unsupported sample format {other:?}"
                    )));
                }
            };
            stream.play().map_err(map_error)?;

            info!(
                device_rate = stream_config.sample_rate.0,
                channels = stream_config.channels,
                target_rate = config.sample_rate,
                "Capturing from default input device"
            );
            self.device = Some(device);
            self.stream = Some(stream);
            Ok(())
        }

        fn release(&mut self, stage: ReleaseStage) {
            match stage {
                ReleaseStage::Processor => self.forwarding.store(false, Ordering::Release),
                ReleaseStage::Source => {
                    if let Some(stream) = &self.stream {
                        if let Err(e) = stream.pause() {
                            debug!(error = %e, "Could not pause input stream");
                        }
                    }
                }
                ReleaseStage::Tracks => self.stream = None,
                ReleaseStage::Context => self.device = None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_create_resampler() {
            assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
            assert!(create_resampler(16000.0, 16000.0, 1024).is_ok());
        }

        #[test]
        fn test_pipeline_downmixes_and_frames() {
            let config = CaptureConfig {
                sample_rate: 16_000,
                frame_size: 4,
                channel_capacity: 8,
            };
            let mut pipeline = FramePipeline::new(16_000, 2, &config).unwrap();

            let frames = pipeline.push(&[0.2, 0.4, 1.0, 0.0, -0.5, -0.5, 0.0, 0.0, 0.1, 0.1]);

            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].samples.len(), 4);
            assert!((frames[0].samples[0] - 0.3).abs() < 1e-6);
            assert!((frames[0].samples[1] - 0.5).abs() < 1e-6);
            assert_eq!(frames[0].sample_rate, 16_000);
        }

        #[test]
        fn test_pipeline_resamples_to_target_rate() {
            let config = CaptureConfig {
                sample_rate: 16_000,
                frame_size: 160,
                channel_capacity: 8,
            };
            let mut pipeline = FramePipeline::new(48_000, 1, &config).unwrap();

            let mut frames = Vec::new();
            for _ in 0..10 {
                frames.extend(pipeline.push(&[0.0; 4800]));
            }

            // One second at 48 kHz is roughly one second at 16 kHz.
            let produced: usize = frames.iter().map(|f| f.samples.len()).sum();
            assert!(produced >= 14_000 && produced <= 16_000, "produced {produced}");
        }
    }
}
