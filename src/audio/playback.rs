//! Speaker playback of assistant audio through CPAL.

use crate::audio::capture::{SendableStream, with_suppressed_stderr};
use crate::audio::output::AudioOutput;
use crate::audio::wav::resample;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Plays queued PCM16 mono through the default output device.
pub struct CpalPlayback {
    stream: SendableStream,
    queue: Arc<Mutex<VecDeque<i16>>>,
    source_rate: u32,
    device_rate: u32,
    device_channels: usize,
}

impl CpalPlayback {
    /// Open the default output device for audio arriving at `source_rate`.
    pub fn new(source_rate: u32) -> Result<Self> {
        let device = with_suppressed_stderr(|| cpal::default_host().default_output_device())
            .ok_or_else(|| VoiceError::Device {
                message: "no output device available".to_string(),
            })?;

        let default_config = device
            .default_output_config()
            .map_err(|e| VoiceError::Device {
                message: format!("Failed to query default output config: {}", e),
            })?;
        let device_rate = default_config.sample_rate().0;
        let device_channels = default_config.channels() as usize;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        let queue = Arc::new(Mutex::new(VecDeque::<i16>::new()));
        let err_callback = |err| {
            tracing::warn!(error = %err, "Audio output stream error");
        };

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        let mut queue = queue.lock().ok();
                        for sample in data.iter_mut() {
                            *sample = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0);
                        }
                    },
                    err_callback,
                    None,
                )
            }
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = queue.lock().ok();
                        for sample in data.iter_mut() {
                            let value = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0);
                            *sample = value as f32 / i16::MAX as f32;
                        }
                    },
                    err_callback,
                    None,
                )
            }
            fmt => {
                return Err(VoiceError::Device {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| VoiceError::Device {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| VoiceError::Device {
            message: format!("Failed to start output stream: {}", e),
        })?;

        Ok(Self {
            stream: SendableStream(stream),
            queue,
            source_rate,
            device_rate,
            device_channels,
        })
    }
}

impl AudioOutput for CpalPlayback {
    fn play(&mut self, samples: &[i16]) -> Result<()> {
        let converted = resample(samples, self.source_rate, self.device_rate);
        let mut queue = self.queue.lock().map_err(|e| VoiceError::Device {
            message: format!("Failed to lock playback queue: {}", e),
        })?;
        for sample in converted {
            for _ in 0..self.device_channels {
                queue.push_back(sample);
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn name(&self) -> &'static str {
        "speaker"
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if let Err(e) = self.stream.0.pause() {
            tracing::debug!(error = %e, "Failed to pause output stream");
        }
    }
}
