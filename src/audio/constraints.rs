use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use std::time::Duration;

/// Requested microphone characteristics.
///
/// Echo cancellation, noise suppression and gain control are requests the
/// device may not honor. Captured audio is always delivered as mono PCM16
/// at `sample_rate`; `channel_count` is what the device is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub latency: Option<Duration>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::from_config(&AudioConfig::default())
    }
}

impl CaptureConstraints {
    pub fn from_config(audio: &AudioConfig) -> Self {
        Self {
            device: audio.device.clone(),
            sample_rate: audio.sample_rate,
            channel_count: audio.channel_count,
            echo_cancellation: audio.echo_cancellation,
            noise_suppression: audio.noise_suppression,
            auto_gain_control: audio.auto_gain_control,
            latency: audio.latency_ms.map(|ms| Duration::from_millis(ms as u64)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::Device {
                message: "sample rate must be positive".to_string(),
            });
        }
        if self.channel_count == 0 {
            return Err(VoiceError::Device {
                message: "channel count must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Mono samples in one frame of `frame` duration at the requested rate.
    pub fn samples_per_frame(&self, frame: Duration) -> usize {
        ((self.sample_rate as u128 * frame.as_millis()) / 1000).max(1) as usize
    }

    /// Device buffer size in frames for the requested latency, if any.
    pub fn buffer_frames(&self) -> Option<u32> {
        self.latency
            .map(|latency| ((self.sample_rate as u128 * latency.as_micros()) / 1_000_000) as u32)
            .filter(|frames| *frames > 0)
    }
}
