//! WAV file audio source, used as a stand-in microphone for scripted runs.

use crate::audio::constraints::CaptureConstraints;
use crate::audio::recorder::{AudioSource, Microphone};
use crate::error::{Result, VoiceError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

/// Audio source that replays WAV file data in real-time sized chunks.
/// Supports arbitrary sample rates and channels, converting to mono at the
/// requested rate. Once the file is exhausted it yields nothing.
pub struct WavAudioSource {
    samples: Vec<i16>,
    position: usize,
    chunk_size: usize,
}

impl WavAudioSource {
    /// Create from any reader, converting to `target_rate` mono.
    pub fn from_reader(reader: Box<dyn Read + Send>, target_rate: u32) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader).map_err(|e| VoiceError::Device {
            message: format!("Failed to parse WAV file: {}", e),
        })?;

        let spec = wav_reader.spec();
        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VoiceError::Device {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let mono = downmix(&raw_samples, spec.channels as usize);
        let samples = resample(&mono, spec.sample_rate, target_rate);

        Ok(Self {
            samples,
            position: 0,
            // 100ms chunks
            chunk_size: (target_rate / 10).max(1) as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl AudioSource for WavAudioSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.position >= self.samples.len() {
            return Ok(Vec::new());
        }

        let end = std::cmp::min(self.position + self.chunk_size, self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;

        Ok(chunk)
    }
}

/// Microphone backed by a WAV file, reopened for every acquisition.
pub struct WavMicrophone {
    path: PathBuf,
}

impl WavMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Microphone for WavMicrophone {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn AudioSource>> {
        let file = File::open(&self.path).map_err(|e| VoiceError::Device {
            message: format!("Failed to open {}: {}", self.path.display(), e),
        })?;
        let source =
            WavAudioSource::from_reader(Box::new(BufReader::new(file)), constraints.sample_rate)?;
        Ok(Box::new(source))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Mix interleaved multi-channel audio to mono by averaging.
pub(crate) fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}
