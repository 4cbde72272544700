use crate::audio::constraints::CaptureConstraints;
use crate::error::{Result, VoiceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait AudioSource: Send + Sync {
    /// Start capturing audio from the source.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing audio from the source.
    fn stop(&mut self) -> Result<()>;

    /// Drain the samples captured since the last call.
    ///
    /// Returns 16-bit PCM mono at the rate the source was opened with.
    fn read_samples(&mut self) -> Result<Vec<i16>>;
}

/// A capture device that can be opened under constraints.
pub trait Microphone: Send + Sync {
    /// Open the device. The returned source is not yet started.
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn AudioSource>>;

    /// Human-readable device name for logs and errors.
    fn name(&self) -> String;
}

/// Shared counters for mock microphones.
#[derive(Debug, Default)]
pub struct MicrophoneStats {
    opened: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl MicrophoneStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sources currently started and not yet stopped or dropped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active sources ever observed.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn started(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn stopped(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock audio source for testing
#[derive(Debug)]
pub struct MockAudioSource {
    is_started: bool,
    samples: Vec<i16>,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
    stats: Option<Arc<MicrophoneStats>>,
}

impl MockAudioSource {
    /// Create a new mock audio source with default settings
    pub fn new() -> Self {
        Self {
            is_started: false,
            samples: vec![0i16; 960],
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
            stats: None,
        }
    }

    /// Configure the mock to return specific samples
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    fn with_stats(mut self, stats: Arc<MicrophoneStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Check if the audio source is started
    pub fn is_started(&self) -> bool {
        self.is_started
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(VoiceError::Device {
                message: self.error_message.clone(),
            });
        }
        if !self.is_started {
            self.is_started = true;
            if let Some(stats) = &self.stats {
                stats.started();
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.is_started {
            self.is_started = false;
            if let Some(stats) = &self.stats {
                stats.stopped();
            }
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            Err(VoiceError::Device {
                message: self.error_message.clone(),
            })
        } else {
            Ok(self.samples.clone())
        }
    }
}

impl Drop for MockAudioSource {
    fn drop(&mut self) {
        if self.is_started
            && let Some(stats) = &self.stats
        {
            stats.stopped();
        }
    }
}

/// Mock microphone handing out [`MockAudioSource`]s.
pub struct MockMicrophone {
    samples: Vec<i16>,
    open_failure: Option<String>,
    start_failure: Option<String>,
    stats: Arc<MicrophoneStats>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self {
            samples: vec![0i16; 960],
            open_failure: None,
            start_failure: None,
            stats: Arc::new(MicrophoneStats::default()),
        }
    }

    /// Samples returned by every read of every opened source.
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Simulate permission denial or a missing device.
    pub fn with_open_failure(mut self, message: &str) -> Self {
        self.open_failure = Some(message.to_string());
        self
    }

    /// Simulate a device that opens but cannot start.
    pub fn with_start_failure(mut self, message: &str) -> Self {
        self.start_failure = Some(message.to_string());
        self
    }

    pub fn stats(&self) -> Arc<MicrophoneStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone for MockMicrophone {
    fn open(&self, _constraints: &CaptureConstraints) -> Result<Box<dyn AudioSource>> {
        if let Some(message) = &self.open_failure {
            return Err(VoiceError::Device {
                message: message.clone(),
            });
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);

        let mut source = MockAudioSource::new()
            .with_samples(self.samples.clone())
            .with_stats(Arc::clone(&self.stats));
        if let Some(message) = &self.start_failure {
            source = source.with_start_failure().with_error_message(message);
        }
        Ok(Box::new(source))
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
