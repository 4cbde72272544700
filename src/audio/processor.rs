//! Exclusive microphone acquisition and the capture pump.

use crate::audio::constraints::CaptureConstraints;
use crate::audio::level::LevelMeter;
use crate::audio::recorder::{AudioSource, Microphone};
use crate::defaults;
use crate::error::{Result, VoiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Hands out at most one live microphone stream at a time.
pub struct AudioProcessor {
    microphone: Arc<dyn Microphone>,
    held: Arc<AtomicBool>,
    frame: Duration,
}

impl AudioProcessor {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            held: Arc::new(AtomicBool::new(false)),
            frame: Duration::from_millis(defaults::FRAME_MS),
        }
    }

    pub fn with_frame_duration(mut self, frame: Duration) -> Self {
        self.frame = frame;
        self
    }

    /// Whether a [`MediaHandle`] is currently outstanding.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Open and start the microphone.
    ///
    /// Fails with `DeviceBusy` while a previous handle has not been released.
    pub fn acquire_local_stream(&self, constraints: &CaptureConstraints) -> Result<MediaHandle> {
        constraints.validate()?;

        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VoiceError::DeviceBusy {
                device: self.microphone.name(),
            });
        }
        // Dropping the guard on any error below frees the slot again.
        let hold = HoldGuard(Arc::clone(&self.held));

        let mut source = self.microphone.open(constraints)?;
        source.start()?;

        tracing::debug!(
            device = %self.microphone.name(),
            sample_rate = constraints.sample_rate,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "Microphone acquired"
        );

        Ok(MediaHandle {
            capture: Capture::Idle(source),
            sink: Arc::new(Mutex::new(None)),
            meter: LevelMeter::new(),
            frame: self.frame,
            frame_samples: constraints.samples_per_frame(self.frame),
            hold: Some(hold),
        })
    }
}

struct HoldGuard(Arc<AtomicBool>);

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Capture {
    Idle(Box<dyn AudioSource>),
    Pumping {
        running: Arc<AtomicBool>,
        thread: JoinHandle<Box<dyn AudioSource>>,
    },
    Released,
}

type FrameSink = Arc<Mutex<Option<mpsc::Sender<Vec<i16>>>>>;

/// A started microphone stream.
///
/// Frames are pushed to whichever sender is attached; the device is
/// released by [`MediaHandle::release`] or on drop.
pub struct MediaHandle {
    capture: Capture,
    sink: FrameSink,
    meter: LevelMeter,
    frame: Duration,
    frame_samples: usize,
    hold: Option<HoldGuard>,
}

impl MediaHandle {
    /// Route captured frames to `frames`, starting the pump on first use.
    ///
    /// Re-attaching replaces the previous destination (used after a reconnect).
    pub fn attach(&mut self, frames: mpsc::Sender<Vec<i16>>) -> Result<()> {
        if let Ok(mut sink) = self.sink.lock() {
            *sink = Some(frames);
        }

        match std::mem::replace(&mut self.capture, Capture::Released) {
            Capture::Idle(source) => {
                let running = Arc::new(AtomicBool::new(true));
                let thread = spawn_pump(
                    source,
                    Arc::clone(&running),
                    Arc::clone(&self.sink),
                    self.meter.clone(),
                    self.frame,
                    self.frame_samples,
                )?;
                self.capture = Capture::Pumping { running, thread };
            }
            other => self.capture = other,
        }
        Ok(())
    }

    /// Stop forwarding frames without releasing the device.
    pub fn detach(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            *sink = None;
        }
    }

    /// RMS level of the most recent frame, 0.0..=1.0.
    pub fn level(&self) -> f32 {
        self.meter.level()
    }

    pub fn is_released(&self) -> bool {
        matches!(self.capture, Capture::Released)
    }

    /// Stop capture and free the device. Safe to call more than once.
    pub fn release(&mut self) {
        self.detach();
        let source = match std::mem::replace(&mut self.capture, Capture::Released) {
            Capture::Idle(source) => Some(source),
            Capture::Pumping { running, thread } => {
                running.store(false, Ordering::SeqCst);
                match thread.join() {
                    Ok(source) => Some(source),
                    Err(_) => {
                        tracing::error!("Capture thread panicked");
                        None
                    }
                }
            }
            Capture::Released => None,
        };

        if let Some(mut source) = source
            && let Err(e) = source.stop()
        {
            tracing::warn!(error = %e, "Failed to stop microphone");
        }
        self.meter.set(0.0);
        if self.hold.take().is_some() {
            tracing::debug!("Microphone released");
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn spawn_pump(
    mut source: Box<dyn AudioSource>,
    running: Arc<AtomicBool>,
    sink: FrameSink,
    meter: LevelMeter,
    frame: Duration,
    frame_samples: usize,
) -> Result<JoinHandle<Box<dyn AudioSource>>> {
    std::thread::Builder::new()
        .name("kiosk-voice-capture".to_string())
        .spawn(move || {
            let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);
            let mut read_failing = false;

            while running.load(Ordering::SeqCst) {
                match source.read_samples() {
                    Ok(samples) => {
                        read_failing = false;
                        pending.extend_from_slice(&samples);
                    }
                    Err(e) => {
                        if !read_failing {
                            tracing::warn!(error = %e, "Microphone read failed");
                        }
                        read_failing = true;
                    }
                }

                while pending.len() >= frame_samples {
                    let chunk: Vec<i16> = pending.drain(..frame_samples).collect();
                    meter.record(&chunk);
                    forward(&sink, chunk);
                }

                std::thread::sleep(frame);
            }
            source
        })
        .map_err(|e| VoiceError::Device {
            message: format!("Failed to start capture thread: {}", e),
        })
}

fn forward(sink: &FrameSink, chunk: Vec<i16>) {
    let Ok(guard) = sink.lock() else {
        return;
    };
    if let Some(tx) = guard.as_ref() {
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("Media queue full, frame dropped"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
