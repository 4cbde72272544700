//! Sinks for the remote (assistant) audio stream.

use crate::error::Result;
use std::sync::{Arc, Mutex};

/// Consumes assistant audio as 16-bit PCM mono.
pub trait AudioOutput: Send {
    /// Queue samples for playback.
    fn play(&mut self, samples: &[i16]) -> Result<()>;

    /// Drop anything still queued.
    fn clear(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Discards remote audio.
#[derive(Debug, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&mut self, _samples: &[i16]) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Accumulates remote audio in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingOutput {
    samples: Arc<Mutex<Vec<i16>>>,
}

impl CollectingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything played since the last clear.
    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl AudioOutput for CollectingOutput {
    fn play(&mut self, samples: &[i16]) -> Result<()> {
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend_from_slice(samples);
        }
        Ok(())
    }

    fn clear(&mut self) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.clear();
        }
    }

    fn name(&self) -> &'static str {
        "collecting"
    }
}
