//! Microphone acquisition and remote audio playback.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod constraints;
pub mod level;
pub mod output;
#[cfg(feature = "cpal-audio")]
pub mod playback;
pub mod processor;
pub mod recorder;
pub mod state;
pub mod wav;

pub use constraints::CaptureConstraints;
pub use output::{AudioOutput, CollectingOutput, NullOutput};
pub use processor::{AudioProcessor, MediaHandle};
pub use recorder::{AudioSource, Microphone, MicrophoneStats, MockAudioSource, MockMicrophone};
pub use state::AudioState;
