use crate::events::transcript::TranscriptFragment;
use crate::transport::state::ConnectionState;
use serde::Serialize;

/// What the kiosk UI shows about the conversation audio.
///
/// Always derived, never stored as a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioState {
    pub is_listening: bool,
    pub is_playing: bool,
    pub volume: f32,
    pub transcript: String,
    pub is_final: bool,
}

impl AudioState {
    pub fn project(
        state: ConnectionState,
        latest: Option<&TranscriptFragment>,
        volume: f32,
    ) -> Self {
        let active = state.is_active();
        Self {
            is_listening: state == ConnectionState::Listening,
            is_playing: state == ConnectionState::Speaking,
            volume: if active { volume.clamp(0.0, 1.0) } else { 0.0 },
            transcript: latest.map(|f| f.text.clone()).unwrap_or_default(),
            is_final: latest.is_some_and(|f| f.is_final),
        }
    }

    /// Equal apart from volume jitter below `epsilon`.
    pub fn roughly_equals(&self, other: &AudioState, epsilon: f32) -> bool {
        self.is_listening == other.is_listening
            && self.is_playing == other.is_playing
            && self.is_final == other.is_final
            && self.transcript == other.transcript
            && (self.volume - other.volume).abs() < epsilon
    }
}
