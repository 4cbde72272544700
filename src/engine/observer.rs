//! Caller-facing callbacks of a voice session.

use crate::audio::state::AudioState;
use crate::error::VoiceError;
use crate::events::transcript::TranscriptEntry;
use crate::tools::call::FunctionCallRequest;
use crate::transport::peer::EventChannel;
use crate::transport::state::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    ConversationComplete,
    Replaced,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: EndReason,
    pub function_calls: usize,
    pub transcript: Vec<TranscriptEntry>,
}

/// Receives session notifications.
///
/// All methods run on the engine task, one at a time. Implementations must
/// return quickly.
pub trait SessionObserver: Send {
    fn on_status_change(&mut self, _state: ConnectionState) {}

    fn on_transcript_update(&mut self, _text: &str, _is_final: bool) {}

    fn on_audio_state_change(&mut self, _state: &AudioState) {}

    fn on_error(&mut self, _error: &VoiceError) {}

    /// The call is already being dispatched; the channel is informational.
    fn on_function_call(&mut self, _request: &FunctionCallRequest, _channel: &EventChannel) {}

    fn on_session_created(&mut self, _session_id: &str) {}

    /// The closing phrase was heard. Called at most once per session.
    fn on_conversation_complete(&mut self) {}

    fn on_session_ended(&mut self, _summary: &SessionSummary) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Status(ConnectionState),
    Transcript { text: String, is_final: bool },
    Audio(AudioState),
    Error(String),
    FunctionCall { call_id: String, tool_name: String },
    SessionCreated(String),
    ConversationComplete,
    SessionEnded(SessionSummary),
}

/// Records every notification; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    log: Arc<Mutex<Vec<Observed>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Observed> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<ConnectionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Status(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Observed) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    fn push(&self, event: Observed) {
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }
}

impl SessionObserver for RecordingObserver {
    fn on_status_change(&mut self, state: ConnectionState) {
        self.push(Observed::Status(state));
    }

    fn on_transcript_update(&mut self, text: &str, is_final: bool) {
        self.push(Observed::Transcript {
            text: text.to_string(),
            is_final,
        });
    }

    fn on_audio_state_change(&mut self, state: &AudioState) {
        self.push(Observed::Audio(state.clone()));
    }

    fn on_error(&mut self, error: &VoiceError) {
        self.push(Observed::Error(error.to_string()));
    }

    fn on_function_call(&mut self, request: &FunctionCallRequest, _channel: &EventChannel) {
        self.push(Observed::FunctionCall {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
        });
    }

    fn on_session_created(&mut self, session_id: &str) {
        self.push(Observed::SessionCreated(session_id.to_string()));
    }

    fn on_conversation_complete(&mut self) {
        self.push(Observed::ConversationComplete);
    }

    fn on_session_ended(&mut self, summary: &SessionSummary) {
        self.push(Observed::SessionEnded(summary.clone()));
    }
}
