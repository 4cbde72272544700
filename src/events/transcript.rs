//! Transcript assembly and per-session conversation log.

use crate::events::protocol::{RealtimeEvent, Speaker};
use crate::events::router::EventSubscriber;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Latest visible transcript text for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub turn_number: u32,
}

/// Open turn of one speaker.
#[derive(Debug, Default)]
struct OpenTurn {
    buffer: String,
    turn: u32,
}

/// Accumulates deltas into the text of each speaker's current turn.
///
/// User and assistant turns are buffered separately, so interleaved deltas
/// never truncate each other. A final fragment closes the speaker's turn.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    user: Option<OpenTurn>,
    assistant: Option<OpenTurn>,
    turns: u32,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &RealtimeEvent) -> Option<TranscriptFragment> {
        let (speaker, text, is_final) = match event {
            RealtimeEvent::TranscriptDelta { speaker, text } => (*speaker, text, false),
            RealtimeEvent::TranscriptFinal { speaker, text } => (*speaker, text, true),
            _ => return None,
        };

        let turns = &mut self.turns;
        let slot = match speaker {
            Speaker::User => &mut self.user,
            Speaker::Assistant => &mut self.assistant,
        };
        let open = slot.get_or_insert_with(|| {
            *turns += 1;
            OpenTurn {
                buffer: String::new(),
                turn: *turns,
            }
        });

        if is_final {
            if !text.is_empty() {
                open.buffer = text.clone();
            }
        } else {
            open.buffer.push_str(text);
        }
        let fragment = TranscriptFragment {
            speaker,
            text: open.buffer.clone(),
            is_final,
            turn_number: open.turn,
        };
        if is_final {
            *slot = None;
        }
        Some(fragment)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Read side of a [`TranscriptLog`].
#[derive(Debug, Clone, Default)]
pub struct TranscriptHandle {
    entries: Arc<Mutex<Vec<TranscriptEntry>>>,
}

impl TranscriptHandle {
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records finalized utterances of one session.
pub struct TranscriptLog {
    entries: Arc<Mutex<Vec<TranscriptEntry>>>,
}

impl TranscriptLog {
    pub fn new() -> (Self, TranscriptHandle) {
        let entries = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                entries: Arc::clone(&entries),
            },
            TranscriptHandle { entries },
        )
    }
}

impl EventSubscriber for TranscriptLog {
    fn on_event(&mut self, event: &RealtimeEvent) {
        let RealtimeEvent::TranscriptFinal { speaker, text } = event else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(TranscriptEntry {
                speaker: *speaker,
                text: text.trim().to_string(),
                at: Utc::now(),
            });
        }
    }

    fn name(&self) -> &'static str {
        "transcript-log"
    }
}
