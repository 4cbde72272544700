//! Terminal rendering of session notifications for `kiosk-voice run`.

use crate::audio::state::AudioState;
use crate::engine::observer::{EndReason, SessionObserver, SessionSummary};
use crate::error::VoiceError;
use crate::events::protocol::Speaker;
use crate::tools::call::FunctionCallRequest;
use crate::transport::peer::EventChannel;
use crate::transport::state::ConnectionState;
use std::io::{self, Write};

const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

const BAR_WIDTH: usize = 20;

/// Clear the current terminal line (replaces the level bar)
pub fn clear_line() {
    eprint!("\r\x1b[2K");
}

/// Render an input level in `[0, 1]` as a fixed-width bar.
pub fn format_level_bar(level: f32) -> String {
    let level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
    let filled = (level * BAR_WIDTH as f32).round() as usize;
    let color = if level > 0.8 {
        RED
    } else if level > 0.5 {
        YELLOW
    } else {
        GREEN
    };
    format!(
        "{color}{}{RESET}{DIM}{}{RESET}",
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled)
    )
}

pub fn format_status(state: ConnectionState) -> String {
    let color = match state {
        ConnectionState::Error => RED,
        ConnectionState::Reconnecting | ConnectionState::Connecting => YELLOW,
        ConnectionState::Listening | ConnectionState::Speaking | ConnectionState::Connected => {
            GREEN
        }
        ConnectionState::Idle | ConnectionState::Closed => DIM,
    };
    format!("{color}● {}{RESET}", state)
}

pub fn format_end_reason(reason: &EndReason) -> String {
    match reason {
        EndReason::Stopped => "stopped".to_string(),
        EndReason::ConversationComplete => "conversation complete".to_string(),
        EndReason::Replaced => "replaced by a new session".to_string(),
        EndReason::Failed(message) => format!("failed: {message}"),
    }
}

/// Observer printing session progress to stderr.
#[derive(Debug, Default)]
pub struct TerminalObserver {
    /// Show the live level bar and partial transcripts.
    verbose: bool,
    /// A level bar or partial line is on screen.
    line_dirty: bool,
}

impl TerminalObserver {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            line_dirty: false,
        }
    }

    fn println(&mut self, line: &str) {
        if self.line_dirty {
            clear_line();
            self.line_dirty = false;
        }
        eprintln!("{line}");
    }

    fn overwrite(&mut self, line: &str) {
        eprint!("\r\x1b[2K{line}");
        io::stderr().flush().ok();
        self.line_dirty = true;
    }
}

impl SessionObserver for TerminalObserver {
    fn on_status_change(&mut self, state: ConnectionState) {
        self.println(&format_status(state));
    }

    fn on_transcript_update(&mut self, text: &str, is_final: bool) {
        if is_final {
            self.println(text);
        } else if self.verbose {
            self.overwrite(&format!("{DIM}{text}{RESET}"));
        }
    }

    fn on_audio_state_change(&mut self, state: &AudioState) {
        if !self.verbose || !state.is_listening {
            return;
        }
        self.overwrite(&format_level_bar(state.volume));
    }

    fn on_error(&mut self, error: &VoiceError) {
        self.println(&format!("{RED}error:{RESET} {error}"));
    }

    fn on_function_call(&mut self, request: &FunctionCallRequest, _channel: &EventChannel) {
        self.println(&format!(
            "{CYAN}→ {}{RESET} {DIM}({}){RESET}",
            request.tool_name, request.call_id
        ));
    }

    fn on_session_created(&mut self, session_id: &str) {
        self.println(&format!("{DIM}session {session_id}{RESET}"));
    }

    fn on_conversation_complete(&mut self) {
        self.println(&format!("{GREEN}Conversation complete{RESET}"));
    }

    fn on_session_ended(&mut self, summary: &SessionSummary) {
        let seconds = (summary.ended_at - summary.started_at).num_seconds();
        self.println(&format!(
            "{DIM}session {} ended after {}s, {} function call(s): {}{RESET}",
            summary.session_id,
            seconds,
            summary.function_calls,
            format_end_reason(&summary.reason)
        ));
        if self.verbose {
            for entry in &summary.transcript {
                let who = match entry.speaker {
                    Speaker::User => "member",
                    Speaker::Assistant => "assistant",
                };
                self.println(&format!("  {DIM}{who}:{RESET} {}", entry.text));
            }
        }
    }
}
