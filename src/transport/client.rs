//! Transport client: owns the connection state machine, the negotiated link
//! and the microphone handle of the active session.

use crate::audio::constraints::CaptureConstraints;
use crate::audio::output::{AudioOutput, NullOutput};
use crate::audio::processor::{AudioProcessor, MediaHandle};
use crate::error::{CredentialFailure, Result, VoiceError};
use crate::events::protocol::{ClientEvent, Speaker};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::tools::call::FunctionCallResult;
use crate::transport::peer::{EventChannel, LinkMessage, PeerLink, PeerTransport};
use crate::transport::state::{ConnectionState, StateMachine};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub struct TransportClient {
    transport: Arc<dyn PeerTransport>,
    audio: AudioProcessor,
    constraints: CaptureConstraints,
    output: Box<dyn AudioOutput>,
    reconnect: RetryPolicy,
    machine: StateMachine,
    session: Option<Session>,
    link: Option<PeerLink>,
    media: Option<MediaHandle>,
    cancel: CancellationToken,
    setup: Option<ClientEvent>,
}

impl TransportClient {
    pub fn new(transport: Arc<dyn PeerTransport>, audio: AudioProcessor) -> Self {
        Self {
            transport,
            audio,
            constraints: CaptureConstraints::default(),
            output: Box::new(NullOutput),
            reconnect: RetryPolicy::none(),
            machine: StateMachine::new(),
            session: None,
            link: None,
            media: None,
            cancel: CancellationToken::new(),
            setup: None,
        }
    }

    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_output(mut self, output: Box<dyn AudioOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Every applied transition is also sent to `history`.
    pub fn with_state_history(mut self, history: mpsc::UnboundedSender<ConnectionState>) -> Self {
        self.machine = self.machine.with_history(history);
        self
    }

    /// Event written right after every (re)negotiation, e.g. `session.update`.
    pub fn set_setup_event(&mut self, event: Option<ClientEvent>) {
        self.setup = event;
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.machine.subscribe()
    }

    /// Token that aborts an in-flight `connect` or reconnect.
    pub fn cancel_handle(&mut self) -> CancellationToken {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.cancel.clone()
    }

    /// `None` until connected.
    pub fn session_id(&self) -> Option<&str> {
        if !self.state().is_active() {
            return None;
        }
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// `None` until connected.
    pub fn event_channel(&self) -> Option<EventChannel> {
        if !self.state().is_active() {
            return None;
        }
        self.link.as_ref().map(PeerLink::event_channel)
    }

    pub fn input_level(&self) -> f32 {
        self.media.as_ref().map(MediaHandle::level).unwrap_or(0.0)
    }

    pub fn is_microphone_held(&self) -> bool {
        self.audio.is_held()
    }

    /// Negotiate a link for `session` and start streaming the microphone.
    ///
    /// Any previous link is torn down first. Negotiation failures leave the
    /// client in `error` with the microphone released; retrying is up to the
    /// caller.
    pub async fn connect(&mut self, session: Session) -> Result<()> {
        self.teardown();
        if !matches!(self.state(), ConnectionState::Idle | ConnectionState::Closed) {
            self.machine.transition(ConnectionState::Closed);
        }
        let cancel = self.cancel_handle();

        if session.is_expired() {
            self.machine.transition(ConnectionState::Error);
            self.machine.transition(ConnectionState::Closed);
            return Err(VoiceError::credential(
                CredentialFailure::Expired,
                format!("session {} expired at {}", session.session_id, session.expires_at),
            ));
        }

        self.machine.transition(ConnectionState::Connecting);
        tracing::info!(
            session_id = %session.session_id,
            transport = self.transport.name(),
            "Connecting"
        );

        let mut media = match self.audio.acquire_local_stream(&self.constraints) {
            Ok(media) => media,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };

        let transport = Arc::clone(&self.transport);
        let negotiated = tokio::select! {
            _ = cancel.cancelled() => None,
            result = transport.negotiate(&session) => Some(result),
        };

        let link = match negotiated {
            None => {
                media.release();
                self.machine.transition(ConnectionState::Closed);
                tracing::info!(session_id = %session.session_id, "Connect cancelled");
                return Err(VoiceError::Cancelled);
            }
            Some(Err(e)) => {
                media.release();
                self.machine.transition(ConnectionState::Error);
                tracing::warn!(session_id = %session.session_id, error = %e, "Negotiation failed");
                return Err(e);
            }
            Some(Ok(link)) => link,
        };

        if let Err(e) = start_link(&mut media, &link, self.setup.as_ref()) {
            media.release();
            self.machine.transition(ConnectionState::Error);
            return Err(e);
        }

        tracing::info!(session_id = %session.session_id, "Connected");
        self.session = Some(session);
        self.link = Some(link);
        self.media = Some(media);
        self.machine.transition(ConnectionState::Connected);
        Ok(())
    }

    /// Release the link and the microphone; ends in `closed`. Idempotent.
    pub fn disconnect(&mut self) {
        let had_session = self.session.is_some();
        self.teardown();
        if self.state() != ConnectionState::Idle {
            self.machine.transition(ConnectionState::Closed);
        }
        if had_session {
            tracing::info!("Disconnected");
        }
    }

    /// Unrecoverable failure: `error`, release everything, `closed`.
    pub fn fail(&mut self) {
        self.machine.transition(ConnectionState::Error);
        self.teardown();
        self.machine.transition(ConnectionState::Closed);
    }

    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(mut media) = self.media.take() {
            media.release();
        }
        self.output.clear();
        self.session = None;
    }

    /// Caller assertion of local listening. Refused while the assistant speaks.
    pub fn set_listening(&mut self, listening: bool) -> bool {
        let current = self.state();
        match (listening, current) {
            (true, ConnectionState::Connected) => self.machine.transition(ConnectionState::Listening),
            (false, ConnectionState::Listening) => self.machine.transition(ConnectionState::Connected),
            (true, ConnectionState::Speaking) => {
                tracing::debug!("Listening refused while assistant is speaking");
                false
            }
            _ => false,
        }
    }

    /// Apply a remote speech boundary. Returns whether the state changed.
    pub fn apply_speech_boundary(&mut self, speaker: Speaker, started: bool) -> bool {
        use ConnectionState::*;
        let current = self.state();
        let next = match (speaker, started, current) {
            (Speaker::Assistant, true, Connected | Listening) => Speaking,
            (Speaker::Assistant, false, Speaking) => Connected,
            (Speaker::User, true, Connected) => Listening,
            (Speaker::User, false, Listening) => Connected,
            _ => return false,
        };
        self.machine.transition(next)
    }

    /// Next message from the link. Pends while there is none.
    pub async fn recv(&mut self) -> LinkMessage {
        match self.link.as_mut() {
            Some(link) => link.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn send_event(&self, event: &ClientEvent) -> Result<()> {
        match &self.link {
            Some(link) if self.state().is_active() => link.send(event),
            _ => Err(VoiceError::TransportInterruption {
                message: "no open event channel".to_string(),
            }),
        }
    }

    pub fn inject_function_result(&self, result: &FunctionCallResult) -> Result<()> {
        self.send_event(&ClientEvent::function_result(result))?;
        tracing::debug!(call_id = %result.call_id, error = result.is_error(), "Function result injected");
        Ok(())
    }

    /// Hand remote audio to the output. Audio implies the assistant is speaking.
    pub fn play_remote_audio(&mut self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        self.apply_speech_boundary(Speaker::Assistant, true);
        if let Err(e) = self.output.play(samples) {
            tracing::warn!(output = self.output.name(), error = %e, "Playback failed");
        }
    }

    /// Re-negotiate the current session after the link dropped.
    ///
    /// The microphone stays held throughout. When the reconnect policy is
    /// exhausted or the session expired the client ends in `closed`.
    pub async fn handle_interruption(&mut self, reason: &str) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Err(VoiceError::TransportInterruption {
                message: format!("{} (no session)", reason),
            });
        };
        if !self.machine.transition(ConnectionState::Reconnecting)
            && self.state() != ConnectionState::Reconnecting
        {
            return Err(VoiceError::TransportInterruption {
                message: format!("{} (state {})", reason, self.state()),
            });
        }

        tracing::warn!(session_id = %session.session_id, reason, "Link interrupted, reconnecting");
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(media) = &self.media {
            media.detach();
        }
        self.output.clear();

        let cancel = self.cancel_handle();
        let transport = Arc::clone(&self.transport);
        let mut attempt: u32 = 0;
        let mut last_error = reason.to_string();

        loop {
            attempt += 1;
            if session.is_expired() {
                last_error = "session expired".to_string();
                break;
            }
            if attempt > 1 {
                let delay = self.reconnect.delay_for(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return self.cancelled(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let negotiated = tokio::select! {
                _ = cancel.cancelled() => None,
                result = transport.negotiate(&session) => Some(result),
            };
            match negotiated {
                None => return self.cancelled(),
                Some(Ok(link)) => {
                    let started = match self.media.as_mut() {
                        Some(media) => start_link(media, &link, self.setup.as_ref()),
                        None => Err(VoiceError::Device {
                            message: "microphone released during reconnect".to_string(),
                        }),
                    };
                    match started {
                        Ok(()) => {
                            self.link = Some(link);
                            self.machine.transition(ConnectionState::Connected);
                            tracing::info!(session_id = %session.session_id, attempt, "Reconnected");
                            return Ok(());
                        }
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }

            if !self.reconnect.allows_retry_after(attempt) {
                break;
            }
        }

        tracing::error!(session_id = %session.session_id, attempt, error = %last_error, "Reconnect failed");
        self.fail();
        Err(VoiceError::TransportInterruption {
            message: last_error,
        })
    }

    fn cancelled(&mut self) -> Result<()> {
        self.teardown();
        self.machine.transition(ConnectionState::Closed);
        Err(VoiceError::Cancelled)
    }
}

fn start_link(media: &mut MediaHandle, link: &PeerLink, setup: Option<&ClientEvent>) -> Result<()> {
    media.attach(link.media_sender())?;
    if let Some(setup) = setup {
        link.send(setup)?;
    }
    Ok(())
}
