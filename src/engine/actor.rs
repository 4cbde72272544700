use crate::audio::state::AudioState;
use crate::detector::phrase_detector::PhraseDetector;
use crate::detector::recognizer::Recognizer;
use crate::engine::observer::{EndReason, SessionObserver, SessionSummary};
use crate::engine::{EngineConfig, SubscriberFactory};
use crate::error::{Result, VoiceError};
use crate::events::protocol::{ClientEvent, RealtimeEvent, SessionConfig};
use crate::events::router::EventRouter;
use crate::events::transcript::{TranscriptAssembler, TranscriptFragment, TranscriptHandle, TranscriptLog};
use crate::session::{Session, SessionContext, SessionFactory, create_session_with_retry};
use crate::tools::call::{AmbientContext, FunctionCallResult};
use crate::tools::dispatcher::{DispatchDecision, DispatchOutcome, FunctionCallDispatcher};
use crate::transport::client::TransportClient;
use crate::transport::peer::LinkMessage;
use crate::transport::state::ConnectionState;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Remote error codes that mean the event channel is gone.
const CLOSURE_CODES: &[&str] = &["session_expired", "connection_closed"];

pub(crate) enum Command {
    Start {
        context: SessionContext,
        reply: oneshot::Sender<Result<String>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetListening {
        listening: bool,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Commands and state history, readable while a connect is in progress.
struct Inbox {
    commands: mpsc::Receiver<Command>,
    history: mpsc::UnboundedReceiver<ConnectionState>,
    /// Stop/shutdown replies owed once the interrupted operation unwinds.
    deferred: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
    commands_closed: bool,
}

impl Inbox {
    /// Run `operation` while still serving commands. Stop and shutdown cancel it.
    async fn drive<T>(
        &mut self,
        operation: impl Future<Output = T>,
        cancel: &CancellationToken,
        observer: &mut dyn SessionObserver,
    ) -> T {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                output = &mut operation => return output,
                Some(state) = self.history.recv() => observer.on_status_change(state),
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(Command::Stop { reply }) => {
                        cancel.cancel();
                        self.deferred.push(reply);
                    }
                    Some(Command::Shutdown { reply }) => {
                        cancel.cancel();
                        self.deferred.push(reply);
                        self.shutting_down = true;
                    }
                    Some(Command::Start { reply, .. }) => {
                        let busy = VoiceError::Other("a session start is already in progress".to_string());
                        if reply.send(Err(busy)).is_err() {
                            tracing::trace!("Start requester went away");
                        }
                    }
                    Some(Command::SetListening { reply, .. }) => {
                        if reply.send(false).is_err() {
                            tracing::trace!("Listening requester went away");
                        }
                    }
                    None => {
                        self.commands_closed = true;
                        self.shutting_down = true;
                        cancel.cancel();
                    }
                },
            }
        }
    }

    fn flush_deferred(&mut self) {
        for reply in self.deferred.drain(..) {
            if reply.send(()).is_err() {
                tracing::trace!("Stop requester went away");
            }
        }
    }
}

struct ActiveSession {
    id: String,
    started_at: DateTime<Utc>,
    transcript: TranscriptHandle,
    function_calls: usize,
    completed: bool,
}

enum Input {
    Command(Command),
    CommandsClosed,
    State(ConnectionState),
    Link(LinkMessage),
    Outcome(DispatchOutcome),
    Detected(u64),
    Tick,
}

pub(crate) struct EngineActor {
    config: EngineConfig,
    factory: Arc<dyn SessionFactory>,
    client: TransportClient,
    router: EventRouter,
    dispatcher: FunctionCallDispatcher,
    observer: Box<dyn SessionObserver>,
    detector: PhraseDetector,
    recognizer: Option<Box<dyn Recognizer>>,
    subscribers: Vec<SubscriberFactory>,
    inbox: Inbox,
    detections_tx: mpsc::UnboundedSender<u64>,
    detections_rx: mpsc::UnboundedReceiver<u64>,
    session: Option<ActiveSession>,
    generation: u64,
    /// Detection that arrived while the assistant was speaking.
    held_completion: Option<u64>,
    assembler: TranscriptAssembler,
    latest: Option<TranscriptFragment>,
    last_audio: AudioState,
    undelivered: VecDeque<FunctionCallResult>,
}

impl EngineActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        client: TransportClient,
        router: EventRouter,
        dispatcher: FunctionCallDispatcher,
        observer: Box<dyn SessionObserver>,
        detector: PhraseDetector,
        recognizer: Option<Box<dyn Recognizer>>,
        subscribers: Vec<SubscriberFactory>,
        commands: mpsc::Receiver<Command>,
        history: mpsc::UnboundedReceiver<ConnectionState>,
    ) -> Self {
        let (detections_tx, detections_rx) = mpsc::unbounded_channel();
        Self {
            config,
            factory,
            client,
            router,
            dispatcher,
            observer,
            detector,
            recognizer,
            subscribers,
            inbox: Inbox {
                commands,
                history,
                deferred: Vec::new(),
                shutting_down: false,
                commands_closed: false,
            },
            detections_tx,
            detections_rx,
            session: None,
            generation: 0,
            held_completion: None,
            assembler: TranscriptAssembler::new(),
            latest: None,
            last_audio: AudioState::default(),
            undelivered: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut level_tick = tokio::time::interval(self.config.level_refresh);
        level_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!("Voice engine started");
        while !self.inbox.shutting_down {
            let input = tokio::select! {
                command = self.inbox.commands.recv(), if !self.inbox.commands_closed => match command {
                    Some(command) => Input::Command(command),
                    None => Input::CommandsClosed,
                },
                Some(state) = self.inbox.history.recv() => Input::State(state),
                message = self.client.recv() => Input::Link(message),
                outcome = self.dispatcher.next_outcome() => Input::Outcome(outcome),
                Some(generation) = self.detections_rx.recv() => Input::Detected(generation),
                _ = level_tick.tick(), if self.session.is_some() => Input::Tick,
            };

            match input {
                Input::Command(command) => self.handle_command(command).await,
                Input::CommandsClosed => {
                    self.inbox.commands_closed = true;
                    self.inbox.shutting_down = true;
                }
                Input::State(state) => {
                    self.observer.on_status_change(state);
                    self.publish_audio_state();
                }
                Input::Link(LinkMessage::Event(raw)) => self.handle_raw_event(&raw).await,
                Input::Link(LinkMessage::Audio(samples)) => {
                    self.client.play_remote_audio(&samples);
                    self.drain_history();
                }
                Input::Link(LinkMessage::Interrupted(reason)) => self.reconnect(&reason).await,
                Input::Outcome(outcome) => self.handle_outcome(outcome),
                Input::Detected(generation) => self.handle_detection(generation).await,
                Input::Tick => self.publish_audio_state(),
            }
            if let Some(generation) = self.held_completion
                && self.client.state() != ConnectionState::Speaking
            {
                self.held_completion = None;
                self.handle_detection(generation).await;
            }
            self.inbox.flush_deferred();
        }

        self.end_session(EndReason::Stopped).await;
        self.inbox.flush_deferred();
        tracing::debug!("Voice engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { context, reply } => {
                let result = self.start_session(context).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Start requester went away");
                }
            }
            Command::Stop { reply } => {
                self.end_session(EndReason::Stopped).await;
                if reply.send(()).is_err() {
                    tracing::trace!("Stop requester went away");
                }
            }
            Command::SetListening { listening, reply } => {
                let changed = self.client.set_listening(listening);
                self.drain_history();
                if reply.send(changed).is_err() {
                    tracing::trace!("Listening requester went away");
                }
            }
            Command::Shutdown { reply } => {
                self.inbox.deferred.push(reply);
                self.inbox.shutting_down = true;
            }
        }
    }

    async fn start_session(&mut self, context: SessionContext) -> Result<String> {
        self.end_session(EndReason::Replaced).await;

        let cancel = self.client.cancel_handle();
        let provisioning = {
            let factory = Arc::clone(&self.factory);
            let retry = self.config.retry;
            let context = context.clone();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    result = create_session_with_retry(factory.as_ref(), &context, &retry) => result,
                    _ = cancel.cancelled() => Err(VoiceError::Cancelled),
                }
            }
        };
        let session = match self
            .inbox
            .drive(provisioning, &cancel, self.observer.as_mut())
            .await
        {
            Ok(session) => session,
            Err(VoiceError::Cancelled) => return Err(VoiceError::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "Session provisioning failed");
                self.observer.on_error(&e);
                self.client.fail();
                self.drain_history();
                return Err(e);
            }
        };

        let session_id = session.session_id.clone();
        tracing::info!(
            session_id = %session_id,
            tenant_id = %context.tenant_id,
            kiosk_id = %context.kiosk_id,
            "Session created"
        );
        self.observer.on_session_created(&session_id);
        self.prepare_session(&session);

        if let Err(e) = self.connect_with_retry(session).await {
            if !matches!(e, VoiceError::Cancelled) {
                self.observer.on_error(&e);
            }
            let reason = match &e {
                VoiceError::Cancelled => EndReason::Stopped,
                other => EndReason::Failed(other.to_string()),
            };
            self.end_session(reason).await;
            return Err(e);
        }

        self.start_detector();
        self.drain_history();
        Ok(session_id)
    }

    /// Per-session wiring: setup event, tool context, fresh subscribers.
    fn prepare_session(&mut self, session: &Session) {
        let setup = SessionConfig::new(
            session.context.rendered_instructions(),
            session.voice.clone(),
            self.dispatcher.registry().schemas_for_session(),
        )
        .with_transcription(self.config.transcription_model.clone());
        self.client
            .set_setup_event(Some(ClientEvent::SessionUpdate { session: setup }));
        self.dispatcher
            .begin_session(AmbientContext::from_session(session));

        let (log, transcript) = TranscriptLog::new();
        self.router.clear();
        self.router.subscribe(Box::new(log));
        for factory in &self.subscribers {
            self.router.subscribe(factory());
        }

        self.session = Some(ActiveSession {
            id: session.session_id.clone(),
            started_at: Utc::now(),
            transcript,
            function_calls: 0,
            completed: false,
        });
    }

    async fn connect_with_retry(&mut self, session: Session) -> Result<()> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            let cancel = self.client.cancel_handle();
            let result = self
                .inbox
                .drive(
                    self.client.connect(session.clone()),
                    &cancel,
                    self.observer.as_mut(),
                )
                .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && policy.allows_retry_after(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    self.inbox
                        .drive(tokio::time::sleep(delay), &cancel, self.observer.as_mut())
                        .await;
                    if cancel.is_cancelled() {
                        return Err(VoiceError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_detector(&mut self) {
        if !self.config.detector.enabled {
            return;
        }
        let Some(recognizer) = self.recognizer.take() else {
            return;
        };
        let tx = self.detections_tx.clone();
        let generation = self.generation;
        let started = self
            .detector
            .start(recognizer, self.client.subscribe_state(), move || {
                if tx.send(generation).is_err() {
                    tracing::trace!("Engine gone before detection was delivered");
                }
            });
        if let Err(recognizer) = started {
            tracing::warn!("Phrase detector already running");
            self.recognizer = Some(recognizer);
        }
    }

    /// Release everything of the current session. Safe without a session.
    async fn end_session(&mut self, reason: EndReason) {
        self.generation += 1;
        self.held_completion = None;

        if let Some(recognizer) = self.detector.stop().await {
            self.recognizer = Some(recognizer);
        }
        let abandoned = self.dispatcher.abandon_all();
        if abandoned > 0 {
            tracing::debug!(abandoned, "Abandoned in-flight function calls");
        }
        self.undelivered.clear();
        self.client.disconnect();
        self.router.clear();
        self.assembler.reset();
        self.latest = None;
        self.drain_history();

        if let Some(active) = self.session.take() {
            let summary = SessionSummary {
                session_id: active.id,
                started_at: active.started_at,
                ended_at: Utc::now(),
                reason: if active.completed && reason == EndReason::Stopped {
                    EndReason::ConversationComplete
                } else {
                    reason
                },
                function_calls: active.function_calls,
                transcript: active.transcript.entries(),
            };
            tracing::info!(
                session_id = %summary.session_id,
                reason = ?summary.reason,
                function_calls = summary.function_calls,
                "Session ended"
            );
            self.observer.on_session_ended(&summary);
        }
        self.publish_audio_state();
    }

    async fn handle_raw_event(&mut self, raw: &str) {
        match self.router.route(raw) {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed event"),
        }
    }

    async fn handle_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::TranscriptDelta { .. } | RealtimeEvent::TranscriptFinal { .. } => {
                if let Some(fragment) = self.assembler.apply(&event) {
                    self.observer
                        .on_transcript_update(&fragment.text, fragment.is_final);
                    self.latest = Some(fragment);
                    self.publish_audio_state();
                }
            }
            RealtimeEvent::SpeechStarted { speaker } => {
                self.client.apply_speech_boundary(speaker, true);
                self.drain_history();
            }
            RealtimeEvent::SpeechStopped { speaker } => {
                self.client.apply_speech_boundary(speaker, false);
                self.drain_history();
            }
            RealtimeEvent::FunctionCallRequested(request) => {
                if self.dispatcher.dispatch(request.clone()) != DispatchDecision::Started {
                    return;
                }
                if let Some(active) = self.session.as_mut() {
                    active.function_calls += 1;
                }
                if let Some(channel) = self.client.event_channel() {
                    self.observer.on_function_call(&request, &channel);
                }
            }
            RealtimeEvent::Error { code, message } => {
                if code
                    .as_deref()
                    .is_some_and(|c| CLOSURE_CODES.contains(&c))
                {
                    self.reconnect(&message).await;
                } else {
                    tracing::warn!(code = ?code, message = %message, "Provider reported an error");
                }
            }
        }
    }

    fn handle_outcome(&mut self, outcome: DispatchOutcome) {
        let Some(result) = self.dispatcher.complete(outcome) else {
            return;
        };
        if let Err(e) = self.client.inject_function_result(&result) {
            tracing::debug!(call_id = %result.call_id, error = %e, "Holding function result until reconnected");
            self.undelivered.push_back(result);
            return;
        }
        self.continue_response();
    }

    /// Ask the provider to continue once every call has been answered.
    fn continue_response(&mut self) {
        if self.dispatcher.pending() > 0 || !self.undelivered.is_empty() {
            return;
        }
        if let Err(e) = self.client.send_event(&ClientEvent::ResponseCreate) {
            tracing::debug!(error = %e, "Could not request response continuation");
        }
    }

    fn flush_undelivered(&mut self) {
        if self.undelivered.is_empty() {
            return;
        }
        while let Some(result) = self.undelivered.pop_front() {
            if let Err(e) = self.client.inject_function_result(&result) {
                tracing::debug!(call_id = %result.call_id, error = %e, "Function result still undeliverable");
                self.undelivered.push_front(result);
                return;
            }
        }
        self.continue_response();
    }

    async fn reconnect(&mut self, reason: &str) {
        if self.session.is_none() {
            return;
        }
        let cancel = self.client.cancel_handle();
        let result = self
            .inbox
            .drive(
                self.client.handle_interruption(reason),
                &cancel,
                self.observer.as_mut(),
            )
            .await;

        match result {
            Ok(()) => {
                self.drain_history();
                self.flush_undelivered();
            }
            Err(VoiceError::Cancelled) => self.end_session(EndReason::Stopped).await,
            Err(e) => {
                self.observer.on_error(&e);
                self.end_session(EndReason::Failed(e.to_string())).await;
            }
        }
    }

    async fn handle_detection(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if active.completed {
            return;
        }
        if self.client.state() == ConnectionState::Speaking {
            tracing::debug!("Assistant speaking, holding conversation completion");
            self.held_completion = Some(generation);
            return;
        }
        active.completed = true;
        self.observer.on_conversation_complete();
        if self.config.detector.end_session {
            self.end_session(EndReason::ConversationComplete).await;
        }
    }

    fn drain_history(&mut self) {
        while let Ok(state) = self.inbox.history.try_recv() {
            self.observer.on_status_change(state);
        }
        self.publish_audio_state();
    }

    fn publish_audio_state(&mut self) {
        let state = AudioState::project(
            self.client.state(),
            self.latest.as_ref(),
            self.client.input_level(),
        );
        if state.roughly_equals(&self.last_audio, self.config.level_epsilon) {
            return;
        }
        self.observer.on_audio_state_change(&state);
        self.last_audio = state;
    }
}
