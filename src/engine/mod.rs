//! The voice session engine: one task composing provisioning, transport,
//! routing, tool dispatch and phrase detection.

mod actor;
pub mod observer;

use crate::audio::constraints::CaptureConstraints;
use crate::audio::output::{AudioOutput, NullOutput};
use crate::audio::processor::AudioProcessor;
use crate::audio::recorder::Microphone;
use crate::config::{Config, DetectorConfig};
use crate::defaults;
use crate::detector::matcher::{ClosingPhraseMatcher, PhraseMatcher};
use crate::detector::phrase_detector::{DetectorSettings, PhraseDetector};
use crate::detector::recognizer::{ChannelRecognizer, Recognizer, UtteranceForwarder};
use crate::error::{Result, VoiceError};
use crate::events::router::{EventRouter, EventSubscriber};
use crate::retry::RetryPolicy;
use crate::session::{SessionContext, SessionFactory};
use crate::tools::dispatcher::FunctionCallDispatcher;
use crate::tools::registry::ToolRegistry;
use crate::transport::client::TransportClient;
use crate::transport::peer::PeerTransport;
use crate::transport::state::ConnectionState;
use actor::{Command, EngineActor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use observer::{
    EndReason, NoopObserver, Observed, RecordingObserver, SessionObserver, SessionSummary,
};

/// Engine tunables, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub constraints: CaptureConstraints,
    pub frame: Duration,
    /// Provisioning and connect attempts.
    pub retry: RetryPolicy,
    /// Re-negotiation after an interruption.
    pub reconnect: RetryPolicy,
    pub tool_timeout: Duration,
    pub detector: DetectorConfig,
    pub transcription_model: Option<String>,
    pub level_refresh: Duration,
    pub level_epsilon: f32,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            constraints: CaptureConstraints::from_config(&config.audio),
            frame: Duration::from_millis(config.audio.frame_ms),
            retry: config.retry.to_policy(),
            reconnect: config.reconnect.to_policy(),
            tool_timeout: Duration::from_millis(config.tools.timeout_ms),
            detector: config.detector.clone(),
            transcription_model: config.provider.transcription_model.clone(),
            level_refresh: Duration::from_millis(defaults::LEVEL_REFRESH_MS),
            level_epsilon: defaults::LEVEL_EPSILON,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub(crate) type SubscriberFactory = Box<dyn Fn() -> Box<dyn EventSubscriber> + Send>;

pub struct VoiceEngineBuilder {
    config: EngineConfig,
    factory: Arc<dyn SessionFactory>,
    transport: Arc<dyn PeerTransport>,
    microphone: Arc<dyn Microphone>,
    output: Box<dyn AudioOutput>,
    tools: ToolRegistry,
    observer: Box<dyn SessionObserver>,
    matcher: Option<Arc<dyn PhraseMatcher>>,
    recognizer: Option<Box<dyn Recognizer>>,
    subscribers: Vec<SubscriberFactory>,
}

impl VoiceEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_output(mut self, output: Box<dyn AudioOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Replace the closing-phrase matcher built from the detector config.
    pub fn with_matcher(mut self, matcher: Arc<dyn PhraseMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Local recognizer for the phrase detector. Without one, detection is off.
    pub fn with_recognizer(mut self, recognizer: Box<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Build one subscriber per session; it is disposed when the session ends.
    pub fn with_subscriber_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn EventSubscriber> + Send + 'static,
    {
        self.subscribers.push(Box::new(factory));
        self
    }

    /// Detect the closing phrase in the member's transcribed speech.
    pub fn with_remote_transcript_detection(self) -> Self {
        let (recognizer, feed) = ChannelRecognizer::new();
        self.with_recognizer(Box::new(recognizer))
            .with_subscriber_factory(move || Box::new(UtteranceForwarder::new(feed.clone())))
    }

    /// Start the engine task. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> VoiceEngine {
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let audio = AudioProcessor::new(self.microphone).with_frame_duration(self.config.frame);
        let client = TransportClient::new(self.transport, audio)
            .with_constraints(self.config.constraints.clone())
            .with_output(self.output)
            .with_reconnect_policy(self.config.reconnect)
            .with_state_history(history_tx);
        let state = client.subscribe_state();

        let matcher = self
            .matcher
            .unwrap_or_else(|| Arc::new(ClosingPhraseMatcher::from_config(&self.config.detector)));
        let detector = PhraseDetector::new(matcher, DetectorSettings::from_config(&self.config.detector));
        let dispatcher = FunctionCallDispatcher::new(self.tools, self.config.tool_timeout);

        let (command_tx, command_rx) = mpsc::channel(16);
        let actor = EngineActor::new(
            self.config,
            self.factory,
            client,
            EventRouter::new(),
            dispatcher,
            self.observer,
            detector,
            self.recognizer,
            self.subscribers,
            command_rx,
            history_rx,
        );
        let task = tokio::spawn(actor.run());

        VoiceEngine {
            commands: command_tx,
            state,
            task: Some(task),
        }
    }
}

/// Handle to a running engine. Dropping it ends any session and stops the task.
pub struct VoiceEngine {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

fn engine_stopped() -> VoiceError {
    VoiceError::Other("voice engine stopped".to_string())
}

impl VoiceEngine {
    pub fn builder(
        factory: Arc<dyn SessionFactory>,
        transport: Arc<dyn PeerTransport>,
        microphone: Arc<dyn Microphone>,
    ) -> VoiceEngineBuilder {
        VoiceEngineBuilder {
            config: EngineConfig::default(),
            factory,
            transport,
            microphone,
            output: Box::new(NullOutput),
            tools: ToolRegistry::new(),
            observer: Box::new(NoopObserver),
            matcher: None,
            recognizer: None,
            subscribers: Vec::new(),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| engine_stopped())?;
        response.await.map_err(|_| engine_stopped())
    }

    /// Provision a session and connect. Any previous session is ended first.
    ///
    /// Returns the new session id.
    pub async fn start_session(&self, context: SessionContext) -> Result<String> {
        self.request(|reply| Command::Start { context, reply }).await?
    }

    /// End the current session, cancelling an in-flight connect.
    pub async fn stop_session(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Assert or clear local listening. Returns whether the state changed.
    pub async fn set_listening(&self, listening: bool) -> Result<bool> {
        self.request(|reply| Command::SetListening { listening, reply })
            .await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| engine_stopped())
    }

    /// End any session and stop the engine task.
    pub async fn shutdown(mut self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Engine task failed");
        }
        Ok(())
    }
}
