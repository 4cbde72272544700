//! Local speech recognizers feeding the phrase detector.

use crate::error::Result;
use crate::events::protocol::{RealtimeEvent, Speaker};
use crate::events::router::EventSubscriber;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// A finalized utterance.
    Final(String),
    Error { message: String, aborted: bool },
    /// The utterance stream ended naturally.
    End,
}

/// A start/stop recognition engine producing finalized utterances.
#[async_trait::async_trait]
pub trait Recognizer: Send {
    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self);

    /// Next event. Only called between `start` and `stop`.
    async fn next_event(&mut self) -> RecognizerEvent;

    fn name(&self) -> &'static str {
        "recognizer"
    }
}

/// Recognizer fed from a channel.
///
/// Input arriving while stopped is discarded on the next start, the way a
/// microphone-backed recognizer would never have heard it.
pub struct ChannelRecognizer {
    rx: mpsc::UnboundedReceiver<RecognizerEvent>,
    running: bool,
    starts: Arc<AtomicUsize>,
}

/// Sending side of a [`ChannelRecognizer`].
#[derive(Debug, Clone)]
pub struct RecognizerFeed {
    tx: mpsc::UnboundedSender<RecognizerEvent>,
    starts: Arc<AtomicUsize>,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, RecognizerFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let starts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx,
                running: false,
                starts: Arc::clone(&starts),
            },
            RecognizerFeed { tx, starts },
        )
    }
}

impl RecognizerFeed {
    pub fn utterance(&self, text: impl Into<String>) -> bool {
        self.send(RecognizerEvent::Final(text.into()))
    }

    pub fn error(&self, message: impl Into<String>, aborted: bool) -> bool {
        self.send(RecognizerEvent::Error {
            message: message.into(),
            aborted,
        })
    }

    pub fn end(&self) -> bool {
        self.send(RecognizerEvent::End)
    }

    fn send(&self, event: RecognizerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// How many times the recognizer has been started.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Recognizer for ChannelRecognizer {
    async fn start(&mut self) -> Result<()> {
        while self.rx.try_recv().is_ok() {}
        self.running = true;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;
    }

    async fn next_event(&mut self) -> RecognizerEvent {
        if !self.running {
            return std::future::pending().await;
        }
        self.rx.recv().await.unwrap_or(RecognizerEvent::End)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Forwards the member's finalized transcripts into a recognizer feed.
pub struct UtteranceForwarder {
    feed: RecognizerFeed,
}

impl UtteranceForwarder {
    pub fn new(feed: RecognizerFeed) -> Self {
        Self { feed }
    }
}

impl EventSubscriber for UtteranceForwarder {
    fn on_event(&mut self, event: &RealtimeEvent) {
        if let RealtimeEvent::TranscriptFinal {
            speaker: Speaker::User,
            text,
        } = event
            && !self.feed.utterance(text.clone())
        {
            tracing::trace!("Recognizer feed closed");
        }
    }

    fn name(&self) -> &'static str {
        "utterance-forwarder"
    }
}
