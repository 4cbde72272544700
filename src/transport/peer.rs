//! The negotiated link: one media stream plus one event channel.

use crate::error::{Result, VoiceError};
use crate::events::protocol::ClientEvent;
use crate::session::Session;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Something received over the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    /// Raw event channel message.
    Event(String),
    /// Remote audio, PCM16 mono at the session rate.
    Audio(Vec<i16>),
    /// The link went away; the reason is for logging.
    Interrupted(String),
}

/// Negotiates links for a provisioned session.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn negotiate(&self, session: &Session) -> Result<PeerLink>;

    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Write side of the event channel for one session.
#[derive(Debug, Clone)]
pub struct EventChannel {
    session_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl EventChannel {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn send(&self, event: &ClientEvent) -> Result<()> {
        let text = event.to_json()?;
        self.tx
            .send(text)
            .map_err(|_| VoiceError::TransportInterruption {
                message: "event channel closed".to_string(),
            })
    }
}

pub struct PeerLink {
    session_id: String,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<LinkMessage>,
    media: mpsc::Sender<Vec<i16>>,
    task: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn new(
        session_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::Receiver<LinkMessage>,
        media: mpsc::Sender<Vec<i16>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            outbound,
            inbound,
            media,
            task: None,
        }
    }

    /// Background task driving the underlying connection; aborted on close.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn event_channel(&self) -> EventChannel {
        EventChannel {
            session_id: self.session_id.clone(),
            tx: self.outbound.clone(),
        }
    }

    /// Destination for captured microphone frames.
    pub fn media_sender(&self) -> mpsc::Sender<Vec<i16>> {
        self.media.clone()
    }

    pub fn send(&self, event: &ClientEvent) -> Result<()> {
        self.event_channel().send(event)
    }

    /// Next inbound message. A closed link reads as an interruption.
    pub async fn recv(&mut self) -> LinkMessage {
        match self.inbound.recv().await {
            Some(message) => message,
            None => LinkMessage::Interrupted("link closed by peer".to_string()),
        }
    }

    pub fn close(&mut self) {
        self.inbound.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}
