//! In-memory transport. The test side of every negotiated link is a
//! [`LoopbackPeer`] that plays the provider.

use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::session::Session;
use crate::transport::peer::{LinkMessage, PeerLink, PeerTransport};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Controls {
    fail_next: u32,
    hang: bool,
    negotiations: usize,
}

pub struct LoopbackTransport {
    controls: Arc<Mutex<Controls>>,
    peers: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Test-side handle: controls negotiation and receives one peer per link.
pub struct LoopbackRemote {
    controls: Arc<Mutex<Controls>>,
    peers: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackRemote) {
        let controls = Arc::new(Mutex::new(Controls::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                controls: Arc::clone(&controls),
                peers: tx,
            },
            LoopbackRemote {
                controls,
                peers: rx,
            },
        )
    }
}

impl LoopbackRemote {
    /// Fail the next `count` negotiations.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.fail_next = count;
        }
    }

    /// Never complete negotiations while set.
    pub fn set_hang(&self, hang: bool) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.hang = hang;
        }
    }

    pub fn negotiations(&self) -> usize {
        self.controls.lock().map(|c| c.negotiations).unwrap_or(0)
    }

    /// The provider side of the next successful negotiation.
    pub async fn next_peer(&mut self) -> Option<LoopbackPeer> {
        self.peers.recv().await
    }
}

#[async_trait::async_trait]
impl PeerTransport for LoopbackTransport {
    async fn negotiate(&self, session: &Session) -> Result<PeerLink> {
        let (hang, fail) = {
            let mut controls = self
                .controls
                .lock()
                .map_err(|_| VoiceError::Other("loopback controls poisoned".to_string()))?;
            controls.negotiations += 1;
            let fail = controls.fail_next > 0;
            if fail {
                controls.fail_next -= 1;
            }
            (controls.hang, fail)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(VoiceError::Negotiation {
                message: "loopback negotiation refused".to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(defaults::LINK_QUEUE_MESSAGES);
        let (media_tx, media_rx) = mpsc::channel(defaults::MEDIA_QUEUE_FRAMES);

        let peer = LoopbackPeer {
            session_id: session.session_id.clone(),
            client_events: out_rx,
            inbound: in_tx,
            media: media_rx,
        };
        if self.peers.send(peer).is_err() {
            tracing::debug!("Loopback remote dropped");
        }

        Ok(PeerLink::new(
            session.session_id.clone(),
            out_tx,
            in_rx,
            media_tx,
        ))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

/// Provider side of one loopback link. Dropping it interrupts the link.
pub struct LoopbackPeer {
    session_id: String,
    client_events: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<LinkMessage>,
    media: mpsc::Receiver<Vec<i16>>,
}

impl LoopbackPeer {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver a server event to the client.
    pub async fn send_event(&self, event: Value) -> bool {
        self.inbound
            .send(LinkMessage::Event(event.to_string()))
            .await
            .is_ok()
    }

    pub async fn send_raw(&self, text: &str) -> bool {
        self.inbound
            .send(LinkMessage::Event(text.to_string()))
            .await
            .is_ok()
    }

    pub async fn send_audio(&self, samples: Vec<i16>) -> bool {
        self.inbound.send(LinkMessage::Audio(samples)).await.is_ok()
    }

    /// Simulate a dropped connection.
    pub async fn interrupt(self, reason: &str) {
        if self
            .inbound
            .send(LinkMessage::Interrupted(reason.to_string()))
            .await
            .is_err()
        {
            tracing::debug!("Loopback link already closed");
        }
    }

    /// Next event the client wrote, parsed. `None` once the client closed.
    pub async fn next_client_event(&mut self) -> Option<Value> {
        loop {
            let text = self.client_events.recv().await?;
            match serde_json::from_str(&text) {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!(error = %e, "Client wrote invalid JSON"),
            }
        }
    }

    /// Skip client events until one of type `kind` arrives.
    pub async fn expect_event_type(&mut self, kind: &str) -> Option<Value> {
        loop {
            let event = self.next_client_event().await?;
            if event.get("type").and_then(Value::as_str) == Some(kind) {
                return Some(event);
            }
        }
    }

    pub async fn next_frame(&mut self) -> Option<Vec<i16>> {
        self.media.recv().await
    }

    /// Whether the client has closed its side of the link.
    pub fn is_client_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}
