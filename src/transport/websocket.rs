//! Realtime transport over a WebSocket.
//!
//! Microphone frames travel as base64 PCM16 `input_audio_buffer.append`
//! events; remote audio arrives as `response.audio.delta` events.

use crate::config::ProviderConfig;
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::events::protocol::{ClientEvent, decode_audio_delta, is_audio_delta};
use crate::session::Session;
use crate::transport::peer::{LinkMessage, PeerLink, PeerTransport};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(provider: &ProviderConfig) -> Self {
        Self::new(provider.realtime_url.clone())
    }

    fn endpoint(&self, model: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, model)
    }
}

fn negotiation(message: impl Into<String>) -> VoiceError {
    VoiceError::Negotiation {
        message: message.into(),
    }
}

#[async_trait::async_trait]
impl PeerTransport for WebSocketTransport {
    async fn negotiate(&self, session: &Session) -> Result<PeerLink> {
        let endpoint = self.endpoint(&session.model);
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| negotiation(format!("bad endpoint {}: {}", endpoint, e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.ephemeral_credential))
            .map_err(|e| negotiation(format!("invalid credential header: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        tracing::debug!(endpoint = %endpoint, session_id = %session.session_id, "Opening realtime socket");

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| negotiation(format!("connect failed: {}", e)))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(defaults::LINK_QUEUE_MESSAGES);
        let (media_tx, media_rx) = mpsc::channel(defaults::MEDIA_QUEUE_FRAMES);

        let task = tokio::spawn(run_socket(socket, out_rx, media_rx, in_tx));

        Ok(PeerLink::new(session.session_id.clone(), out_tx, in_rx, media_tx).with_task(task))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_socket(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut media: mpsc::Receiver<Vec<i16>>,
    inbound: mpsc::Sender<LinkMessage>,
) {
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break format!("send failed: {}", e);
                    }
                }
                None => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "Socket close failed");
                    }
                    return;
                }
            },
            Some(frame) = media.recv() => {
                let text = match ClientEvent::audio_append(&frame).to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode audio frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break format!("send failed: {}", e);
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(classify(text)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("socket error: {}", e),
                None => break "socket ended".to_string(),
            },
        }
    };

    tracing::warn!(reason = %reason, "Realtime socket interrupted");
    if inbound.send(LinkMessage::Interrupted(reason)).await.is_err() {
        tracing::trace!("Link dropped before interruption was reported");
    }
}

/// Split remote audio out of the event stream.
fn classify(text: String) -> LinkMessage {
    if !text.contains("audio.delta") {
        return LinkMessage::Event(text);
    }
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return LinkMessage::Event(text);
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if !is_audio_delta(kind) {
        return LinkMessage::Event(text);
    }
    match decode_audio_delta(&value) {
        Ok(samples) => LinkMessage::Audio(samples),
        Err(e) => {
            tracing::debug!(error = %e, "Dropping undecodable audio delta");
            LinkMessage::Audio(Vec::new())
        }
    }
}
