//! Event channel wire format.
//!
//! Inbound messages are JSON objects with a `type` discriminant. Canonical
//! names (`transcript.delta`, `speech.started`, ...) and the OpenAI realtime
//! names map onto the same [`RealtimeEvent`] variants.

use crate::error::{Result, VoiceError};
use crate::tools::call::{FunctionCallRequest, FunctionCallResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// A parsed inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    TranscriptDelta { speaker: Speaker, text: String },
    TranscriptFinal { speaker: Speaker, text: String },
    SpeechStarted { speaker: Speaker },
    SpeechStopped { speaker: Speaker },
    FunctionCallRequested(FunctionCallRequest),
    Error { code: Option<String>, message: String },
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::TranscriptDelta { .. } => "transcript.delta",
            RealtimeEvent::TranscriptFinal { .. } => "transcript.final",
            RealtimeEvent::SpeechStarted { .. } => "speech.started",
            RealtimeEvent::SpeechStopped { .. } => "speech.stopped",
            RealtimeEvent::FunctionCallRequested(_) => "function_call.requested",
            RealtimeEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Delta(Option<Speaker>),
    Final(Option<Speaker>),
    Started(Option<Speaker>),
    Stopped(Option<Speaker>),
    FunctionCall,
    OutputItem,
    Error,
}

/// Map a wire `type` to an event kind. `Some(speaker)` when the name implies it.
fn classify(kind: &str) -> Option<Kind> {
    use Speaker::*;
    let kind = match kind {
        "transcript.delta" => Kind::Delta(None),
        "response.audio_transcript.delta"
        | "response.output_audio_transcript.delta"
        | "response.text.delta" => Kind::Delta(Some(Assistant)),
        "conversation.item.input_audio_transcription.delta" => Kind::Delta(Some(User)),

        "transcript.final" => Kind::Final(None),
        "response.audio_transcript.done"
        | "response.output_audio_transcript.done"
        | "response.text.done" => Kind::Final(Some(Assistant)),
        "conversation.item.input_audio_transcription.completed" => Kind::Final(Some(User)),

        "speech.started" => Kind::Started(None),
        "output_audio_buffer.started" => Kind::Started(Some(Assistant)),
        "input_audio_buffer.speech_started" => Kind::Started(Some(User)),

        "speech.stopped" => Kind::Stopped(None),
        "output_audio_buffer.stopped"
        | "output_audio_buffer.cleared"
        | "response.audio.done"
        | "response.output_audio.done" => Kind::Stopped(Some(Assistant)),
        "input_audio_buffer.speech_stopped" => Kind::Stopped(Some(User)),

        "function_call.requested" | "response.function_call_arguments.done" => Kind::FunctionCall,
        "response.output_item.done" => Kind::OutputItem,
        "error" => Kind::Error,
        _ => return None,
    };
    Some(kind)
}

#[derive(Deserialize)]
struct TranscriptPayload {
    #[serde(default)]
    speaker: Option<Speaker>,
    #[serde(default, alias = "delta", alias = "transcript")]
    text: String,
}

#[derive(Deserialize)]
struct BoundaryPayload {
    #[serde(default)]
    speaker: Option<Speaker>,
}

#[derive(Deserialize)]
struct FunctionCallPayload {
    call_id: String,
    #[serde(alias = "tool_name")]
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct OutputItemPayload {
    item: OutputItem,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn protocol(message: impl Into<String>) -> VoiceError {
    VoiceError::Protocol {
        message: message.into(),
    }
}

fn payload<T: for<'de> Deserialize<'de>>(value: Value, kind: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| protocol(format!("invalid {} event: {}", kind, e)))
}

/// Parse one raw event channel message.
///
/// `Ok(None)` for well-formed events of a type nobody handles.
pub fn parse_event(raw: &str) -> Result<Option<RealtimeEvent>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| protocol(format!("invalid JSON: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| protocol("missing event type"))?
        .to_string();

    let Some(classified) = classify(&kind) else {
        return Ok(None);
    };

    let event = match classified {
        Kind::Delta(implied) => {
            let p: TranscriptPayload = payload(value, &kind)?;
            RealtimeEvent::TranscriptDelta {
                speaker: implied.or(p.speaker).unwrap_or(Speaker::Assistant),
                text: p.text,
            }
        }
        Kind::Final(implied) => {
            let p: TranscriptPayload = payload(value, &kind)?;
            RealtimeEvent::TranscriptFinal {
                speaker: implied.or(p.speaker).unwrap_or(Speaker::Assistant),
                text: p.text,
            }
        }
        Kind::Started(implied) => {
            let p: BoundaryPayload = payload(value, &kind)?;
            RealtimeEvent::SpeechStarted {
                speaker: implied.or(p.speaker).unwrap_or(Speaker::Assistant),
            }
        }
        Kind::Stopped(implied) => {
            let p: BoundaryPayload = payload(value, &kind)?;
            RealtimeEvent::SpeechStopped {
                speaker: implied.or(p.speaker).unwrap_or(Speaker::Assistant),
            }
        }
        Kind::FunctionCall => {
            let p: FunctionCallPayload = payload(value, &kind)?;
            RealtimeEvent::FunctionCallRequested(FunctionCallRequest {
                call_id: p.call_id,
                tool_name: p.name,
                arguments: FunctionCallRequest::decode_arguments(p.arguments),
            })
        }
        Kind::OutputItem => {
            let p: OutputItemPayload = payload(value, &kind)?;
            if p.item.kind != "function_call" {
                return Ok(None);
            }
            let (Some(call_id), Some(name)) = (p.item.call_id, p.item.name) else {
                return Err(protocol("function_call item without call_id or name"));
            };
            RealtimeEvent::FunctionCallRequested(FunctionCallRequest {
                call_id,
                tool_name: name,
                arguments: FunctionCallRequest::decode_arguments(p.item.arguments),
            })
        }
        Kind::Error => {
            let p: ErrorPayload = payload(value, &kind)?;
            let (nested_message, nested_code) = match p.error {
                Some(body) => (body.message, body.code),
                None => (None, None),
            };
            RealtimeEvent::Error {
                code: nested_code.or(p.code),
                message: nested_message
                    .or(p.message)
                    .unwrap_or_else(|| "unspecified provider error".to_string()),
            }
        }
    };

    Ok(Some(event))
}

/// Whether the type carries remote audio rather than a structured event.
pub fn is_audio_delta(kind: &str) -> bool {
    matches!(kind, "response.audio.delta" | "response.output_audio.delta")
}

/// Decode the base64 PCM16 payload of an audio delta event.
pub fn decode_audio_delta(value: &Value) -> Result<Vec<i16>> {
    let encoded = value
        .get("delta")
        .and_then(Value::as_str)
        .ok_or_else(|| protocol("audio delta without payload"))?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| protocol(format!("invalid audio payload: {}", e)))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Messages the client writes to the event channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

/// Conversation configuration sent once the link is up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    pub turn_detection: TurnDetection,
    pub tools: Vec<Value>,
    pub tool_choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionConfig {
    pub fn new(instructions: String, voice: String, tools: Vec<Value>) -> Self {
        Self {
            instructions,
            voice,
            modalities: vec!["audio".to_string(), "text".to_string()],
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: None,
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
            },
            tools,
            tool_choice: "auto".to_string(),
        }
    }

    pub fn with_transcription(mut self, model: Option<String>) -> Self {
        self.input_audio_transcription = model.map(|model| TranscriptionConfig { model });
        self
    }
}

impl ClientEvent {
    pub fn function_result(result: &FunctionCallResult) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: result.call_id.clone(),
                output: result.output_text(),
            },
        }
    }

    pub fn audio_append(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        ClientEvent::InputAudioAppend {
            audio: BASE64.encode(bytes),
        }
    }

    /// Serialize event to JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| protocol(format!("serialize: {}", e)))
    }
}
