use crate::session::Session;
use serde::Serialize;
use serde_json::{Value, json};

/// The assistant asked for a tool to run.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl FunctionCallRequest {
    /// Arguments may arrive JSON-encoded inside a string; decode when possible.
    pub fn decode_arguments(raw: Value) -> Value {
        match raw {
            Value::String(text) if text.trim().is_empty() => json!({}),
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            Value::Null => json!({}),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

/// Exactly one of these is sent back per `call_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

impl FunctionCallResult {
    pub fn success(request: &FunctionCallRequest, payload: Value) -> Self {
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
            outcome: ToolOutcome::Success(payload),
        }
    }

    pub fn error(request: &FunctionCallRequest, message: impl Into<String>) -> Self {
        Self {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The `output` string carried by the event channel.
    pub fn output_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success(Value::String(text)) => text.clone(),
            ToolOutcome::Success(payload) => payload.to_string(),
            ToolOutcome::Error(message) => json!({ "error": message }).to_string(),
        }
    }
}

/// Identifiers forwarded to every tool endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbientContext {
    pub session_id: String,
    pub tenant_id: String,
    pub kiosk_id: String,
    pub member_id: Option<String>,
}

impl AmbientContext {
    pub fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            tenant_id: session.context.tenant_id.clone(),
            kiosk_id: session.context.kiosk_id.clone(),
            member_id: session.context.member_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> FunctionCallRequest {
        FunctionCallRequest {
            call_id: "call_1".to_string(),
            tool_name: "book_class".to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn test_decode_string_encoded_arguments() {
        let decoded = FunctionCallRequest::decode_arguments(json!("{\"class_id\":\"yoga-7\"}"));
        assert_eq!(decoded, json!({"class_id": "yoga-7"}));
    }

    #[test]
    fn test_decode_keeps_undecodable_string() {
        let decoded = FunctionCallRequest::decode_arguments(json!("not json"));
        assert_eq!(decoded, json!("not json"));
    }

    #[test]
    fn test_decode_empty_and_null_become_empty_object() {
        assert_eq!(FunctionCallRequest::decode_arguments(json!("")), json!({}));
        assert_eq!(FunctionCallRequest::decode_arguments(Value::Null), json!({}));
    }

    #[test]
    fn test_output_text() {
        let ok = FunctionCallResult::success(&request(), json!({"booked": true}));
        assert_eq!(ok.output_text(), r#"{"booked":true}"#);
        assert!(!ok.is_error());

        let plain = FunctionCallResult::success(&request(), json!("done"));
        assert_eq!(plain.output_text(), "done");

        let err = FunctionCallResult::error(&request(), "class full");
        assert_eq!(err.output_text(), r#"{"error":"class full"}"#);
        assert!(err.is_error());
        assert_eq!(err.call_id, "call_1");
    }
}
