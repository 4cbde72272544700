//! Tool handlers backed by backend HTTP endpoints.

use crate::error::{Result, VoiceError};
use crate::tools::call::AmbientContext;
use crate::tools::registry::ToolHandler;
use serde::Serialize;
use serde_json::{Value, json};

pub struct HttpToolHandler {
    client: reqwest::Client,
    name: String,
    url: String,
    description: String,
    parameters: Option<Value>,
}

#[derive(Serialize)]
struct ToolRequest<'a> {
    arguments: &'a Value,
    context: &'a AmbientContext,
}

impl HttpToolHandler {
    pub fn new(client: reqwest::Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            url: url.into(),
            description: String::new(),
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Option<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn failure(&self, message: impl Into<String>) -> VoiceError {
        VoiceError::ToolDispatch {
            tool: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for HttpToolHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}))
    }

    async fn invoke(&self, arguments: Value, context: &AmbientContext) -> Result<Value> {
        tracing::debug!(tool = %self.name, url = %self.url, "Invoking tool endpoint");

        let response = self
            .client
            .post(&self.url)
            .json(&ToolRequest {
                arguments: &arguments,
                context,
            })
            .send()
            .await
            .map_err(|e| self.failure(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.failure(format!("failed to read response: {}", e)))?;
        let parsed = serde_json::from_str::<Value>(&body).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|v| v.get("error"))
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or(body);
            return Err(self.failure(format!("status {}: {}", status.as_u16(), detail)));
        }

        Ok(parsed.unwrap_or_else(|| json!({ "text": body })))
    }
}
