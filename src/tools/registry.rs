use crate::config::ToolsConfig;
use crate::error::{Result, VoiceError};
use crate::tools::call::AmbientContext;
use crate::tools::http::HttpToolHandler;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A capability the assistant may invoke.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, arguments: Value, context: &AmbientContext) -> Result<Value>;
}

/// Registered capability set, keyed by tool name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP handlers for every configured endpoint.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Other(format!("Failed to build HTTP client: {}", e)))?;

        let mut registry = Self::new();
        for endpoint in &config.endpoints {
            let url = match (&endpoint.url, &config.base_url) {
                (Some(url), _) => url.clone(),
                (None, Some(base)) => format!("{}/{}", base.trim_end_matches('/'), endpoint.name),
                (None, None) => {
                    return Err(VoiceError::ConfigInvalidValue {
                        key: format!("tools.endpoints.{}", endpoint.name),
                        message: "needs a url or tools.base_url".to_string(),
                    });
                }
            };
            let handler = HttpToolHandler::new(client.clone(), &endpoint.name, url)
                .with_description(&endpoint.description)
                .with_parameters(endpoint.parameters.clone());
            registry.register(Arc::new(handler));
        }
        Ok(registry)
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        if self.tools.insert(name.clone(), handler).is_some() {
            tracing::warn!(tool = %name, "Replacing registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool declarations for the `session.update` event, sorted by name.
    pub fn schemas_for_session(&self) -> Vec<Value> {
        self.names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters(),
                })
            })
            .collect()
    }
}

/// Handler backed by a closure, for tests and in-process tools.
pub struct FnToolHandler<F> {
    name: String,
    func: F,
}

impl<F> FnToolHandler<F>
where
    F: Fn(Value, &AmbientContext) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait::async_trait]
impl<F> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value, &AmbientContext) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, arguments: Value, context: &AmbientContext) -> Result<Value> {
        (self.func)(arguments, context)
    }
}
