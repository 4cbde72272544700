//! Session provisioning.

use crate::config::ProviderConfig;
use crate::defaults;
use crate::error::{CredentialFailure, Result, VoiceError};
use crate::retry::RetryPolicy;
use crate::session::types::{Session, SessionContext};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Creates sessions against a provisioning endpoint.
///
/// Implementations keep no per-session state between calls.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, context: &SessionContext) -> Result<Session>;
}

/// Provisioning over HTTP. The upstream API key is sent as a bearer token.
pub struct HttpSessionFactory {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ProvisionRequest<'a> {
    tenant_id: &'a str,
    kiosk_id: &'a str,
    member_id: Option<&'a str>,
    model: &'a str,
    voice: &'a str,
    locale: &'a str,
    instructions: String,
}

#[derive(Deserialize)]
struct ProvisionResponse {
    #[serde(alias = "id")]
    session_id: Option<String>,
    client_secret: Option<ClientSecret>,
    ephemeral_key: Option<String>,
    expires_at: Option<i64>,
    model: Option<String>,
    voice: Option<String>,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: Option<i64>,
}

impl HttpSessionFactory {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(provider: &ProviderConfig) -> Result<Self> {
        Self::new(
            provider.provision_url.clone(),
            provider.api_key.clone(),
            Duration::from_secs(provider.timeout_secs),
        )
    }
}

#[async_trait::async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create_session(&self, context: &SessionContext) -> Result<Session> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                VoiceError::credential(CredentialFailure::Rejected, "no upstream API key configured")
            })?;

        let body = ProvisionRequest {
            tenant_id: &context.tenant_id,
            kiosk_id: &context.kiosk_id,
            member_id: context.member_id.as_deref(),
            model: &context.options.model,
            voice: &context.options.voice,
            locale: &context.options.locale,
            instructions: context.rendered_instructions(),
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            tenant_id = %context.tenant_id,
            kiosk_id = %context.kiosk_id,
            "Requesting realtime session"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                VoiceError::credential(CredentialFailure::Transient, format!("request: {}", e))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            VoiceError::credential(CredentialFailure::Transient, format!("body: {}", e))
        })?;

        if !status.is_success() {
            return Err(VoiceError::credential(
                CredentialFailure::Rejected,
                format!("status {}: {}", status, truncate(&text, 200)),
            ));
        }

        let session = parse_provisioning(&text, context, Utc::now())?;
        tracing::info!(
            session_id = %session.session_id,
            model = %session.model,
            expires_at = %session.expires_at,
            "Realtime session provisioned"
        );
        Ok(session)
    }
}

/// Build a session from a provisioning response body.
///
/// Accepts `{session_id|id, client_secret: {value, expires_at}}` and the
/// flat `{session_id, ephemeral_key, expires_at}` form.
pub fn parse_provisioning(
    body: &str,
    context: &SessionContext,
    now: DateTime<Utc>,
) -> Result<Session> {
    let response: ProvisionResponse = serde_json::from_str(body).map_err(|e| {
        VoiceError::credential(CredentialFailure::Malformed, format!("invalid JSON: {}", e))
    })?;

    let session_id = response
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| VoiceError::credential(CredentialFailure::Malformed, "missing session id"))?;

    let (credential, expires_at) = match response.client_secret {
        Some(secret) => (secret.value, secret.expires_at.or(response.expires_at)),
        None => (
            response.ephemeral_key.unwrap_or_default(),
            response.expires_at,
        ),
    };
    if credential.is_empty() {
        return Err(VoiceError::credential(
            CredentialFailure::Malformed,
            "missing ephemeral credential",
        ));
    }

    let expires_at = match expires_at {
        Some(secs) => DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            VoiceError::credential(
                CredentialFailure::Malformed,
                format!("expiry out of range: {}", secs),
            )
        })?,
        None => now + ChronoDuration::seconds(defaults::SESSION_TTL_SECS),
    };

    Ok(Session {
        session_id,
        ephemeral_credential: credential,
        model: response
            .model
            .unwrap_or_else(|| context.options.model.clone()),
        voice: response
            .voice
            .unwrap_or_else(|| context.options.voice.clone()),
        expires_at,
        context: context.clone(),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Create a session, retrying transient failures with exponential backoff.
pub async fn create_session_with_retry(
    factory: &dyn SessionFactory,
    context: &SessionContext,
    policy: &RetryPolicy,
) -> Result<Session> {
    let mut attempt = 1;
    loop {
        match factory.create_session(context).await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_retryable() && policy.allows_retry_after(attempt) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Session provisioning failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Mock session factory for testing
pub struct MockSessionFactory {
    failures: Mutex<VecDeque<(CredentialFailure, String)>>,
    ttl: ChronoDuration,
    calls: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            ttl: ChronoDuration::seconds(defaults::SESSION_TTL_SECS),
            calls: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Fail the next call with the given kind before succeeding.
    pub fn with_failure(self, kind: CredentialFailure, message: &str) -> Self {
        self.fail_next(kind, message);
        self
    }

    /// Queue a failure for a later call, after the factory is in use.
    pub fn fail_next(&self, kind: CredentialFailure, message: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back((kind, message.to_string()));
        }
    }

    /// Lifetime of created sessions. Negative values produce expired sessions.
    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Shared counter of `create_session` calls.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create_session(&self, context: &SessionContext) -> Result<Session> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failure = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some((kind, message)) = failure {
            return Err(VoiceError::credential(kind, message));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Session {
            session_id: format!("sess_mock_{}", n),
            ephemeral_credential: format!("ek_mock_{}", n),
            model: context.options.model.clone(),
            voice: context.options.voice.clone(),
            expires_at: Utc::now() + self.ttl,
            context: context.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext::new("gym-1", "kiosk-7").with_member("m-42", Some("Camille".into()))
    }

    #[test]
    fn test_parse_nested_client_secret() {
        let now = Utc::now();
        let body = r#"{
            "id": "sess_abc",
            "model": "gpt-4o-realtime-preview",
            "voice": "verse",
            "client_secret": {"value": "ek_123", "expires_at": 1900000000}
        }"#;

        let session = parse_provisioning(body, &context(), now).unwrap();

        assert_eq!(session.session_id, "sess_abc");
        assert_eq!(session.ephemeral_credential, "ek_123");
        assert_eq!(session.voice, "verse");
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);
        assert_eq!(session.context.member_id.as_deref(), Some("m-42"));
    }

    #[test]
    fn test_parse_flat_form_defaults_model_and_expiry() {
        let now = Utc::now();
        let body = r#"{"session_id": "sess_flat", "ephemeral_key": "ek_flat"}"#;

        let session = parse_provisioning(body, &context(), now).unwrap();

        assert_eq!(session.session_id, "sess_flat");
        assert_eq!(session.ephemeral_credential, "ek_flat");
        assert_eq!(session.model, context().options.model);
        assert_eq!(
            session.expires_at,
            now + ChronoDuration::seconds(defaults::SESSION_TTL_SECS)
        );
    }

    #[test]
    fn test_parse_rejects_missing_credential() {
        let result = parse_provisioning(r#"{"id": "sess_1"}"#, &context(), Utc::now());
        match result {
            Err(VoiceError::Credential { kind, message }) => {
                assert_eq!(kind, CredentialFailure::Malformed);
                assert!(message.contains("credential"));
            }
            other => panic!("Expected Malformed credential error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_session_id() {
        let result = parse_provisioning(
            r#"{"client_secret": {"value": "ek"}}"#,
            &context(),
            Utc::now(),
        );
        match result {
            Err(VoiceError::Credential { kind, .. }) => {
                assert_eq!(kind, CredentialFailure::Malformed)
            }
            other => panic!("Expected Malformed credential error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let result = parse_provisioning("<html>502</html>", &context(), Utc::now());
        assert!(matches!(
            result,
            Err(VoiceError::Credential {
                kind: CredentialFailure::Malformed,
                ..
            })
        ));
    }

    #[test]
    fn test_truncate_long_bodies() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_rejected_without_network() {
        let factory =
            HttpSessionFactory::new("http://127.0.0.1:9/unused", None, Duration::from_secs(1))
                .unwrap();

        match factory.create_session(&context()).await {
            Err(VoiceError::Credential { kind, .. }) => assert_eq!(kind, CredentialFailure::Rejected),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let factory = MockSessionFactory::new()
            .with_failure(CredentialFailure::Transient, "connect refused")
            .with_failure(CredentialFailure::Transient, "timeout");
        let calls = factory.call_counter();
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));

        let session = create_session_with_retry(&factory, &context(), &policy)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(session.session_id.starts_with("sess_mock_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let factory = MockSessionFactory::new()
            .with_failure(CredentialFailure::Transient, "one")
            .with_failure(CredentialFailure::Transient, "two")
            .with_failure(CredentialFailure::Transient, "three");
        let calls = factory.call_counter();
        let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1));

        let result = create_session_with_retry(&factory, &context(), &policy).await;

        assert!(matches!(
            result,
            Err(VoiceError::Credential {
                kind: CredentialFailure::Transient,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_fatal_failures() {
        let factory =
            MockSessionFactory::new().with_failure(CredentialFailure::Rejected, "status 401");
        let calls = factory.call_counter();
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));

        let result = create_session_with_retry(&factory, &context(), &policy).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
