use kiosk_voice::error::{CredentialFailure, VoiceError};
use kiosk_voice::retry::RetryPolicy;
use kiosk_voice::session::{
    HttpSessionFactory, SessionContext, SessionFactory, create_session_with_retry,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context() -> SessionContext {
    SessionContext::new("gym-1", "kiosk-7").with_member("m-42", Some("Camille".to_string()))
}

fn factory(server: &MockServer, api_key: Option<&str>) -> HttpSessionFactory {
    HttpSessionFactory::new(
        format!("{}/v1/realtime/sessions", server.uri()),
        api_key.map(str::to_string),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn credential_kind(error: &VoiceError) -> Option<CredentialFailure> {
    match error {
        VoiceError::Credential { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_provisioning_posts_context_and_parses_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/realtime/sessions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .and(body_partial_json(json!({
            "tenant_id": "gym-1",
            "kiosk_id": "kiosk-7",
            "member_id": "m-42",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess_live_1",
            "model": "gpt-4o-realtime-preview",
            "voice": "verse",
            "client_secret": {"value": "ek_live", "expires_at": 4102444800_i64}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = factory(&server, Some("sk-upstream"))
        .create_session(&context())
        .await
        .unwrap();

    assert_eq!(session.session_id, "sess_live_1");
    assert_eq!(session.ephemeral_credential, "ek_live");
    assert_eq!(session.voice, "verse");
    assert_eq!(session.context.member_id.as_deref(), Some("m-42"));
    assert!(!session.is_expired());
}

#[tokio::test]
async fn test_provisioning_sends_rendered_instructions() {
    let server = MockServer::start().await;
    let mut context = context();
    context.options.instructions = "Greet {member_name}".to_string();

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"instructions": "Greet Camille"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": "sess_2",
            "ephemeral_key": "ek_flat",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = factory(&server, Some("key"))
        .create_session(&context)
        .await
        .unwrap();
    assert_eq!(session.ephemeral_credential, "ek_flat");
}

#[tokio::test]
async fn test_missing_api_key_fails_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = factory(&server, None)
        .create_session(&context())
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Rejected));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_non_success_status_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = factory(&server, Some("bad"))
        .create_session(&context())
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Rejected));
    assert!(err.to_string().contains("invalid api key"));
}

#[tokio::test]
async fn test_body_without_credential_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "sess_3"})))
        .mount(&server)
        .await;

    let err = factory(&server, Some("key"))
        .create_session(&context())
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Malformed));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transient() {
    // Bind then release a port so nothing is listening on it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let factory = HttpSessionFactory::new(
        format!("http://127.0.0.1:{}/sessions", port),
        Some("key".to_string()),
        Duration::from_millis(500),
    )
    .unwrap();
    let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10));

    let err = create_session_with_retry(&factory, &context(), &policy)
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Transient));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_timed_out_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "sess_slow", "client_secret": {"value": "ek"}}))
                .set_delay(Duration::from_secs(2)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let factory = HttpSessionFactory::new(
        format!("{}/v1/realtime/sessions", server.uri()),
        Some("key".to_string()),
        Duration::from_millis(100),
    )
    .unwrap();
    let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10));

    let err = create_session_with_retry(&factory, &context(), &policy)
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Transient));
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
    let err = create_session_with_retry(&factory(&server, Some("key")), &context(), &policy)
        .await
        .unwrap_err();
    assert_eq!(credential_kind(&err), Some(CredentialFailure::Rejected));
}
