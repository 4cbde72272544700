use kiosk_voice::audio::recorder::{MicrophoneStats, MockMicrophone};
use kiosk_voice::detector::{
    ChannelRecognizer, Recognizer, RecognizerEvent, RecognizerFeed, UtteranceForwarder,
};
use kiosk_voice::engine::{
    EndReason, EngineConfig, Observed, RecordingObserver, SessionSummary, VoiceEngine,
    VoiceEngineBuilder,
};
use kiosk_voice::error::{CredentialFailure, VoiceError};
use kiosk_voice::retry::RetryPolicy;
use kiosk_voice::session::{MockSessionFactory, SessionContext};
use kiosk_voice::tools::{AmbientContext, FnToolHandler, ToolHandler, ToolRegistry};
use kiosk_voice::transport::{ConnectionState, LoopbackPeer, LoopbackRemote, LoopbackTransport};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

const WAIT: Duration = Duration::from_secs(5);

struct Kiosk {
    engine: VoiceEngine,
    remote: LoopbackRemote,
    observer: RecordingObserver,
    factory: Arc<MockSessionFactory>,
    provisioned: Arc<AtomicUsize>,
    microphone: Arc<MicrophoneStats>,
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));
    config.reconnect = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));
    config.tool_timeout = Duration::from_millis(500);
    config.frame = Duration::from_millis(20);
    config
}

fn kiosk_with(
    factory: MockSessionFactory,
    customize: impl FnOnce(VoiceEngineBuilder) -> VoiceEngineBuilder,
) -> Kiosk {
    let provisioned = factory.call_counter();
    let factory = Arc::new(factory);
    let microphone = MockMicrophone::new();
    let stats = microphone.stats();
    let (transport, remote) = LoopbackTransport::new();
    let observer = RecordingObserver::new();

    let builder = VoiceEngine::builder(
        Arc::clone(&factory) as Arc<dyn kiosk_voice::SessionFactory>,
        Arc::new(transport),
        Arc::new(microphone),
    )
        .with_config(fast_config())
        .with_observer(observer.clone());

    Kiosk {
        engine: customize(builder).spawn(),
        remote,
        observer,
        factory,
        provisioned,
        microphone: stats,
    }
}

fn kiosk() -> Kiosk {
    kiosk_with(MockSessionFactory::new(), |b| b)
}

fn member() -> SessionContext {
    SessionContext::new("gym-1", "kiosk-7").with_member("m-42", Some("Camille".to_string()))
}

async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_peer(remote: &mut LoopbackRemote) -> LoopbackPeer {
    within("peer link", remote.next_peer())
        .await
        .expect("transport dropped")
}

async fn expect_event(peer: &mut LoopbackPeer, kind: &str) -> Value {
    within(kind, peer.expect_event_type(kind))
        .await
        .unwrap_or_else(|| panic!("link closed before {kind}"))
}

/// Every event the client wrote until it closed the link.
async fn remaining_events(peer: &mut LoopbackPeer) -> Vec<Value> {
    let mut events = Vec::new();
    while let Some(event) = within("link close", peer.next_client_event()).await {
        events.push(event);
    }
    events
}

fn function_output_for<'a>(events: &'a [Value], call_id: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e["type"] == "conversation.item.create" && e["item"]["call_id"] == call_id)
        .collect()
}

/// Tool that blocks until released.
struct GatedTool {
    entered: Arc<AtomicUsize>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl ToolHandler for GatedTool {
    fn name(&self) -> &str {
        "book_class"
    }

    async fn invoke(
        &self,
        _arguments: Value,
        _context: &AmbientContext,
    ) -> kiosk_voice::Result<Value> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(json!({"booked": true}))
    }
}

/// Recognizer whose first `stop` waits for the test, holding the detector
/// between matching a phrase and reporting it.
struct HeldStopRecognizer {
    inner: ChannelRecognizer,
    stopping: Arc<AtomicBool>,
    gate: Option<oneshot::Receiver<()>>,
}

#[async_trait::async_trait]
impl Recognizer for HeldStopRecognizer {
    async fn start(&mut self) -> kiosk_voice::Result<()> {
        self.inner.start().await
    }

    async fn stop(&mut self) {
        if let Some(gate) = self.gate.take() {
            self.stopping.store(true, Ordering::SeqCst);
            gate.await.ok();
        }
        self.inner.stop().await;
    }

    async fn next_event(&mut self) -> RecognizerEvent {
        self.inner.next_event().await
    }
}

fn summaries(observer: &RecordingObserver) -> Vec<SessionSummary> {
    observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Observed::SessionEnded(summary) => Some(summary),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_session_connects_and_configures_conversation() {
    let mut kiosk = kiosk();

    let session_id = kiosk.engine.start_session(member()).await.unwrap();
    assert_eq!(session_id, "sess_mock_1");
    assert_eq!(kiosk.engine.state(), ConnectionState::Connected);

    let mut peer = next_peer(&mut kiosk.remote).await;
    assert_eq!(peer.session_id(), "sess_mock_1");
    let setup = expect_event(&mut peer, "session.update").await;
    assert!(
        setup["session"]["instructions"]
            .as_str()
            .unwrap()
            .contains("Camille")
    );
    assert_eq!(setup["session"]["turn_detection"]["type"], "server_vad");

    let statuses = kiosk.observer.statuses();
    assert_eq!(
        statuses,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(
        kiosk
            .observer
            .count(|e| *e == Observed::SessionCreated("sess_mock_1".to_string())),
        1
    );
    assert_eq!(kiosk.microphone.active(), 1);

    kiosk.engine.shutdown().await.unwrap();
    assert_eq!(kiosk.microphone.active(), 0);
}

#[tokio::test]
async fn test_interruption_reconnects_with_same_session() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    peer.interrupt("network blip").await;

    let mut replacement = next_peer(&mut kiosk.remote).await;
    assert_eq!(replacement.session_id(), "sess_mock_1");
    expect_event(&mut replacement, "session.update").await;

    let observer = kiosk.observer.clone();
    eventually("reconnected state", || {
        let statuses = observer.statuses();
        statuses.ends_with(&[ConnectionState::Reconnecting, ConnectionState::Connected])
    })
    .await;

    assert_eq!(kiosk.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(kiosk.remote.negotiations(), 2);
    assert!(kiosk.microphone.peak_active() <= 1);
    assert!(summaries(&kiosk.observer).is_empty());

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_reconnect_ends_session_as_failed() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    kiosk.remote.fail_next(10);
    peer.interrupt("gone").await;

    let observer = kiosk.observer.clone();
    eventually("session end", || !summaries(&observer).is_empty()).await;

    let summary = &summaries(&kiosk.observer)[0];
    assert!(matches!(summary.reason, EndReason::Failed(_)));
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);
    assert_eq!(kiosk.observer.count(|e| matches!(e, Observed::Error(_))), 1);
    assert_eq!(kiosk.microphone.active(), 0);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_tool_gets_exactly_one_error_result() {
    let registry = {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnToolHandler::new("check_in", |_, ctx| {
            Ok(json!({"checked_in": true, "member": ctx.member_id}))
        })));
        registry
    };
    let mut kiosk = kiosk_with(MockSessionFactory::new(), |b| b.with_tools(registry));
    kiosk.engine.start_session(member()).await.unwrap();
    let mut peer = next_peer(&mut kiosk.remote).await;

    let unknown = json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_1",
        "name": "teleport",
        "arguments": "{}"
    });
    assert!(peer.send_event(unknown.clone()).await);

    let result = expect_event(&mut peer, "conversation.item.create").await;
    assert_eq!(result["item"]["call_id"], "call_1");
    assert!(
        result["item"]["output"]
            .as_str()
            .unwrap()
            .contains("unknown tool: teleport")
    );
    expect_event(&mut peer, "response.create").await;

    // A replayed call id is ignored; the next output belongs to call_2.
    assert!(peer.send_event(unknown).await);
    assert!(
        peer.send_event(json!({
            "type": "response.function_call_arguments.done",
            "call_id": "call_2",
            "name": "check_in",
            "arguments": {}
        }))
        .await
    );
    let result = expect_event(&mut peer, "conversation.item.create").await;
    assert_eq!(result["item"]["call_id"], "call_2");
    let output: Value = serde_json::from_str(result["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output, json!({"checked_in": true, "member": "m-42"}));

    assert!(kiosk.engine.state().is_active());
    kiosk.engine.stop_session().await.unwrap();

    let summary = &summaries(&kiosk.observer)[0];
    assert_eq!(summary.function_calls, 2);
    assert_eq!(summary.reason, EndReason::Stopped);
    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::FunctionCall { .. })),
        2
    );

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_listening_and_speaking_are_exclusive() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    assert!(kiosk.engine.set_listening(true).await.unwrap());
    assert_eq!(kiosk.engine.state(), ConnectionState::Listening);

    assert!(peer.send_event(json!({"type": "output_audio_buffer.started"})).await);
    within("speaking", kiosk.engine.wait_for_state(ConnectionState::Speaking))
        .await
        .unwrap();

    assert!(!kiosk.engine.set_listening(true).await.unwrap());
    assert_eq!(kiosk.engine.state(), ConnectionState::Speaking);

    assert!(peer.send_event(json!({"type": "output_audio_buffer.stopped"})).await);
    within("connected", kiosk.engine.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap();
    assert!(kiosk.engine.set_listening(true).await.unwrap());

    let overlapping = kiosk.observer.count(|e| match e {
        Observed::Audio(state) => state.is_listening && state.is_playing,
        _ => false,
    });
    assert_eq!(overlapping, 0);
    assert!(kiosk.observer.count(|e| matches!(e, Observed::Audio(s) if s.is_playing)) >= 1);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transcripts_reach_observer_and_summary() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    for event in [
        json!({"type": "response.audio_transcript.delta", "delta": "Bonjour "}),
        json!({"type": "response.audio_transcript.delta", "delta": "Camille"}),
        json!({"type": "response.audio_transcript.done", "transcript": "Bonjour Camille"}),
        json!({"type": "not.a.known.event"}),
    ] {
        assert!(peer.send_event(event).await);
    }
    assert!(peer.send_raw("{not json").await);

    let observer = kiosk.observer.clone();
    eventually("final transcript", || {
        observer.count(|e| {
            matches!(e, Observed::Transcript { is_final: true, text } if text == "Bonjour Camille")
        }) == 1
    })
    .await;
    assert!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::Transcript { is_final: false, .. }))
            >= 1
    );

    kiosk.engine.stop_session().await.unwrap();
    let summary = &summaries(&kiosk.observer)[0];
    assert_eq!(summary.transcript.len(), 1);
    assert_eq!(summary.transcript[0].text, "Bonjour Camille");
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);

    kiosk.engine.shutdown().await.unwrap();
}

fn with_detection(
    feed: &RecognizerFeed,
    recognizer: ChannelRecognizer,
) -> impl FnOnce(VoiceEngineBuilder) -> VoiceEngineBuilder {
    let forward = feed.clone();
    move |builder| {
        builder
            .with_recognizer(Box::new(recognizer))
            .with_subscriber_factory(move || Box::new(UtteranceForwarder::new(forward.clone())))
    }
}

#[tokio::test]
async fn test_closing_phrase_completes_conversation_once() {
    let (recognizer, feed) = ChannelRecognizer::new();
    let mut kiosk = kiosk_with(MockSessionFactory::new(), with_detection(&feed, recognizer));
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;
    eventually("recognizer start", || feed.starts() >= 1).await;

    assert!(
        peer.send_event(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "Au revoir Camille!"
        }))
        .await
    );

    let observer = kiosk.observer.clone();
    eventually("session end", || !summaries(&observer).is_empty()).await;

    // Late utterances after the session ended change nothing.
    feed.utterance("au revoir");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::ConversationComplete)),
        1
    );
    let ended = summaries(&kiosk.observer);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, EndReason::ConversationComplete);
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);
    assert_eq!(kiosk.microphone.active(), 0);
    assert!(peer.is_client_closed());

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_other_utterances_do_not_end_session() {
    let (recognizer, feed) = ChannelRecognizer::new();
    let mut kiosk = kiosk_with(MockSessionFactory::new(), with_detection(&feed, recognizer));
    kiosk.engine.start_session(member()).await.unwrap();
    let _peer = next_peer(&mut kiosk.remote).await;
    eventually("recognizer start", || feed.starts() >= 1).await;

    feed.utterance("je voudrais réserver un cours");
    feed.utterance("au revoir mon ami merci");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::ConversationComplete)),
        0
    );
    assert!(kiosk.engine.state().is_active());

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_during_connect_cancels_and_releases_microphone() {
    let kiosk = kiosk();
    kiosk.remote.set_hang(true);

    let engine = &kiosk.engine;
    let (started, stopped) = tokio::join!(engine.start_session(member()), async {
        within("connecting", engine.wait_for_state(ConnectionState::Connecting))
            .await
            .unwrap();
        engine.stop_session().await
    });

    assert!(matches!(started, Err(VoiceError::Cancelled)));
    stopped.unwrap();
    assert_eq!(engine.state(), ConnectionState::Closed);
    assert_eq!(kiosk.microphone.active(), 0);
    assert_eq!(kiosk.observer.count(|e| matches!(e, Observed::Error(_))), 0);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_negotiation_failure_is_retried() {
    let mut kiosk = kiosk();
    kiosk.remote.fail_next(2);

    kiosk.engine.start_session(member()).await.unwrap();
    let _peer = next_peer(&mut kiosk.remote).await;

    assert_eq!(kiosk.remote.negotiations(), 3);
    assert_eq!(kiosk.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(kiosk.engine.state(), ConnectionState::Connected);
    assert_eq!(kiosk.microphone.peak_active(), 1);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_provisioning_rejection_is_reported() {
    let factory =
        MockSessionFactory::new().with_failure(CredentialFailure::Rejected, "bad upstream key");
    let kiosk = kiosk_with(factory, |b| b);

    let err = kiosk.engine.start_session(member()).await.unwrap_err();
    assert!(matches!(
        err,
        VoiceError::Credential {
            kind: CredentialFailure::Rejected,
            ..
        }
    ));
    assert_eq!(kiosk.provisioned.load(Ordering::SeqCst), 1);
    assert_eq!(kiosk.microphone.opened(), 0);
    assert_eq!(kiosk.observer.count(|e| matches!(e, Observed::Error(_))), 1);
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_session_replaces_previous_with_one_microphone() {
    let mut kiosk = kiosk();

    kiosk.engine.start_session(member()).await.unwrap();
    let first = next_peer(&mut kiosk.remote).await;
    let second_id = kiosk
        .engine
        .start_session(SessionContext::new("gym-1", "kiosk-7"))
        .await
        .unwrap();
    let _second = next_peer(&mut kiosk.remote).await;

    assert_eq!(second_id, "sess_mock_2");
    assert!(first.is_client_closed());
    assert_eq!(kiosk.microphone.opened(), 2);
    assert_eq!(kiosk.microphone.peak_active(), 1);
    assert_eq!(kiosk.microphone.active(), 1);

    let ended = summaries(&kiosk.observer);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].session_id, "sess_mock_1");
    assert_eq!(ended[0].reason, EndReason::Replaced);

    kiosk.engine.shutdown().await.unwrap();
    assert_eq!(kiosk.microphone.active(), 0);
}

#[tokio::test]
async fn test_remote_session_expiry_triggers_reconnect() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    assert!(
        peer.send_event(json!({
            "type": "error",
            "error": {"code": "connection_closed", "message": "upstream closed"}
        }))
        .await
    );

    let replacement = next_peer(&mut kiosk.remote).await;
    assert_eq!(replacement.session_id(), "sess_mock_1");
    assert_eq!(kiosk.provisioned.load(Ordering::SeqCst), 1);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_handle_stops_engine() {
    let kiosk = kiosk();
    let state = kiosk.engine.subscribe_state();
    drop(kiosk.engine);

    let mut state = state;
    within("engine exit", state.changed()).await.unwrap_err();
}

#[tokio::test]
async fn test_function_call_announced_once_per_call_id() {
    let registry = {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnToolHandler::new("check_in", |_, _| {
            Ok(json!({"checked_in": true}))
        })));
        registry
    };
    let mut kiosk = kiosk_with(MockSessionFactory::new(), |b| b.with_tools(registry));
    kiosk.engine.start_session(member()).await.unwrap();
    let mut peer = next_peer(&mut kiosk.remote).await;

    // The provider reports each call twice, once per event type.
    assert!(
        peer.send_event(json!({
            "type": "response.function_call_arguments.done",
            "call_id": "c1",
            "name": "check_in",
            "arguments": "{}"
        }))
        .await
    );
    assert!(
        peer.send_event(json!({
            "type": "response.output_item.done",
            "item": {
                "type": "function_call",
                "call_id": "c1",
                "name": "check_in",
                "arguments": "{}"
            }
        }))
        .await
    );
    let first = expect_event(&mut peer, "conversation.item.create").await;
    assert_eq!(first["item"]["call_id"], "c1");

    // Link events are handled in order; once this shows up the duplicate was seen.
    assert!(
        peer.send_event(json!({"type": "response.audio_transcript.done", "transcript": "C'est fait"}))
            .await
    );
    let observer = kiosk.observer.clone();
    eventually("marker transcript", || {
        observer.count(|e| matches!(e, Observed::Transcript { is_final: true, .. })) == 1
    })
    .await;

    kiosk.engine.stop_session().await.unwrap();
    let events = remaining_events(&mut peer).await;
    assert!(function_output_for(&events, "c1").is_empty());
    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::FunctionCall { call_id, .. } if call_id == "c1")),
        1
    );
    assert_eq!(summaries(&kiosk.observer)[0].function_calls, 1);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_result_finishing_during_reconnect_is_delivered_once_on_new_link() {
    let entered = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let registry = {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(GatedTool {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        }));
        registry
    };
    let mut kiosk = kiosk_with(MockSessionFactory::new(), |b| b.with_tools(registry));
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;

    assert!(
        peer.send_event(json!({
            "type": "response.function_call_arguments.done",
            "call_id": "slow_1",
            "name": "book_class",
            "arguments": {"class": "yoga"}
        }))
        .await
    );
    eventually("tool running", || entered.load(Ordering::SeqCst) == 1).await;

    kiosk.remote.fail_next(2);
    peer.interrupt("network blip").await;
    within(
        "reconnecting",
        kiosk.engine.wait_for_state(ConnectionState::Reconnecting),
    )
    .await
    .unwrap();
    release.notify_one();

    let mut replacement = next_peer(&mut kiosk.remote).await;
    let result = expect_event(&mut replacement, "conversation.item.create").await;
    assert_eq!(result["item"]["call_id"], "slow_1");
    let output: Value = serde_json::from_str(result["item"]["output"].as_str().unwrap()).unwrap();
    assert_eq!(output, json!({"booked": true}));
    expect_event(&mut replacement, "response.create").await;

    kiosk.engine.stop_session().await.unwrap();
    let rest = remaining_events(&mut replacement).await;
    assert!(function_output_for(&rest, "slow_1").is_empty());
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!(kiosk.provisioned.load(Ordering::SeqCst), 1);

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completion_waits_until_assistant_stops_speaking() {
    let (inner, feed) = ChannelRecognizer::new();
    let stopping = Arc::new(AtomicBool::new(false));
    let (open_gate, gate) = oneshot::channel();
    let recognizer = HeldStopRecognizer {
        inner,
        stopping: Arc::clone(&stopping),
        gate: Some(gate),
    };
    let mut kiosk = kiosk_with(MockSessionFactory::new(), |b| {
        b.with_recognizer(Box::new(recognizer))
    });
    kiosk.engine.start_session(member()).await.unwrap();
    let peer = next_peer(&mut kiosk.remote).await;
    eventually("recognizer start", || feed.starts() >= 1).await;

    // Matched while connected; the assistant starts before it is reported.
    feed.utterance("au revoir");
    eventually("detector matched", || stopping.load(Ordering::SeqCst)).await;
    assert!(peer.send_event(json!({"type": "output_audio_buffer.started"})).await);
    within("speaking", kiosk.engine.wait_for_state(ConnectionState::Speaking))
        .await
        .unwrap();
    open_gate.send(()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::ConversationComplete)),
        0
    );
    assert_eq!(kiosk.engine.state(), ConnectionState::Speaking);

    assert!(peer.send_event(json!({"type": "output_audio_buffer.stopped"})).await);
    let observer = kiosk.observer.clone();
    eventually("session end", || !summaries(&observer).is_empty()).await;

    let events = kiosk.observer.events();
    let completed_at = events
        .iter()
        .position(|e| matches!(e, Observed::ConversationComplete))
        .expect("conversation completed");
    let status_before = events[..completed_at]
        .iter()
        .rev()
        .find_map(|e| match e {
            Observed::Status(state) => Some(*state),
            _ => None,
        });
    assert_eq!(status_before, Some(ConnectionState::Connected));
    assert_eq!(
        kiosk
            .observer
            .count(|e| matches!(e, Observed::ConversationComplete)),
        1
    );
    assert_eq!(
        summaries(&kiosk.observer)[0].reason,
        EndReason::ConversationComplete
    );

    kiosk.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejection_after_previous_session_reports_error_then_closed() {
    let mut kiosk = kiosk();
    kiosk.engine.start_session(member()).await.unwrap();
    let _peer = next_peer(&mut kiosk.remote).await;
    kiosk.engine.stop_session().await.unwrap();
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);
    let seen_before = kiosk.observer.statuses().len();

    kiosk
        .factory
        .fail_next(CredentialFailure::Rejected, "bad key");
    let err = kiosk.engine.start_session(member()).await.unwrap_err();
    assert!(matches!(
        err,
        VoiceError::Credential {
            kind: CredentialFailure::Rejected,
            ..
        }
    ));

    let after: Vec<_> = kiosk.observer.statuses()[seen_before..].to_vec();
    assert_eq!(after, vec![ConnectionState::Error, ConnectionState::Closed]);
    assert_eq!(kiosk.engine.state(), ConnectionState::Closed);
    assert_eq!(kiosk.observer.count(|e| matches!(e, Observed::Error(_))), 1);
    assert_eq!(kiosk.microphone.active(), 0);

    kiosk.engine.shutdown().await.unwrap();
}
