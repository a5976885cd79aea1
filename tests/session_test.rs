// Integration tests for SessionEngine against a scripted transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use request_engine::engine::{
    Callbacks, FilterDecision, Outcome, PreOperation, RequestHandle, RequestState, ResponseValue,
    SessionEngine, SessionHooks,
};
use request_engine::error::{RequestError, TransportError};
use request_engine::request::{RequestDescriptor, ResultFormat};
use request_engine::transport::{
    RawResponse, Transport, TransportCall, TransportFactory, TransportSettings,
};
use request_engine::SessionConfig;

const WAIT: Duration = Duration::from_secs(2);

/// One outstanding transport call; the test decides when and how it ends.
struct Pending {
    call: TransportCall,
    reply: oneshot::Sender<Result<RawResponse, TransportError>>,
}

impl Pending {
    fn respond(self, response: RawResponse) {
        let _ = self.reply.send(Ok(response));
    }
}

struct ScriptedTransport {
    calls: mpsc::UnboundedSender<Pending>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, call: TransportCall) -> Result<RawResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        if self.calls.send(Pending { call, reply }).is_err() {
            return Err(TransportError::Network("harness gone".to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(TransportError::Network("reply dropped".to_string())))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Success(ResponseValue, bool),
    Failure(RequestError),
    Complete(Outcome),
}

fn recorder() -> (Callbacks, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (s, f, c) = (tx.clone(), tx.clone(), tx);
    let callbacks = Callbacks::new()
        .on_success(move |value, is_cache| {
            let _ = s.send(Event::Success(value.clone(), is_cache));
        })
        .on_failure(move |err| {
            let _ = f.send(Event::Failure(err.clone()));
        })
        .on_complete(move |outcome| {
            let _ = c.send(Event::Complete(outcome.clone()));
        });
    (callbacks, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected callback: {:?}", event);
    }
}

fn text(s: &str) -> ResponseValue {
    ResponseValue::Text(s.to_string())
}

fn status(code: u16, body: &'static str) -> RawResponse {
    RawResponse {
        status: code,
        headers: Default::default(),
        body: Bytes::from_static(body.as_bytes()),
    }
}

fn config(dir: &TempDir) -> SessionConfig {
    SessionConfig {
        base_url: Some("https://api.example.com".to_string()),
        cache_dir: dir.path().to_string_lossy().into_owned(),
        ..SessionConfig::default()
    }
}

struct Harness {
    engine: SessionEngine,
    calls: mpsc::UnboundedReceiver<Pending>,
    _dir: TempDir,
}

impl Harness {
    fn new(hooks: SessionHooks) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (tx, calls) = mpsc::unbounded_channel();
        let engine = SessionEngine::builder(config(&dir))
            .hooks(hooks)
            .transport(Arc::new(ScriptedTransport { calls: tx }))
            .build()
            .unwrap();
        Self {
            engine,
            calls,
            _dir: dir,
        }
    }

    async fn next_call(&mut self) -> Pending {
        timeout(WAIT, self.calls.recv())
            .await
            .expect("timed out waiting for transport call")
            .expect("transport channel closed")
    }

    async fn assert_no_call(&mut self) {
        if let Ok(Some(p)) = timeout(Duration::from_millis(150), self.calls.recv()).await {
            panic!("unexpected transport call to {}", p.call.url);
        }
    }
}

#[tokio::test]
async fn test_live_success_delivers_once() {
    let mut h = Harness::new(SessionHooks::default());
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(
        RequestDescriptor::get("/post").param("id", 7).build(),
        callbacks,
    );

    h.engine.append(&handle);
    assert!(h.engine.is_registered(handle.id()));

    let pending = h.next_call().await;
    assert_eq!(pending.call.url.as_str(), "https://api.example.com/post?id=7");
    pending.respond(RawResponse::ok("hello"));

    assert_eq!(next_event(&mut events).await, Event::Success(text("hello"), false));
    assert_eq!(
        next_event(&mut events).await,
        Event::Complete(Outcome::Success {
            value: text("hello"),
            is_cache: false
        })
    );
    assert_quiet(&mut events).await;

    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(handle.state(), RequestState::Terminal);
    assert_eq!(handle.attempts(), 1);
    let stats = h.engine.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn test_allow_rejection_fires_before_append_returns() {
    let hooks = SessionHooks::default().with_allow(|handle| {
        if handle.descriptor().headers().contains_key("authorization") {
            None
        } else {
            Some(RequestError::rejected("missing auth"))
        }
    });
    let mut h = Harness::new(hooks);
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("me").build(), callbacks);

    h.engine.append(&handle);

    assert_eq!(
        events.try_recv().unwrap(),
        Event::Failure(RequestError::rejected("missing auth"))
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        Event::Complete(Outcome::Failure(RequestError::Rejected(_)))
    ));
    h.assert_no_call().await;
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(handle.attempts(), 0);
    assert_eq!(h.engine.stats().dispatched, 0);
}

#[tokio::test]
async fn test_construction_failure_is_not_retried() {
    let retries = Arc::new(AtomicUsize::new(0));
    let counter = retries.clone();
    let hooks = SessionHooks::default().with_should_retry(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });
    let mut h = Harness::new(hooks);
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(
        RequestDescriptor::get("").url("::not a url::").build(),
        callbacks,
    );

    h.engine.append(&handle);

    assert!(matches!(
        events.try_recv().unwrap(),
        Event::Failure(RequestError::Construction(_))
    ));
    h.assert_no_call().await;
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cached_result_arrives_before_live_call() {
    let mut h = Harness::new(SessionHooks::default());
    let request = || {
        RequestDescriptor::get("/post")
            .param("page", 1)
            .cache(Duration::from_secs(7 * 24 * 3600))
            .build()
    };

    // First call: live round trip populates the cache.
    let (callbacks, mut first_events) = recorder();
    let first = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&first);
    h.next_call().await.respond(RawResponse::ok("payload"));
    assert_eq!(
        next_event(&mut first_events).await,
        Event::Success(text("payload"), false)
    );

    // Second call: cached success fires while the live call is still open.
    let (callbacks, mut second_events) = recorder();
    let second = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&second);
    assert_eq!(
        next_event(&mut second_events).await,
        Event::Success(text("payload"), true)
    );
    assert_eq!(
        next_event(&mut second_events).await,
        Event::Complete(Outcome::Success {
            value: text("payload"),
            is_cache: true
        })
    );

    let live = h.next_call().await;
    assert!(h.engine.is_registered(second.id()));
    live.respond(RawResponse::ok("payload v2"));
    assert_eq!(
        next_event(&mut second_events).await,
        Event::Success(text("payload v2"), false)
    );

    let stats = h.engine.stats();
    assert_eq!(stats.cache_hits, 1);
    // Both live successes refresh the entry.
    assert_eq!(stats.cache_writes, 2);
    assert_eq!(stats.dispatched, 2);
}

#[tokio::test]
async fn test_failed_result_is_not_cached() {
    let mut h = Harness::new(SessionHooks::default());
    let request = || {
        RequestDescriptor::get("item")
            .result_format(ResultFormat::Json)
            .cache(Duration::from_secs(60))
            .build()
    };

    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&handle);
    h.next_call().await.respond(RawResponse::ok("<html>oops</html>"));
    assert!(matches!(
        next_event(&mut events).await,
        Event::Failure(RequestError::Conversion(_))
    ));

    let (callbacks, mut events) = recorder();
    let again = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&again);
    let live = h.next_call().await;
    assert_quiet(&mut events).await;
    live.respond(RawResponse::ok(r#"{"id":1}"#));
    assert_eq!(
        next_event(&mut events).await,
        Event::Success(ResponseValue::Json(serde_json::json!({"id": 1})), false)
    );
    assert_eq!(h.engine.stats().cache_writes, 1);
}

#[tokio::test]
async fn test_pre_operation_ignore_suppresses_all_callbacks() {
    let hooks = SessionHooks::default().with_pre_operation(|_, value, error, _| {
        let superseded = value.as_ref().and_then(ResponseValue::as_text) == Some("superseded");
        if superseded {
            PreOperation::Ignore
        } else {
            PreOperation::Deliver { value, error }
        }
    });
    let mut h = Harness::new(hooks);
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("feed").build(), callbacks);

    h.engine.append(&handle);
    h.next_call().await.respond(RawResponse::ok("superseded"));

    assert_quiet(&mut events).await;
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(h.engine.stats().ignored, 1);
}

#[tokio::test]
async fn test_status_error_reaches_failure_callback() {
    let mut h = Harness::new(SessionHooks::default());
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("missing").build(), callbacks);

    h.engine.append(&handle);
    h.next_call().await.respond(status(404, "not found"));

    assert_eq!(
        next_event(&mut events).await,
        Event::Failure(RequestError::Status {
            code: 404,
            body: "not found".to_string()
        })
    );
    assert!(matches!(
        next_event(&mut events).await,
        Event::Complete(Outcome::Failure(_))
    ));
    assert_eq!(h.engine.stats().failed, 1);
}

#[tokio::test]
async fn test_cancel_twice_fires_once() {
    let mut h = Harness::new(SessionHooks::default());
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("slow").build(), callbacks);

    h.engine.append(&handle);
    let pending = h.next_call().await;

    assert!(h.engine.cancel(&handle));
    assert!(!h.engine.cancel(&handle));
    assert_eq!(next_event(&mut events).await, Event::Complete(Outcome::Cancelled));

    // A late result for the cancelled attempt is dropped.
    pending.respond(RawResponse::ok("late"));
    assert_quiet(&mut events).await;

    assert_eq!(handle.state(), RequestState::Cancelled);
    assert_eq!(h.engine.cancel_all(), 0);
    assert_eq!(h.engine.stats().cancelled, 1);
}

#[tokio::test]
async fn test_cancel_all_drains_registry() {
    let mut h = Harness::new(SessionHooks::default());
    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for i in 0..3 {
        let (callbacks, events) = recorder();
        let handle =
            RequestHandle::with_callbacks(RequestDescriptor::get(format!("item/{}", i)).build(), callbacks);
        h.engine.append(&handle);
        receivers.push(events);
        handles.push(handle);
    }
    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(h.next_call().await);
    }
    assert_eq!(h.engine.in_flight(), 3);

    assert_eq!(h.engine.cancel_all(), 3);
    assert_eq!(h.engine.in_flight(), 0);
    for events in receivers.iter_mut() {
        assert_eq!(next_event(events).await, Event::Complete(Outcome::Cancelled));
    }

    for p in pending {
        p.respond(RawResponse::ok("late"));
    }
    for events in receivers.iter_mut() {
        assert_quiet(events).await;
    }
    for handle in &handles {
        assert!(!h.engine.cancel(handle));
    }
}

#[tokio::test]
async fn test_retry_dispatches_second_attempt() {
    let mut h = Harness::new(SessionHooks::default());
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("flaky").build(), callbacks);
    handle.set_retry_policy(|err| err.status() == Some(503));

    h.engine.append(&handle);
    h.next_call().await.respond(status(503, "busy"));

    let second = h.next_call().await;
    assert_eq!(second.call.url.as_str(), "https://api.example.com/flaky");
    assert_eq!(handle.attempts(), 2);
    assert!(h.engine.is_registered(handle.id()));
    assert_quiet(&mut events).await;

    second.respond(RawResponse::ok("recovered"));
    assert_eq!(next_event(&mut events).await, Event::Success(text("recovered"), false));
    assert!(matches!(
        next_event(&mut events).await,
        Event::Complete(Outcome::Success { .. })
    ));
    assert_quiet(&mut events).await;

    let stats = h.engine.stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_session_retry_hook_stops_when_policy_declines() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let hooks = SessionHooks::default().with_should_retry(move |_| seen.fetch_add(1, Ordering::SeqCst) < 1);
    let mut h = Harness::new(hooks);
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("down").build(), callbacks);

    h.engine.append(&handle);
    h.next_call().await.respond(status(500, "boom"));
    h.next_call().await.respond(status(500, "boom again"));

    assert_eq!(
        next_event(&mut events).await,
        Event::Failure(RequestError::Status {
            code: 500,
            body: "boom again".to_string()
        })
    );
    assert_eq!(handle.attempts(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_held_queue_resume_and_cancel() {
    let token_ready = Arc::new(AtomicBool::new(false));
    let ready = token_ready.clone();
    let hooks = SessionHooks::default().with_filter(move |handle| {
        if ready.load(Ordering::SeqCst) {
            FilterDecision::Proceed(handle)
        } else {
            FilterDecision::Defer
        }
    });
    let mut h = Harness::new(hooks);

    let (callbacks, mut parked_events) = recorder();
    let parked = RequestHandle::with_callbacks(RequestDescriptor::get("profile").build(), callbacks);
    let (callbacks, mut dropped_events) = recorder();
    let dropped = RequestHandle::with_callbacks(RequestDescriptor::get("avatar").build(), callbacks);

    h.engine.append(&parked);
    h.engine.append(&dropped);
    assert_eq!(h.engine.held_count(), 2);
    assert_eq!(parked.state(), RequestState::Deferred);
    h.assert_no_call().await;

    assert!(h.engine.cancel(&dropped));
    assert_eq!(
        next_event(&mut dropped_events).await,
        Event::Complete(Outcome::Cancelled)
    );
    assert_eq!(h.engine.held_count(), 1);

    token_ready.store(true, Ordering::SeqCst);
    assert_eq!(h.engine.resume_held(), 1);
    assert_eq!(h.engine.held_count(), 0);

    let pending = h.next_call().await;
    assert_eq!(pending.call.url.as_str(), "https://api.example.com/profile");
    pending.respond(RawResponse::ok("me"));
    assert_eq!(next_event(&mut parked_events).await, Event::Success(text("me"), false));
}

#[tokio::test]
async fn test_filter_substitutes_handle() {
    let hooks = SessionHooks::default().with_filter(|handle| {
        if handle.descriptor().path() == "v1/list" {
            FilterDecision::Proceed(RequestHandle::new(RequestDescriptor::get("v2/list").build()))
        } else if handle.descriptor().path() == "blocked" {
            FilterDecision::Drop
        } else {
            FilterDecision::Proceed(handle)
        }
    });
    let mut h = Harness::new(hooks);
    let (callbacks, mut events) = recorder();
    let blocked = RequestHandle::with_callbacks(RequestDescriptor::get("blocked").build(), callbacks);

    h.engine.append(&blocked);
    h.assert_no_call().await;
    assert_quiet(&mut events).await;

    let legacy = RequestHandle::new(RequestDescriptor::get("v1/list").build());
    h.engine.append(&legacy);
    let pending = h.next_call().await;
    assert_eq!(pending.call.url.as_str(), "https://api.example.com/v2/list");
    assert!(!h.engine.is_registered(legacy.id()));
}

struct CountingFactory {
    builds: AtomicUsize,
    settings: Mutex<Vec<TransportSettings>>,
    calls: mpsc::UnboundedSender<Pending>,
}

impl TransportFactory for CountingFactory {
    fn build(&self, settings: &TransportSettings) -> anyhow::Result<Arc<dyn Transport>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.settings.lock().push(*settings);
        Ok(Arc::new(ScriptedTransport {
            calls: self.calls.clone(),
        }))
    }
}

#[tokio::test]
async fn test_reconfigure_cancels_and_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let factory = Arc::new(CountingFactory {
        builds: AtomicUsize::new(0),
        settings: Mutex::new(Vec::new()),
        calls: tx,
    });
    let engine = SessionEngine::builder(config(&dir))
        .transport_factory(factory.clone())
        .build()
        .unwrap();
    assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("post").build(), callbacks);
    engine.append(&handle);
    let _pending = timeout(WAIT, calls.recv()).await.unwrap().unwrap();

    engine.set_timeout(5).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Complete(Outcome::Cancelled));
    assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    assert_eq!(
        factory.settings.lock().last().map(|s| s.timeout),
        Some(Duration::from_secs(5))
    );

    engine.set_max_connections_per_host(2).unwrap();
    assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    assert_eq!(
        factory.settings.lock().last().map(|s| s.max_connections_per_host),
        Some(2)
    );
    assert!(engine.set_max_connections_per_host(0).is_err());
    assert_eq!(factory.builds.load(Ordering::SeqCst), 3);

    assert!(engine.reset_base_url("ftp://files.example.com").is_err());
    assert_eq!(
        engine.base_url().map(|u| u.to_string()),
        Some("https://api.example.com/".to_string())
    );
    engine.reset_base_url("https://v2.example.com/").unwrap();

    let next = RequestHandle::new(RequestDescriptor::get("post").build());
    engine.append(&next);
    let pending = timeout(WAIT, calls.recv()).await.unwrap().unwrap();
    assert_eq!(pending.call.url.as_str(), "https://v2.example.com/post");
}

#[tokio::test]
async fn test_cancel_during_retry_decision_wins() {
    let mut h = Harness::new(SessionHooks::default());
    let (callbacks, mut events) = recorder();
    let handle = RequestHandle::with_callbacks(RequestDescriptor::get("flaky").build(), callbacks);

    // The caller cancels while the engine is still deciding whether to retry.
    let cancelled = Arc::new(AtomicBool::new(false));
    let (engine, target, flag) = (h.engine.clone(), Arc::downgrade(&handle), cancelled.clone());
    handle.set_retry_policy(move |_| {
        if let Some(handle) = target.upgrade() {
            flag.store(engine.cancel(&handle), Ordering::SeqCst);
        }
        true
    });

    h.engine.append(&handle);
    h.next_call().await.respond(status(503, "busy"));

    assert_eq!(next_event(&mut events).await, Event::Complete(Outcome::Cancelled));
    assert!(cancelled.load(Ordering::SeqCst));
    h.assert_no_call().await;
    assert_quiet(&mut events).await;

    assert!(!h.engine.is_registered(handle.id()));
    assert_eq!(handle.state(), RequestState::Cancelled);
    assert_eq!(handle.attempts(), 1);
    assert!(!h.engine.cancel(&handle));
    let stats = h.engine.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.cancelled, 1);
}

#[tokio::test]
async fn test_cancel_before_cached_hit_is_delivered() {
    let mut h = Harness::new(SessionHooks::default());
    let request = || {
        RequestDescriptor::get("/post")
            .param("page", 2)
            .cache(Duration::from_secs(3600))
            .build()
    };

    let (callbacks, mut first_events) = recorder();
    let first = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&first);
    h.next_call().await.respond(RawResponse::ok("payload"));
    assert_eq!(
        next_event(&mut first_events).await,
        Event::Success(text("payload"), false)
    );

    // The cached hit is queued by append; the cancel lands before it runs.
    let (callbacks, mut events) = recorder();
    let second = RequestHandle::with_callbacks(request(), callbacks);
    h.engine.append(&second);
    assert!(h.engine.cancel(&second));

    assert_eq!(next_event(&mut events).await, Event::Complete(Outcome::Cancelled));
    assert_quiet(&mut events).await;
    assert_eq!(h.engine.stats().cache_hits, 1);
    assert_eq!(second.state(), RequestState::Cancelled);
}

struct FailingRebuild {
    builds: AtomicUsize,
    calls: mpsc::UnboundedSender<Pending>,
}

impl TransportFactory for FailingRebuild {
    fn build(&self, _settings: &TransportSettings) -> anyhow::Result<Arc<dyn Transport>> {
        if self.builds.fetch_add(1, Ordering::SeqCst) > 0 {
            anyhow::bail!("tls backend unavailable");
        }
        Ok(Arc::new(ScriptedTransport {
            calls: self.calls.clone(),
        }))
    }
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let factory = Arc::new(FailingRebuild {
        builds: AtomicUsize::new(0),
        calls: tx,
    });
    let original = config(&dir);
    let engine = SessionEngine::builder(original.clone())
        .transport_factory(factory.clone())
        .build()
        .unwrap();

    assert!(engine.set_timeout(original.timeout_secs + 7).is_err());
    assert!(engine
        .set_max_connections_per_host(original.max_connections_per_host + 3)
        .is_err());
    assert_eq!(factory.builds.load(Ordering::SeqCst), 3);

    let current = engine.config();
    assert_eq!(current.timeout_secs, original.timeout_secs);
    assert_eq!(current.max_connections_per_host, original.max_connections_per_host);

    // The previous transport is still the one in use.
    let handle = RequestHandle::new(RequestDescriptor::get("post").build());
    engine.append(&handle);
    let pending = timeout(WAIT, calls.recv()).await.unwrap().unwrap();
    assert_eq!(pending.call.url.as_str(), "https://api.example.com/post");
}
