// Session engine — in-flight registry, dispatch, result routing, retries and reconfiguration.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheStore};
use super::dispatch::CallbackDispatcher;
use super::handle::{RequestHandle, RequestId, RequestState};
use super::hooks::{FilterDecision, SessionHooks};
use super::pipeline::{decode_body, process_failure, process_response, Delivery, Outcome};
use super::stats::{StatsCollector, StatsSnapshot};
use crate::config::{parse_base_url, SessionConfig};
use crate::error::{RequestError, TransportError};
use crate::request::encoding::flatten_params;
use crate::request::{MultipartForm, MultipartPart, RequestDescriptor, RequestKind};
use crate::transport::{
    HttpTransportFactory, RawResponse, Transport, TransportBody, TransportCall, TransportFactory,
    TransportSettings,
};

/// Registry entry: owns the cancellation token of the live transport call.
struct InFlight {
    handle: Arc<RequestHandle>,
    attempt: u32,
    token: CancellationToken,
}

/// Where early failures (rejection, construction) are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackMode {
    /// Before `append` returns, on the caller's thread.
    Inline,
    /// On the callback task, like every other outcome.
    Queued,
}

struct CacheSlot {
    key: CacheKey,
    ttl: Duration,
}

struct EngineInner {
    config: RwLock<SessionConfig>,
    base_url: RwLock<Option<Url>>,
    hooks: Arc<SessionHooks>,
    factory: Arc<dyn TransportFactory>,
    transport: RwLock<Arc<dyn Transport>>,
    registry: Mutex<HashMap<RequestId, InFlight>>,
    held: Mutex<VecDeque<Arc<RequestHandle>>>,
    cache: CacheStore,
    dispatcher: CallbackDispatcher,
    stats: StatsCollector,
    runtime: Handle,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for (_, entry) in self.registry.get_mut().drain() {
            entry.token.cancel();
        }
    }
}

/// Dispatches request handles to the transport and routes every outcome
/// through the result pipeline exactly once per attempt.
///
/// Cheap to clone; clones share the same registry, cache and transport.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

/// Transport factory that always hands out the same instance.
struct FixedTransport(Arc<dyn Transport>);

impl TransportFactory for FixedTransport {
    fn build(&self, _settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        Ok(Arc::clone(&self.0))
    }
}

fn settings_of(config: &SessionConfig) -> TransportSettings {
    TransportSettings {
        timeout: config.timeout(),
        max_connections_per_host: config.max_connections_per_host,
    }
}

/// Remove the entry left by failed attempt `retry_of`, if it is still there.
fn release_slot(
    registry: &mut HashMap<RequestId, InFlight>,
    id: RequestId,
    retry_of: Option<u32>,
) -> bool {
    let Some(previous) = retry_of else {
        return true;
    };
    match registry.get(&id) {
        Some(entry) if entry.attempt == previous => {
            registry.remove(&id);
            true
        }
        _ => false,
    }
}

/// Configures a [`SessionEngine`]; created by [`SessionEngine::builder`].
pub struct SessionEngineBuilder {
    config: SessionConfig,
    hooks: SessionHooks,
    factory: Option<Arc<dyn TransportFactory>>,
    runtime: Option<Handle>,
}

impl SessionEngineBuilder {
    /// Replace the default (pass-through) hooks.
    pub fn hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Factory used for the initial transport and every rebuild.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use one transport instance; rebuilds hand back the same instance.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.factory = Some(Arc::new(FixedTransport(transport)));
        self
    }

    /// Runtime that runs transport calls and callbacks. Defaults to the
    /// runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the config, build the transport and open the cache.
    pub fn build(self) -> Result<SessionEngine> {
        let base_url = self.config.validate()?;
        let runtime = match self.runtime {
            Some(rt) => rt,
            None => Handle::try_current().context("session engine requires a tokio runtime")?,
        };
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(HttpTransportFactory));
        let transport = factory
            .build(&settings_of(&self.config))
            .context("failed to build transport")?;

        let cache = {
            let _guard = runtime.enter();
            CacheStore::open(self.config.cache_root())?
        };
        let dispatcher = CallbackDispatcher::spawn(&runtime);

        info!(
            "session engine ready: base_url={} timeout={}s max_per_host={} cache={}",
            base_url.as_ref().map_or("<none>", Url::as_str),
            self.config.timeout_secs,
            self.config.max_connections_per_host,
            cache.root().display()
        );

        Ok(SessionEngine {
            inner: Arc::new(EngineInner {
                config: RwLock::new(self.config),
                base_url: RwLock::new(base_url),
                hooks: Arc::new(self.hooks),
                factory,
                transport: RwLock::new(transport),
                registry: Mutex::new(HashMap::new()),
                held: Mutex::new(VecDeque::new()),
                cache,
                dispatcher,
                stats: StatsCollector::new(),
                runtime,
            }),
        })
    }
}

impl SessionEngine {
    pub fn builder(config: SessionConfig) -> SessionEngineBuilder {
        SessionEngineBuilder {
            config,
            hooks: SessionHooks::default(),
            factory: None,
            runtime: None,
        }
    }

    /// Engine with default hooks and the reqwest transport.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Submit a handle for dispatch.
    ///
    /// Policy rejections and construction failures are delivered before this
    /// returns. A cacheable request with a live cache entry additionally gets
    /// a success flagged as cached ahead of the network result.
    pub fn append(&self, handle: &Arc<RequestHandle>) {
        self.append_with(Arc::clone(handle), CallbackMode::Inline, None);
    }

    /// `retry_of` names the failed attempt whose registry entry is still
    /// held for this handle. That entry stays claimable by `cancel` until it
    /// is replaced by the new attempt or released on an early exit.
    fn append_with(&self, handle: Arc<RequestHandle>, mode: CallbackMode, retry_of: Option<u32>) {
        if retry_of.is_none() && self.is_registered(handle.id()) {
            warn!("request {} already in flight, append ignored", handle.id());
            return;
        }

        let original = handle.id();
        let handle = match (self.inner.hooks.filter)(Arc::clone(&handle)) {
            FilterDecision::Proceed(h) => h,
            FilterDecision::Defer => {
                debug!("request {} deferred by filter", original);
                let mut registry = self.inner.registry.lock();
                if retry_of.is_some() && !release_slot(&mut registry, original, retry_of) {
                    debug!("request {} cancelled before it could be deferred", original);
                    return;
                }
                if retry_of.is_none() {
                    handle.reset_completion();
                }
                handle.set_state(RequestState::Deferred);
                self.inner.held.lock().push_back(handle);
                return;
            }
            FilterDecision::Drop => {
                debug!("request {} dropped by filter", original);
                self.release_retry(original, retry_of);
                return;
            }
        };

        // A substitute starts its own lifecycle; the retried handle's slot goes away.
        let retry_of = if handle.id() == original {
            retry_of
        } else {
            if !self.release_retry(original, retry_of) {
                return;
            }
            None
        };
        let id = handle.id();
        if retry_of.is_none() {
            handle.reset_completion();
        }

        if let Some(err) = (self.inner.hooks.allow)(&handle) {
            debug!("request {} rejected: {}", id, err);
            if !self.release_retry(id, retry_of) {
                return;
            }
            handle.set_state(RequestState::Failed);
            if handle.try_complete() {
                let inner = Arc::clone(&self.inner);
                self.run_callback(mode, move || {
                    let delivery = process_failure(&inner.hooks, handle.descriptor(), err);
                    inner.finish(&handle, delivery);
                });
            }
            return;
        }

        let (call, url) = match self.build_call(handle.descriptor()) {
            Ok(built) => built,
            Err(err) => {
                warn!("request {} construction failed: {}", id, err);
                if !self.release_retry(id, retry_of) {
                    return;
                }
                handle.set_state(RequestState::Failed);
                if handle.try_complete() {
                    let inner = Arc::clone(&self.inner);
                    self.run_callback(mode, move || {
                        inner.finish(&handle, Delivery::Deliver(Outcome::Failure(err)));
                    });
                }
                return;
            }
        };

        let token = CancellationToken::new();
        let attempt = {
            let mut registry = self.inner.registry.lock();
            match retry_of {
                Some(previous) => {
                    if !registry.get(&id).is_some_and(|e| e.attempt == previous) {
                        debug!("request {} cancelled before retry dispatch", id);
                        return;
                    }
                }
                None => {
                    if registry.contains_key(&id) {
                        warn!("request {} registered concurrently, append ignored", id);
                        return;
                    }
                }
            }
            let attempt = handle.begin_attempt();
            registry.insert(
                id,
                InFlight {
                    handle: Arc::clone(&handle),
                    attempt,
                    token: token.clone(),
                },
            );
            attempt
        };
        self.inner.stats.record_dispatched();
        debug!(
            "request {} attempt {}: {} {} ({} headers, {} params)",
            id,
            attempt,
            call.method,
            call.url,
            call.headers.len(),
            handle.descriptor().params().len()
        );

        let cache_slot = self.cache_slot(handle.descriptor(), &url);
        if let Some(slot) = &cache_slot {
            let hit = self.inner.cache.get(&slot.key);
            self.inner.stats.record_cache_lookup(hit.is_some());
            if let Some(body) = hit {
                debug!("request {} cache hit {}/{}", id, slot.key.group(), slot.key.hash());
                let inner = Arc::clone(&self.inner);
                let cached = Arc::clone(&handle);
                self.inner
                    .dispatcher
                    .submit(move || inner.deliver_cached(&cached, &body));
            }
        }

        let transport = Arc::clone(&*self.inner.transport.read());
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!("request {} attempt {} cancelled in flight", id, attempt);
                    return;
                }
                result = transport.execute(call) => result,
            };
            match weak.upgrade() {
                Some(inner) => SessionEngine { inner }.handle_result(id, attempt, result, cache_slot),
                None => debug!("request {} finished after engine shutdown", id),
            }
        });
    }

    /// Resolve the URL and run the header, signature and encryption hooks,
    /// then encode the parameters for the request's variant.
    fn build_call(&self, desc: &RequestDescriptor) -> Result<(TransportCall, Url), RequestError> {
        let base = self.inner.base_url.read().clone();
        let url = desc.resolve_url(base.as_ref())?;

        let hooks = &self.inner.hooks;
        let headers = (hooks.build_headers)(desc, desc.headers().clone());
        let mut params = desc.params().clone();
        if let Some((key, value)) = (hooks.signature)(&headers, &params) {
            params.insert(key, Value::String(value));
        }
        let params = (hooks.encrypt)(desc, params);

        let (call_url, body) = match desc.kind() {
            RequestKind::Standard => {
                let encoded = desc.encoding().encode(desc.method(), url.clone(), &params)?;
                let body = encoded
                    .body
                    .map_or(TransportBody::Empty, TransportBody::Encoded);
                (encoded.url, body)
            }
            RequestKind::Multipart(form) => {
                let mut parts: Vec<MultipartPart> = flatten_params(&params)
                    .into_iter()
                    .map(|(name, value)| MultipartPart::text(name, value))
                    .collect();
                parts.extend(form.parts.iter().cloned());
                let form = MultipartForm {
                    parts,
                    progress: form.progress.clone(),
                };
                (url.clone(), TransportBody::Multipart(form))
            }
        };

        let call = TransportCall {
            method: desc.method().clone(),
            url: call_url,
            headers,
            body,
        };
        Ok((call, url))
    }

    fn cache_slot(&self, desc: &RequestDescriptor, url: &Url) -> Option<CacheSlot> {
        let config = self.inner.config.read();
        if !config.use_cache || !desc.is_cacheable() {
            return None;
        }
        let ttl = desc.cache_policy().max_age.min(config.max_cache_ttl());
        if ttl.is_zero() {
            return None;
        }
        Some(CacheSlot {
            key: CacheKey::for_request(desc, url),
            ttl,
        })
    }

    fn run_callback<F>(&self, mode: CallbackMode, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match mode {
            CallbackMode::Inline => job(),
            CallbackMode::Queued => self.inner.dispatcher.submit(job),
        }
    }

    /// Route a transport outcome. Whoever removes the registry entry first
    /// owns the terminal outcome; a late result is dropped silently. A failed
    /// attempt keeps its entry until the retry decision is made, so `cancel`
    /// can still claim the handle in between.
    fn handle_result(
        &self,
        id: RequestId,
        attempt: u32,
        result: Result<RawResponse, TransportError>,
        cache_slot: Option<CacheSlot>,
    ) {
        let success = matches!(&result, Ok(raw) if raw.is_success());
        let handle = {
            let mut registry = self.inner.registry.lock();
            match registry.get(&id) {
                Some(entry) if entry.attempt == attempt => {
                    if success {
                        registry.remove(&id).map(|e| e.handle)
                    } else {
                        Some(Arc::clone(&entry.handle))
                    }
                }
                _ => None,
            }
        };
        let Some(handle) = handle else {
            debug!("request {} attempt {} result dropped: no longer registered", id, attempt);
            return;
        };

        let error = match result {
            Ok(raw) if raw.is_success() => {
                self.on_success(handle, raw, cache_slot);
                return;
            }
            Ok(raw) => RequestError::Status {
                code: raw.status,
                body: String::from_utf8_lossy(&raw.body).into_owned(),
            },
            Err(err) => RequestError::from(err),
        };
        self.on_failure(handle, attempt, error);
    }

    fn on_success(&self, handle: Arc<RequestHandle>, raw: RawResponse, cache_slot: Option<CacheSlot>) {
        if !handle.try_complete() {
            return;
        }
        handle.set_state(RequestState::Succeeded);
        debug!("request {} received {} bytes (HTTP {})", handle.id(), raw.body.len(), raw.status);

        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.submit(move || {
            let desc = handle.descriptor();
            let (delivery, body) = match decode_body(desc, &raw.body) {
                Ok(body) => (process_response(&inner.hooks, desc, &body, false), Some(body)),
                Err(err) => (process_failure(&inner.hooks, desc, err), None),
            };
            if let (Some(slot), Some(body)) = (cache_slot, body) {
                if delivery.is_success() {
                    inner.cache.put(&slot.key, body, slot.ttl);
                    inner.stats.record_cache_write();
                }
            }
            inner.finish(&handle, delivery);
        });
    }

    /// `attempt` still owns the registry entry on entry here.
    fn on_failure(&self, handle: Arc<RequestHandle>, attempt: u32, error: RequestError) {
        let id = handle.id();
        if error.is_retryable_kind() && self.should_retry(&handle, &error) {
            {
                let registry = self.inner.registry.lock();
                if !registry.get(&id).is_some_and(|e| e.attempt == attempt) {
                    debug!("request {} cancelled during retry decision", id);
                    return;
                }
                handle.set_state(RequestState::Retrying);
            }
            self.inner.stats.record_retried();
            info!("request {} attempt {} failed ({}), retrying", id, attempt, error);
            self.append_with(handle, CallbackMode::Queued, Some(attempt));
            return;
        }

        if !self.release_retry(id, Some(attempt)) {
            debug!("request {} cancelled before failure delivery", id);
            return;
        }
        if !handle.try_complete() {
            return;
        }
        handle.set_state(RequestState::Failed);
        debug!("request {} attempt {} failed: {}", id, attempt, error);

        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.submit(move || {
            let delivery = process_failure(&inner.hooks, handle.descriptor(), error);
            inner.finish(&handle, delivery);
        });
    }

    /// Drop the entry a failed attempt left behind. Returns `false` when a
    /// cancel already claimed it; always `true` for a fresh append.
    fn release_retry(&self, id: RequestId, retry_of: Option<u32>) -> bool {
        release_slot(&mut self.inner.registry.lock(), id, retry_of)
    }

    fn should_retry(&self, handle: &RequestHandle, error: &RequestError) -> bool {
        match handle.retry_policy() {
            Some(policy) => policy(error),
            None => (self.inner.hooks.should_retry)(error),
        }
    }

    /// Cancel a registered or held handle. Returns `false` (and does nothing)
    /// when the handle already reached its outcome.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let id = handle.id();
        let removed = self.inner.registry.lock().remove(&id);
        let target = match removed {
            Some(entry) => {
                entry.token.cancel();
                entry.handle
            }
            None => match self.take_held(id) {
                Some(held) => held,
                None => {
                    debug!("cancel of request {} ignored: not outstanding", id);
                    return false;
                }
            },
        };
        self.inner.cancel_handle(target)
    }

    fn take_held(&self, id: RequestId) -> Option<Arc<RequestHandle>> {
        let mut held = self.inner.held.lock();
        let pos = held.iter().position(|h| h.id() == id)?;
        held.remove(pos)
    }

    /// Cancel every in-flight and held request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<InFlight> = self
            .inner
            .registry
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let held: Vec<Arc<RequestHandle>> = self.inner.held.lock().drain(..).collect();

        let mut cancelled = 0;
        for entry in entries {
            entry.token.cancel();
            if self.inner.cancel_handle(entry.handle) {
                cancelled += 1;
            }
        }
        for handle in held {
            if self.inner.cancel_handle(handle) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("cancelled {} outstanding requests", cancelled);
        }
        cancelled
    }

    /// Re-append every held handle in arrival order.
    pub fn resume_held(&self) -> usize {
        let held: Vec<Arc<RequestHandle>> = self.inner.held.lock().drain(..).collect();
        let count = held.len();
        if count > 0 {
            debug!("resuming {} held requests", count);
        }
        for handle in held {
            self.append_with(handle, CallbackMode::Inline, None);
        }
        count
    }

    pub fn cancel_held(&self) -> usize {
        let held: Vec<Arc<RequestHandle>> = self.inner.held.lock().drain(..).collect();
        held.into_iter()
            .filter(|handle| self.inner.cancel_handle(Arc::clone(handle)))
            .count()
    }

    /// Cancel everything, then rebuild the transport with the new timeout.
    pub fn set_timeout(&self, timeout_secs: u64) -> Result<()> {
        if timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        self.reconfigure(|config| config.timeout_secs = timeout_secs)
    }

    /// Cancel everything, then rebuild the transport with the new limit.
    pub fn set_max_connections_per_host(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(anyhow!("max_connections_per_host must be > 0"));
        }
        self.reconfigure(|config| config.max_connections_per_host = max)
    }

    /// The new values only become visible once the rebuilt transport is in place.
    fn reconfigure<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SessionConfig),
    {
        let mut staged = self.inner.config.read().clone();
        apply(&mut staged);
        let settings = settings_of(&staged);

        let cancelled = self.cancel_all();
        let transport = self
            .inner
            .factory
            .build(&settings)
            .context("failed to rebuild transport")?;
        {
            let mut config = self.inner.config.write();
            config.timeout_secs = staged.timeout_secs;
            config.max_connections_per_host = staged.max_connections_per_host;
        }
        *self.inner.transport.write() = transport;
        info!(
            "transport rebuilt: timeout={}s max_per_host={} ({} requests cancelled)",
            settings.timeout.as_secs(),
            settings.max_connections_per_host,
            cancelled
        );
        Ok(())
    }

    /// Validate and swap the base URL. An invalid URL changes nothing.
    pub fn reset_base_url(&self, raw: &str) -> Result<()> {
        let url = parse_base_url(raw)?;
        self.cancel_all();
        self.inner.config.write().base_url = Some(raw.to_string());
        info!("base url reset to {}", url);
        *self.inner.base_url.write() = Some(url);
        Ok(())
    }

    pub fn base_url(&self) -> Option<Url> {
        self.inner.base_url.read().clone()
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    pub fn hooks(&self) -> &SessionHooks {
        &self.inner.hooks
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.in_flight())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn is_registered(&self, id: RequestId) -> bool {
        self.inner.registry.lock().contains_key(&id)
    }

    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }
}

impl EngineInner {
    /// Cache hits never claim the terminal outcome; the live result follows.
    fn deliver_cached(&self, handle: &RequestHandle, body: &str) {
        if handle.state() == RequestState::Cancelled {
            return;
        }
        match process_response(&self.hooks, handle.descriptor(), body, true) {
            Delivery::Deliver(outcome) => handle.deliver(&outcome),
            Delivery::Ignored => debug!("request {} cached result ignored", handle.id()),
        }
    }

    fn finish(&self, handle: &RequestHandle, delivery: Delivery) {
        handle.set_state(RequestState::Terminal);
        match delivery {
            Delivery::Ignored => {
                self.stats.record_ignored();
                debug!("request {} result ignored", handle.id());
            }
            Delivery::Deliver(outcome) => {
                match &outcome {
                    Outcome::Success { .. } => self.stats.record_succeeded(),
                    Outcome::Failure(_) => self.stats.record_failed(),
                    Outcome::Cancelled => self.stats.record_cancelled(),
                }
                handle.deliver(&outcome);
            }
        }
    }

    fn cancel_handle(&self, handle: Arc<RequestHandle>) -> bool {
        if !handle.try_complete() {
            return false;
        }
        handle.set_state(RequestState::Cancelled);
        self.stats.record_cancelled();
        debug!("request {} cancelled", handle.id());
        self.dispatcher
            .submit(move || handle.deliver(&Outcome::Cancelled));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn execute(&self, _call: TransportCall) -> Result<RawResponse, TransportError> {
            std::future::pending().await
        }
    }

    fn engine(hooks: SessionHooks) -> SessionEngine {
        let dir = std::env::temp_dir().join("request_engine_session_unit");
        let config = SessionConfig {
            base_url: Some("https://api.example.com".to_string()),
            cache_dir: dir.to_string_lossy().into_owned(),
            ..SessionConfig::default()
        };
        SessionEngine::builder(config)
            .hooks(hooks)
            .transport(Arc::new(Silent))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_signature_is_added_before_encrypt() {
        let hooks = SessionHooks::default()
            .with_build_headers(|_, mut headers| {
                headers.insert("x-app".to_string(), "demo".to_string());
                headers
            })
            .with_signature(|headers, params| {
                assert_eq!(headers.get("x-app").map(String::as_str), Some("demo"));
                Some(("sign".to_string(), format!("n{}", params.len())))
            })
            .with_encrypt(|_, params| {
                assert!(params.contains_key("sign"));
                params
            });
        let engine = engine(hooks);
        let desc = RequestDescriptor::get("post").param("a", 1).build();

        let (call, url) = engine.build_call(&desc).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/post");
        assert_eq!(call.url.as_str(), "https://api.example.com/post?a=1&sign=n1");
        assert_eq!(call.headers.get("x-app").map(String::as_str), Some("demo"));
    }

    #[tokio::test]
    async fn test_multipart_puts_params_before_parts() {
        let engine = engine(SessionHooks::default());
        let desc = RequestDescriptor::post("upload")
            .param("album", "trip")
            .part(MultipartPart::file("file", "a.png", "image/png", &b"png"[..]))
            .build();

        let (call, _) = engine.build_call(&desc).unwrap();
        let TransportBody::Multipart(form) = call.body else {
            panic!("expected multipart body");
        };
        let names: Vec<&str> = form.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["album", "file"]);
    }

    #[tokio::test]
    async fn test_cache_ttl_capped_by_session() {
        let engine = engine(SessionHooks::default());
        let desc = RequestDescriptor::get("post")
            .cache(Duration::from_secs(30 * 24 * 3600))
            .build();
        let url = Url::parse("https://api.example.com/post").unwrap();
        let slot = engine.cache_slot(&desc, &url).unwrap();
        assert_eq!(slot.ttl, engine.config().max_cache_ttl());

        let post = RequestDescriptor::post("post").cache(Duration::from_secs(60)).build();
        assert!(engine.cache_slot(&post, &url).is_none());
    }
}
