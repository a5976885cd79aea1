// Request handle — identity, callbacks and lifecycle state of one logical request.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::hooks::RetryFn;
use super::pipeline::{Outcome, ResponseValue};
use crate::error::RequestError;
use crate::request::RequestDescriptor;

/// Registry key; unique for the lifetime of the process.
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub type SuccessFn = Arc<dyn Fn(&ResponseValue, bool) + Send + Sync>;
pub type FailureFn = Arc<dyn Fn(&RequestError) + Send + Sync>;
pub type CompletionFn = Arc<dyn Fn(&Outcome) + Send + Sync>;

/// Lifecycle of a handle.
///
/// `Built -> Dispatched -> {Succeeded, Failed, Cancelled}`; a failure may go
/// `Retrying -> Dispatched`; `Succeeded`/`Failed` end in `Terminal` once the
/// pipeline has run. `Deferred` means parked by the filter hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Built,
    Deferred,
    Dispatched,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
    Terminal,
}

/// User callbacks. Success/failure are mutually exclusive; completion fires
/// for every terminal outcome including cancellation.
#[derive(Clone, Default)]
pub struct Callbacks {
    success: Option<SuccessFn>,
    failure: Option<FailureFn>,
    completion: Option<CompletionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResponseValue, bool) + Send + Sync + 'static,
    {
        self.success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestError) + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Outcome) + Send + Sync + 'static,
    {
        self.completion = Some(Arc::new(f));
        self
    }
}

pub struct RequestHandle {
    id: RequestId,
    descriptor: RequestDescriptor,
    callbacks: Mutex<Callbacks>,
    retry: Mutex<Option<RetryFn>>,
    attempts: AtomicU32,
    completed: AtomicBool,
    state: Mutex<RequestState>,
}

impl RequestHandle {
    pub fn new(descriptor: RequestDescriptor) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            descriptor,
            callbacks: Mutex::new(Callbacks::default()),
            retry: Mutex::new(None),
            attempts: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            state: Mutex::new(RequestState::Built),
        })
    }

    pub fn with_callbacks(descriptor: RequestDescriptor, callbacks: Callbacks) -> Arc<Self> {
        let handle = Self::new(descriptor);
        handle.set_callbacks(callbacks);
        handle
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Number of transport dispatches started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RequestState {
        *self.state.lock()
    }

    /// Whether the current dispatch has reached its terminal outcome.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.callbacks.lock() = callbacks;
    }

    /// Per-request retry predicate; overrides the session's `should_retry`.
    pub fn set_retry_policy<F>(&self, f: F)
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        *self.retry.lock() = Some(Arc::new(f));
    }

    pub(crate) fn retry_policy(&self) -> Option<RetryFn> {
        self.retry.lock().clone()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        *self.state.lock() = state;
    }

    /// Arm the completion flag for a new pass through `append`.
    pub(crate) fn reset_completion(&self) {
        self.completed.store(false, Ordering::Release);
    }

    /// Start a transport attempt; returns its 1-based number.
    pub(crate) fn begin_attempt(&self) -> u32 {
        self.set_state(RequestState::Dispatched);
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Claim the terminal outcome of the current dispatch. Only the first
    /// caller gets `true`.
    pub(crate) fn try_complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Invoke callbacks for `outcome`. Callbacks are cloned out of the lock
    /// so they may re-enter the handle.
    pub(crate) fn deliver(&self, outcome: &Outcome) {
        let callbacks = self.callbacks.lock().clone();
        match outcome {
            Outcome::Success { value, is_cache } => {
                if let Some(f) = &callbacks.success {
                    f(value, *is_cache);
                }
            }
            Outcome::Failure(err) => {
                if let Some(f) = &callbacks.failure {
                    f(err);
                }
            }
            Outcome::Cancelled => {}
        }
        if let Some(f) = &callbacks.completion {
            f(outcome);
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("method", self.descriptor.method())
            .field("path", &self.descriptor.path())
            .field("attempts", &self.attempts())
            .field("state", &self.state())
            .finish()
    }
}
