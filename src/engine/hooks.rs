// Pluggable session hooks. Every hook has an identity/no-op default.

use std::fmt;
use std::sync::Arc;

use super::handle::RequestHandle;
use super::pipeline::ResponseValue;
use crate::error::RequestError;
use crate::request::{Headers, Params, RequestDescriptor};

pub type EncryptFn = Arc<dyn Fn(&RequestDescriptor, Params) -> Params + Send + Sync>;
pub type DecryptFn = Arc<dyn Fn(&RequestDescriptor, String) -> String + Send + Sync>;
pub type HeadersFn = Arc<dyn Fn(&RequestDescriptor, Headers) -> Headers + Send + Sync>;
pub type AllowFn = Arc<dyn Fn(&RequestHandle) -> Option<RequestError> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(Arc<RequestHandle>) -> FilterDecision + Send + Sync>;
pub type PreOperationFn = Arc<
    dyn Fn(&RequestDescriptor, Option<ResponseValue>, Option<RequestError>, bool) -> PreOperation
        + Send
        + Sync,
>;
pub type SignatureFn = Arc<dyn Fn(&Headers, &Params) -> Option<(String, String)> + Send + Sync>;
pub type RetryFn = Arc<dyn Fn(&RequestError) -> bool + Send + Sync>;

/// Result of the filter hook.
pub enum FilterDecision {
    /// Dispatch this handle (the original or a substitute).
    Proceed(Arc<RequestHandle>),
    /// Park the handle in the held queue until `resume_held`.
    Defer,
    /// Veto silently; nothing else happens.
    Drop,
}

/// Result of the pre-operation hook.
#[derive(Debug, Clone, PartialEq)]
pub enum PreOperation {
    Deliver {
        value: Option<ResponseValue>,
        error: Option<RequestError>,
    },
    /// Swallow the result; no callback fires.
    Ignore,
}

#[derive(Clone)]
pub struct SessionHooks {
    pub encrypt: EncryptFn,
    pub decrypt: DecryptFn,
    pub build_headers: HeadersFn,
    pub allow: AllowFn,
    pub filter: FilterFn,
    pub pre_operation: PreOperationFn,
    pub signature: SignatureFn,
    pub should_retry: RetryFn,
}

impl Default for SessionHooks {
    fn default() -> Self {
        Self {
            encrypt: Arc::new(|_, params| params),
            decrypt: Arc::new(|_, body| body),
            build_headers: Arc::new(|_, headers| headers),
            allow: Arc::new(|_| None),
            filter: Arc::new(FilterDecision::Proceed),
            pre_operation: Arc::new(|_, value, error, _| PreOperation::Deliver { value, error }),
            signature: Arc::new(|_, _| None),
            should_retry: Arc::new(|_| false),
        }
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encrypt<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestDescriptor, Params) -> Params + Send + Sync + 'static,
    {
        self.encrypt = Arc::new(f);
        self
    }

    pub fn with_decrypt<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestDescriptor, String) -> String + Send + Sync + 'static,
    {
        self.decrypt = Arc::new(f);
        self
    }

    pub fn with_build_headers<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestDescriptor, Headers) -> Headers + Send + Sync + 'static,
    {
        self.build_headers = Arc::new(f);
        self
    }

    pub fn with_allow<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestHandle) -> Option<RequestError> + Send + Sync + 'static,
    {
        self.allow = Arc::new(f);
        self
    }

    pub fn with_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<RequestHandle>) -> FilterDecision + Send + Sync + 'static,
    {
        self.filter = Arc::new(f);
        self
    }

    pub fn with_pre_operation<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestDescriptor, Option<ResponseValue>, Option<RequestError>, bool) -> PreOperation
            + Send
            + Sync
            + 'static,
    {
        self.pre_operation = Arc::new(f);
        self
    }

    pub fn with_signature<F>(mut self, f: F) -> Self
    where
        F: Fn(&Headers, &Params) -> Option<(String, String)> + Send + Sync + 'static,
    {
        self.signature = Arc::new(f);
        self
    }

    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(f);
        self
    }
}
