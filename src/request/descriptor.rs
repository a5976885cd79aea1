// Immutable request descriptor and the builder that freezes it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, Url};
use serde_json::Value;

use super::encoding::{ParameterEncoding, ResultEncoding};
use super::{Headers, Params};
use crate::config::{parse_base_url, DEFAULT_CACHE_GROUP, DEFAULT_CACHE_TTL_SECS};
use crate::error::RequestError;

/// Upload progress callback: `(sent_bytes, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Shape of the payload the response body is converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultFormat {
    #[default]
    Text,
    Json,
}

/// One part of a multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub data: Bytes,
    pub file_name: Option<String>,
    pub mime: Option<String>,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Bytes::from(value.into()),
            file_name: None,
            mime: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            file_name: Some(file_name.into()),
            mime: Some(mime.into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MultipartForm {
    pub parts: Vec<MultipartPart>,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for MultipartForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartForm")
            .field("parts", &self.parts)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Transport call shape.
#[derive(Debug, Clone, Default)]
pub enum RequestKind {
    #[default]
    Standard,
    Multipart(MultipartForm),
}

/// Cache settings of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_age: Duration,
    /// Parameter names left out of the cache key (timestamps, nonces).
    pub ignored_params: Vec<String>,
    /// Partition of the cache directory, e.g. per user.
    pub group: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            ignored_params: Vec::new(),
            group: DEFAULT_CACHE_GROUP.to_string(),
        }
    }
}

/// Immutable description of one logical HTTP call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    base_url: Option<String>,
    path: String,
    url_override: Option<String>,
    headers: Headers,
    params: Params,
    encoding: ParameterEncoding,
    result_encoding: ResultEncoding,
    result_format: ResultFormat,
    cache: CachePolicy,
    kind: RequestKind,
}

impl RequestDescriptor {
    pub fn builder(method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path)
    }

    pub fn get(path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Method::POST, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn encoding(&self) -> ParameterEncoding {
        self.encoding
    }

    pub fn result_encoding(&self) -> ResultEncoding {
        self.result_encoding
    }

    pub fn result_format(&self) -> ResultFormat {
        self.result_format
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Only cache-enabled GET requests with a positive TTL touch the cache.
    pub fn is_cacheable(&self) -> bool {
        self.cache.enabled && self.method == Method::GET && !self.cache.max_age.is_zero()
    }

    /// Resolve the target URL: the literal override wins, otherwise the
    /// request's own base URL or the session base, joined with the path.
    pub fn resolve_url(&self, session_base: Option<&Url>) -> Result<Url, RequestError> {
        if let Some(raw) = self.url_override.as_deref().filter(|s| !s.trim().is_empty()) {
            return Url::parse(raw.trim())
                .map_err(|e| RequestError::Construction(format!("invalid url {}: {}", raw, e)));
        }

        let base = match self.base_url.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => {
                parse_base_url(raw).map_err(|e| RequestError::Construction(format!("{:#}", e)))?
            }
            None => session_base.cloned().ok_or_else(|| {
                RequestError::Construction("no base url configured for relative path".to_string())
            })?,
        };

        let path = self.path.trim_start_matches('/');
        if path.is_empty() {
            return Ok(base);
        }
        let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| RequestError::Construction(format!("invalid url {}: {}", joined, e)))
    }
}

/// Collects request settings, then freezes them with [`RequestBuilder::build`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    inner: RequestDescriptor,
}

impl RequestBuilder {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            inner: RequestDescriptor {
                method,
                base_url: None,
                path: path.into(),
                url_override: None,
                headers: Headers::new(),
                params: Params::new(),
                encoding: ParameterEncoding::default(),
                result_encoding: ResultEncoding::default(),
                result_format: ResultFormat::default(),
                cache: CachePolicy::default(),
                kind: RequestKind::Standard,
            },
        }
    }

    /// Base URL for this request only, overriding the session's.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.inner.base_url = Some(base_url.into());
        self
    }

    /// Absolute URL; base URL and path are ignored.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.inner.url_override = Some(url.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.inner.headers.extend(headers);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.inner.params.extend(params);
        self
    }

    pub fn encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.inner.encoding = encoding;
        self
    }

    pub fn result_encoding(mut self, encoding: ResultEncoding) -> Self {
        self.inner.result_encoding = encoding;
        self
    }

    pub fn result_format(mut self, format: ResultFormat) -> Self {
        self.inner.result_format = format;
        self
    }

    /// Enable caching with the given max age.
    pub fn cache(mut self, max_age: Duration) -> Self {
        self.inner.cache.enabled = true;
        self.inner.cache.max_age = max_age;
        self
    }

    pub fn cache_ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .cache
            .ignored_params
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn cache_group(mut self, group: impl Into<String>) -> Self {
        self.inner.cache.group = group.into();
        self
    }

    /// Turn the request into a multipart upload and add a part.
    pub fn part(mut self, part: MultipartPart) -> Self {
        if let RequestKind::Multipart(form) = &mut self.inner.kind {
            form.parts.push(part);
        } else {
            self.inner.kind = RequestKind::Multipart(MultipartForm {
                parts: vec![part],
                progress: None,
            });
        }
        self
    }

    /// Upload progress for multipart requests. Ignored for standard requests.
    pub fn upload_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        if let RequestKind::Multipart(form) = &mut self.inner.kind {
            form.progress = Some(Arc::new(progress));
        }
        self
    }

    pub fn build(self) -> RequestDescriptor {
        self.inner
    }
}
