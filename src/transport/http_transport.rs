use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Url};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::traits::{
    RawResponse, Transport, TransportBody, TransportCall, TransportFactory, TransportSettings,
};
use crate::error::TransportError;
use crate::request::{Headers, MultipartForm};

/// Size of the slices a multipart part is streamed in; progress is
/// reported once per slice.
const UPLOAD_SLICE_BYTES: usize = 16 * 1024;

/// reqwest-backed transport with a per-host connection limit.
pub struct HttpTransport {
    client: Client,
    max_per_host: usize,
    host_limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(settings.max_connections_per_host)
            .build()?;
        Ok(Self {
            client,
            max_per_host: settings.max_connections_per_host.max(1),
            host_limits: Mutex::new(HashMap::new()),
        })
    }

    fn host_semaphore(&self, url: &Url) -> Arc<Semaphore> {
        let key = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        let mut limits = self.host_limits.lock();
        limits
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }

    fn build_request(&self, call: TransportCall) -> Result<RequestBuilder, TransportError> {
        let mut req = self.client.request(call.method, call.url);
        let has_content_type = call
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
        for (k, v) in &call.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        match call.body {
            TransportBody::Empty => {}
            TransportBody::Encoded(body) => {
                if !has_content_type {
                    req = req.header(CONTENT_TYPE, body.content_type);
                }
                req = req.body(body.bytes);
            }
            TransportBody::Multipart(form) => {
                req = req.multipart(build_form(form)?);
            }
        }
        Ok(req)
    }
}

fn build_form(form: MultipartForm) -> Result<Form, TransportError> {
    let total: u64 = form.parts.iter().map(|p| p.data.len() as u64).sum();
    let sent = Arc::new(AtomicU64::new(0));
    let mut out = Form::new();

    for part in form.parts {
        let len = part.data.len() as u64;
        let mut wire = match &form.progress {
            Some(progress) => {
                let progress = Arc::clone(progress);
                let sent = Arc::clone(&sent);
                let slices = split_slices(&part.data);
                let stream = futures_util::stream::iter(slices.into_iter().map(move |slice| {
                    let now = sent.fetch_add(slice.len() as u64, Ordering::Relaxed)
                        + slice.len() as u64;
                    progress(now, total);
                    Ok::<Bytes, std::io::Error>(slice)
                }));
                Part::stream_with_length(Body::wrap_stream(stream), len)
            }
            None => Part::stream_with_length(Body::from(part.data.clone()), len),
        };
        if let Some(file_name) = part.file_name {
            wire = wire.file_name(file_name);
        }
        if let Some(mime) = part.mime.as_deref() {
            wire = wire
                .mime_str(mime)
                .map_err(|e| TransportError::Build(format!("invalid mime {}: {}", mime, e)))?;
        }
        out = out.part(part.name, wire);
    }
    Ok(out)
}

fn split_slices(data: &Bytes) -> Vec<Bytes> {
    let mut slices = Vec::with_capacity(data.len() / UPLOAD_SLICE_BYTES + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + UPLOAD_SLICE_BYTES).min(data.len());
        slices.push(data.slice(offset..end));
        offset = end;
    }
    slices
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, call: TransportCall) -> Result<RawResponse, TransportError> {
        let semaphore = self.host_semaphore(&call.url);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let method = call.method.clone();
        let url = call.url.to_string();
        let resp = self.build_request(call)?.send().await.map_err(|e| {
            warn!("http {} {} failed: {}", method, url, e);
            TransportError::from(e)
        })?;

        let status = resp.status().as_u16();
        debug!("http {} {} status={}", method, url, status);

        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }
        let body = resp.bytes().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// Builds a fresh [`HttpTransport`] for every settings change.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn build(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(HttpTransport::new(settings)?))
    }
}
