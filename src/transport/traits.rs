use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};

use crate::error::TransportError;
use crate::request::encoding::EncodedBody;
use crate::request::{Headers, MultipartForm};

/// Fully built call handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: TransportBody,
}

#[derive(Debug, Clone)]
pub enum TransportBody {
    Empty,
    Encoded(EncodedBody),
    Multipart(MultipartForm),
}

/// Response as received; status is not validated by the transport.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl RawResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Wire-level HTTP capability.
///
/// Cancelling a call means dropping the `execute` future; implementations
/// must not rely on being polled to completion.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, call: TransportCall) -> Result<RawResponse, TransportError>;
}

/// Settings a transport client is built from. Changing any of them means
/// building a new client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub max_connections_per_host: usize,
}

pub trait TransportFactory: Send + Sync {
    fn build(&self, settings: &TransportSettings) -> anyhow::Result<Arc<dyn Transport>>;
}
