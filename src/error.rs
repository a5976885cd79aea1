// Error taxonomy for request outcomes and the transport seam.

use thiserror::Error;

/// Failure delivered to a request's failure/completion callbacks.
///
/// Cancellation is not represented here; it is a distinct terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The allow hook vetoed the request before it reached the transport.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The transport answered with a non-2xx status.
    #[error("HTTP {code}")]
    Status { code: u16, body: String },

    /// Connection, TLS, timeout or protocol failure below the HTTP layer.
    #[error("network error: {0}")]
    Network(String),

    /// The descriptor could not be turned into a transport call.
    #[error("construction failed: {0}")]
    Construction(String),

    /// The call succeeded but the declared result type could not be built.
    #[error("result conversion failed: {0}")]
    Conversion(String),

    /// Error produced or substituted by an application hook.
    #[error("{0}")]
    Custom(String),
}

impl RequestError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Whether a retry policy may be consulted for this error at all.
    /// Construction failures and policy rejections never retry.
    pub fn is_retryable_kind(&self) -> bool {
        !matches!(self, Self::Construction(_) | Self::Rejected(_))
    }

    /// HTTP status code, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Error reported by a [`Transport`](crate::transport::traits::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP {code}")]
    Status { code: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("could not build request: {0}")]
    Build(String),
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { code, body } => RequestError::Status { code, body },
            TransportError::Timeout => RequestError::Network("request timed out".to_string()),
            TransportError::Network(msg) => RequestError::Network(msg),
            TransportError::Build(msg) => RequestError::Construction(msg),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::Build(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}
