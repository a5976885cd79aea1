use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use serde::Deserialize;

/// Per-request timeout applied by the transport (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Concurrent connections allowed to a single host.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;

/// Default and session-wide maximum cache lifetime (7 days).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

/// Cache partition used when a request does not name one.
pub const DEFAULT_CACHE_GROUP: &str = "default";

/// Extension of cache payload and metadata files.
pub const CACHE_FILE_EXTENSION: &str = "request";

/// Directory under the cache root that mirrors the groups with metadata files.
pub const CACHE_INFO_DIR: &str = "info";

/// Top-level configuration for a session engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL requests are resolved against. `None` means every request
    /// must carry an absolute URL.
    pub base_url: Option<String>,
    /// Transport timeout for a single attempt.
    pub timeout_secs: u64,
    /// Maximum concurrent connections per host.
    pub max_connections_per_host: usize,
    /// Global cache switch; requests still opt in individually.
    pub use_cache: bool,
    /// Upper bound for any request's cache TTL.
    pub max_cache_ttl_secs: u64,
    /// Root directory for the response cache.
    pub cache_dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            use_cache: true,
            max_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_dir: String::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Check limits and the base URL grammar. Returns the parsed base URL.
    pub fn validate(&self) -> Result<Option<Url>> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.max_connections_per_host == 0 {
            return Err(anyhow!("max_connections_per_host must be > 0"));
        }
        match self.base_url.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_base_url(raw).map(Some),
            _ => Ok(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.max_cache_ttl_secs)
    }

    /// Cache root; falls back to a directory under the OS temp dir.
    pub fn cache_root(&self) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            std::env::temp_dir().join("request_engine_cache")
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }
}

/// Parse a base URL, requiring an http(s) scheme and a host.
/// Trailing slashes are stripped so paths can be joined with a single `/`.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).with_context(|| format!("invalid base url: {}", raw))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!("unsupported scheme in base url: {}", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(anyhow!("base url has no host: {}", raw));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_connections_per_host, 10);
        assert!(config.use_cache);
        assert_eq!(config.max_cache_ttl(), Duration::from_secs(604_800));
        assert!(config.validate().unwrap().is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"base_url": "https://api.example.com/", "timeout_secs": 5}"#)
                .unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_connections_per_host, DEFAULT_MAX_CONNECTIONS_PER_HOST);
        let base = config.validate().unwrap().unwrap();
        assert_eq!(base.host_str(), Some("api.example.com"));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(parse_base_url("not a url").is_err());
        assert!(parse_base_url("ftp://example.com").is_err());
        assert!(SessionConfig::with_base_url("::::").validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = SessionConfig {
            timeout_secs: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SessionConfig {
            max_connections_per_host: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
