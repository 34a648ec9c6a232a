use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Cache TTL cannot be 0")]
    ZeroTtl,

    #[error("Cache capacity cannot be 0")]
    ZeroCapacity,

    #[error("Upstream timeout cannot be 0")]
    ZeroTimeout,

    #[error("Upstream max_attempts cannot be 0")]
    ZeroAttempts,

    #[error("Upstream base URL cannot be a base: {0}")]
    InvalidBaseUrl(Url),

    #[error("Invalid CORS origin: {0}")]
    InvalidCorsOrigin(String),
}

/// Proxy configuration. Every field has a default, so an empty document is a
/// valid config.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Public listener serving the API and the frontend
    pub listener: Listener,
    /// Listener for `/health` and `/ready`
    pub admin_listener: Listener,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    /// Snapshot written by `build-index`
    pub groups_index_path: PathBuf,
    /// Built frontend bundle. Unknown paths fall back to its `index.html`.
    pub frontend_dist: PathBuf,
    /// Origins allowed to call `/api/*` from a browser
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::new("0.0.0.0", 8000),
            admin_listener: Listener::new("127.0.0.1", 8001),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            groups_index_path: PathBuf::from("groups_index.json"),
            frontend_dist: PathBuf::from("frontend/dist"),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.upstream.validate()?;
        self.cache.validate()?;

        for origin in &self.cors_origins {
            if http::HeaderValue::from_str(origin).is_err() {
                return Err(ValidationError::InvalidCorsOrigin(origin.clone()));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn new(host: &str, port: u16) -> Self {
        Listener {
            host: host.to_string(),
            port,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Url,
    /// Per-attempt timeout
    pub timeout_secs: u64,
    /// Attempts per request, including the first one
    pub max_attempts: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: Url::parse("https://ruz.fa.ru").expect("default RUZ URL is valid"),
            timeout_secs: 10,
            max_attempts: 3,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.cannot_be_a_base() {
            return Err(ValidationError::InvalidBaseUrl(self.base_url.clone()));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::ZeroAttempts);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a successful upstream response is served from memory
    pub ttl_secs: u64,
    pub max_entries: u64,
    /// `max-age` advertised to clients on search and schedule responses
    pub upstream_cache_secs: u64,
    /// Serve the last good response when the upstream keeps failing
    pub serve_stale_on_error: bool,
    pub stale_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 60,
            max_entries: 512,
            upstream_cache_secs: 300,
            serve_stale_on_error: false,
            stale_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// `None` when stale fallback is disabled.
    pub fn stale_ttl(&self) -> Option<Duration> {
        self.serve_stale_on_error
            .then(|| Duration::from_secs(self.stale_ttl_secs))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.ttl_secs == 0 || (self.serve_stale_on_error && self.stale_ttl_secs == 0) {
            return Err(ValidationError::ZeroTtl);
        }
        if self.max_entries == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        Ok(())
    }
}
