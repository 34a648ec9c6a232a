use proxy::config::{Config as ProxyConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use url::Url;

const DEFAULT_STATSD_PORT: u16 = 8125;

#[derive(Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
}

fn default_statsd_port() -> u16 {
    DEFAULT_STATSD_PORT
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Reads the optional config file, applies environment overrides and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.proxy.validate()?;

        Ok(config)
    }

    /// `RUZ_BASE`, `PORT` and `CACHE_TTL_SECONDS` take precedence over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RUZ_BASE") {
            self.proxy.upstream.base_url = Url::parse(value.trim())
                .map_err(|_| ConfigError::InvalidEnv("RUZ_BASE", value))?;
        }
        if let Some(value) = lookup("PORT") {
            self.proxy.listener.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PORT", value))?;
        }
        if let Some(value) = lookup("CACHE_TTL_SECONDS") {
            self.proxy.cache.ttl_secs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("CACHE_TTL_SECONDS", value))?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidEnv(&'static str, String),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}
