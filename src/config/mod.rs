//! Typed configuration: defaults, then an optional TOML file, then
//! environment variables.
//!
//! Loads once at startup and fails fast on missing or malformed values.
//! The database URL is wrapped in `secrecy::SecretString` so it never
//! reaches logs.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::retry::Backoff;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub database_max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub pool: PoolConfig,
}

/// On-disk shape of the TOML config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub database_max_connections: Option<u32>,
    pub otel_endpoint: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// `[pool]` table of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    pub workers: Option<usize>,
    pub instance_id: Option<String>,
    pub lease_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub handler_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    /// 0 disables backoff.
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }
}

impl Config {
    /// Load configuration from environment variables only.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_file_and_env(FileConfig::default())
    }

    /// Load `path` (if given) and apply environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => FileConfig::from_path(p)?,
            None => FileConfig::default(),
        };
        Self::from_file_and_env(file)
    }

    pub fn from_file_and_env(file: FileConfig) -> Result<Self> {
        let s = file.pool;
        let mut pool = PoolConfig::default();

        if let Some(n) = env_parse("WORKER_POOL_SIZE")?.or(s.workers) {
            pool.size = n;
        }
        if let Some(id) = std::env::var("WORKER_INSTANCE_ID").ok().or(s.instance_id) {
            pool.instance_id = id;
        }
        if let Some(secs) = env_parse("EVENT_VISIBILITY_TIMEOUT")?.or(s.lease_secs) {
            pool.lease_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("POLL_INTERVAL_MS")?.or(s.poll_interval_ms) {
            pool.idle_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("SHUTDOWN_TIMEOUT_SECS")?.or(s.shutdown_timeout_secs) {
            pool.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("HANDLER_TIMEOUT_SECS")?.or(s.handler_timeout_secs) {
            pool.handler_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(n) = env_parse("MAX_RETRY_COUNT")?.or(s.max_attempts) {
            pool.retry.max_attempts = n;
        }

        let base = env_parse("BACKOFF_BASE_SECS")?.or(s.backoff_base_secs);
        let max = env_parse("BACKOFF_MAX_SECS")?.or(s.backoff_max_secs);
        if base.is_some() || max.is_some() {
            pool.retry.backoff = backoff(base, max, pool.retry.backoff);
        }

        pool.validate()?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                .or(file.database_max_connections)
                .unwrap_or(10),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().or(file.otel_endpoint),
            log_level: std::env::var("LOG_LEVEL")
                .ok()
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            pool,
        })
    }
}

fn backoff(base: Option<u64>, max: Option<u64>, current: Backoff) -> Backoff {
    let (cur_base, cur_max) = match current {
        Backoff::Exponential { base, max } => (base, max),
        Backoff::None => (Duration::ZERO, Duration::ZERO),
    };
    let base = base.map(Duration::from_secs).unwrap_or(cur_base);
    if base.is_zero() {
        return Backoff::None;
    }
    let max = max.map(Duration::from_secs).unwrap_or(cur_max).max(base);
    Backoff::Exponential { base, max }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}={raw:?} is not a valid value"))),
        Err(_) => Ok(None),
    }
}
