// src/config.rs
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::pool::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Upper bound on worker threads, whatever the caller asks for.
pub const MAX_THREADS: usize = 16;

/// Per-connection limits carried into every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLimits {
    /// Size of each pooled buffer block.
    pub block_size: usize,
    /// Longest accepted request line, CRLF excluded.
    pub max_request_line: usize,
    /// Longest accepted header block, request line excluded.
    pub max_header_bytes: usize,
    pub max_headers: usize,
    /// How long an idle keep-alive connection waits for its next request.
    pub keep_alive_timeout: Duration,
    /// Close after this many exchanges on one connection.
    pub max_requests_per_connection: Option<u32>,
}

impl ServerLimits {
    /// Reject limits that would leave the server unable to serve a request.
    pub fn validate(&self) -> EngineResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(EngineError::Config(format!(
                "block size must be at least {MIN_BLOCK_SIZE} bytes, got {}",
                self.block_size
            )));
        }
        if self.max_headers == 0 || self.max_request_line == 0 || self.max_header_bytes == 0 {
            return Err(EngineError::Config("request limits must be positive".into()));
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(EngineError::Config("keep-alive timeout must be positive".into()));
        }
        if self.max_requests_per_connection == Some(0) {
            return Err(EngineError::Config(
                "max requests per connection must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_request_line: 8 * 1024,
            max_header_bytes: 32 * 1024,
            max_headers: 100,
            keep_alive_timeout: Duration::from_secs(120),
            max_requests_per_connection: None,
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Listen URLs, `scheme://host[:port][/path]`.
    pub urls: Vec<String>,

    /// Requested worker count; 0 picks the default policy.
    pub thread_count: i32,

    /// Disable Nagle on accepted sockets (default: true)
    pub no_delay: bool,

    /// Emit `Server: etude` when the application sets none (default: true)
    pub add_server_header: bool,

    /// Pin each worker thread to its own core (default: false)
    pub pin_threads: bool,

    /// Grace period per worker on shutdown, in seconds (default: 5)
    pub shutdown_timeout_secs: u64,

    pub keep_alive_timeout_secs: u64,
    pub block_size: usize,
    pub max_request_line: usize,
    pub max_header_bytes: usize,
    pub max_headers: usize,
    pub max_requests_per_connection: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = ServerLimits::default();
        Self {
            urls: vec!["http://127.0.0.1:5000".to_string()],
            thread_count: 0,
            no_delay: true,
            add_server_header: true,
            pin_threads: false,
            shutdown_timeout_secs: 5,
            keep_alive_timeout_secs: limits.keep_alive_timeout.as_secs(),
            block_size: limits.block_size,
            max_request_line: limits.max_request_line,
            max_header_bytes: limits.max_header_bytes,
            max_headers: limits.max_headers,
            max_requests_per_connection: limits.max_requests_per_connection,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ETUDE_*` environment variables (with .env support).
    pub fn from_env() -> EngineResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// Unset variables keep their defaults; set but malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(urls) = var("ETUDE_URLS") {
            config.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("ETUDE_THREAD_COUNT") {
            config.thread_count = parse_number("ETUDE_THREAD_COUNT", &v)?;
        }
        if let Some(v) = var("ETUDE_NO_DELAY") {
            config.no_delay = parse_flag("ETUDE_NO_DELAY", &v)?;
        }
        if let Some(v) = var("ETUDE_ADD_SERVER_HEADER") {
            config.add_server_header = parse_flag("ETUDE_ADD_SERVER_HEADER", &v)?;
        }
        if let Some(v) = var("ETUDE_PIN_THREADS") {
            config.pin_threads = parse_flag("ETUDE_PIN_THREADS", &v)?;
        }
        if let Some(v) = var("ETUDE_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = parse_number("ETUDE_SHUTDOWN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("ETUDE_KEEP_ALIVE_TIMEOUT_SECS") {
            config.keep_alive_timeout_secs = parse_number("ETUDE_KEEP_ALIVE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("ETUDE_BLOCK_SIZE") {
            config.block_size = parse_number("ETUDE_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = var("ETUDE_MAX_REQUEST_LINE") {
            config.max_request_line = parse_number("ETUDE_MAX_REQUEST_LINE", &v)?;
        }
        if let Some(v) = var("ETUDE_MAX_HEADER_BYTES") {
            config.max_header_bytes = parse_number("ETUDE_MAX_HEADER_BYTES", &v)?;
        }
        if let Some(v) = var("ETUDE_MAX_HEADERS") {
            config.max_headers = parse_number("ETUDE_MAX_HEADERS", &v)?;
        }
        if let Some(v) = var("ETUDE_MAX_REQUESTS_PER_CONNECTION") {
            config.max_requests_per_connection =
                Some(parse_number("ETUDE_MAX_REQUESTS_PER_CONNECTION", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.urls.is_empty() {
            return Err(EngineError::Config("no listen urls configured".into()));
        }
        if self.thread_count < 0 {
            return Err(EngineError::Config(format!(
                "thread count must not be negative, got {}",
                self.thread_count
            )));
        }
        self.limits().validate()
    }

    pub fn limits(&self) -> ServerLimits {
        ServerLimits {
            block_size: self.block_size,
            max_request_line: self.max_request_line,
            max_header_bytes: self.max_header_bytes,
            max_headers: self.max_headers,
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout_secs),
            max_requests_per_connection: self.max_requests_per_connection,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn parse_flag(name: &str, value: &str) -> EngineResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "{name} must be a boolean, got {value:?}"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> EngineResult<T> {
    value
        .parse()
        .map_err(|_| EngineError::Config(format!("{name} must be a number, got {value:?}")))
}

/// Turn a requested thread count into the number of workers to spawn.
///
/// `0` means half the physical cores; every result lands in `1..=16`.
/// Negative requests are rejected.
pub fn resolve_thread_count(requested: i32, physical_cores: usize) -> EngineResult<usize> {
    match requested {
        n if n < 0 => Err(EngineError::Config(format!(
            "thread count must not be negative, got {n}"
        ))),
        0 => Ok((physical_cores / 2).clamp(1, MAX_THREADS)),
        n => Ok((n as usize).min(MAX_THREADS)),
    }
}

/// Physical core count of this machine.
pub fn physical_cores() -> usize {
    num_cpus::get_physical()
}
