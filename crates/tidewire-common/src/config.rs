//! # Configuration
//!
//! Server settings for tidewire, loadable from TOML files, TOML strings or
//! `TIDEWIRE_*` environment variables.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```toml
//! bind_address = "0.0.0.0:8080"
//! max_messages_per_window = 50
//!
//! [compression]
//! threshold_bytes = 2048
//! ```

use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::protocol::{Result, TidewireError};
use crate::rate_limit::RateLimitConfig;
use crate::token::{TokenConfig, DEFAULT_CLOCK_SKEW_TOLERANCE_MS, DEFAULT_TOKEN_VALIDITY_MS};

/// Max request body accepted by the HTTP fallback (1 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Max inbound stream frame (1 MB).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Responses below this size are never compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TidewireConfig {
    /// Listen address, e.g. "127.0.0.1:8080"
    pub bind_address: String,

    /// Concurrent stream connections per client address (0 = unlimited)
    pub max_connections_per_ip: u32,

    /// Messages per connection per window (0 = unlimited)
    pub max_messages_per_window: u32,

    pub rate_limit_window_ms: u64,

    pub token_validity_ms: u64,

    /// How far in the future a token timestamp may be
    pub clock_skew_tolerance_ms: u64,

    /// Hex-encoded secret shared by every process that must accept the same
    /// tokens. A random secret is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    pub max_batch_size: usize,

    pub max_body_size: usize,

    pub max_frame_payload: usize,

    /// Reverse proxies in front of the server whose `X-Forwarded-For`
    /// entries are trusted (0 = use the peer address)
    pub trusted_proxy_hops: usize,

    pub compression: CompressionConfig,

    pub paths: PathConfig,
}

impl Default for TidewireConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections_per_ip: 10,
            max_messages_per_window: 100,
            rate_limit_window_ms: 60_000,
            token_validity_ms: DEFAULT_TOKEN_VALIDITY_MS,
            clock_skew_tolerance_ms: DEFAULT_CLOCK_SKEW_TOLERANCE_MS,
            token_secret: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            trusted_proxy_hops: 0,
            compression: CompressionConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Endpoint paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathConfig {
    /// WebSocket upgrade path
    pub stream: String,
    /// HTTP fallback POST path
    pub http: String,
    /// Token refresh POST path
    pub token: String,
    pub health: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            stream: "/rpc".to_string(),
            http: "/__rpc".to_string(),
            token: "/__rpc/token".to_string(),
            health: "/__health".to_string(),
        }
    }
}

impl PathConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let all = [
            ("stream", &self.stream),
            ("http", &self.http),
            ("token", &self.token),
            ("health", &self.health),
        ];
        for (name, path) in all {
            if !path.starts_with('/') {
                errors.push(format!("paths.{name} must start with '/', got '{path}'"));
            }
        }
        for (i, (a, pa)) in all.iter().enumerate() {
            for (b, pb) in all.iter().skip(i + 1) {
                if pa == pb {
                    errors.push(format!("paths.{a} and paths.{b} are both '{pa}'"));
                }
            }
        }
        errors
    }
}

impl TidewireConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| TidewireError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| TidewireError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TidewireError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `TIDEWIRE_*` environment variables over the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| TidewireError::Config(format!("Invalid value for {key}: {e}")))
        }

        if let Some(v) = lookup("TIDEWIRE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("TIDEWIRE_MAX_CONNECTIONS_PER_IP") {
            self.max_connections_per_ip = parse("TIDEWIRE_MAX_CONNECTIONS_PER_IP", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_MAX_MESSAGES_PER_WINDOW") {
            self.max_messages_per_window = parse("TIDEWIRE_MAX_MESSAGES_PER_WINDOW", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit_window_ms = parse("TIDEWIRE_RATE_LIMIT_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_TOKEN_VALIDITY_MS") {
            self.token_validity_ms = parse("TIDEWIRE_TOKEN_VALIDITY_MS", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_CLOCK_SKEW_TOLERANCE_MS") {
            self.clock_skew_tolerance_ms = parse("TIDEWIRE_CLOCK_SKEW_TOLERANCE_MS", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_TOKEN_SECRET") {
            self.token_secret = Some(v);
        }
        if let Some(v) = lookup("TIDEWIRE_MAX_BATCH_SIZE") {
            self.max_batch_size = parse("TIDEWIRE_MAX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_MAX_BODY_SIZE") {
            self.max_body_size = parse("TIDEWIRE_MAX_BODY_SIZE", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_MAX_FRAME_PAYLOAD") {
            self.max_frame_payload = parse("TIDEWIRE_MAX_FRAME_PAYLOAD", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_TRUSTED_PROXY_HOPS") {
            self.trusted_proxy_hops = parse("TIDEWIRE_TRUSTED_PROXY_HOPS", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_COMPRESSION_ENABLED") {
            self.compression.enabled = parse("TIDEWIRE_COMPRESSION_ENABLED", &v)?;
        }
        if let Some(v) = lookup("TIDEWIRE_COMPRESSION_THRESHOLD_BYTES") {
            self.compression.threshold_bytes = parse("TIDEWIRE_COMPRESSION_THRESHOLD_BYTES", &v)?;
        }
        Ok(())
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(self.bind_address.parse()?)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.max_connections_per_ip,
            self.max_messages_per_window,
            self.rate_limit_window_ms,
        )
    }

    pub fn token(&self) -> TokenConfig {
        TokenConfig::new(self.token_validity_ms)
            .with_clock_skew_tolerance(self.clock_skew_tolerance_ms)
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("bind_address '{}' is not a socket address", self.bind_address));
        }
        if self.max_messages_per_window > 0 && self.rate_limit_window_ms == 0 {
            errors.push("rate_limit_window_ms must be > 0 when message limiting is enabled".into());
        }
        if self.token_validity_ms == 0 {
            errors.push("token_validity_ms must be > 0".into());
        }
        if let Some(secret) = &self.token_secret {
            match hex::decode(secret.trim()) {
                Ok(bytes) if bytes.len() >= crate::token::SECRET_LEN => {}
                Ok(_) => errors.push(format!(
                    "token_secret must encode at least {} bytes",
                    crate::token::SECRET_LEN
                )),
                Err(_) => errors.push("token_secret must be hex-encoded".into()),
            }
        }
        if self.max_batch_size == 0 {
            errors.push("max_batch_size must be > 0".into());
        }
        if self.max_body_size == 0 {
            errors.push("max_body_size must be > 0".into());
        }
        if self.max_frame_payload == 0 {
            errors.push("max_frame_payload must be > 0".into());
        }
        if self.compression.enabled && self.compression.threshold_bytes > u16::MAX as usize {
            errors.push(format!(
                "compression.threshold_bytes must be <= {}",
                u16::MAX
            ));
        }
        errors.extend(self.paths.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TidewireError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}
