//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SMSHUB_LISTEN`, `SMSHUB_API_KEY`,
//!    `SMSHUB_SEED_PATH`, `SMSHUB_LOG_LEVEL`
//! 2. **Config file**: path via `--config <path>`, or `smshub.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8081"
//!
//! [auth]
//! api_key = "operator-secret"        # Bearer key for /ws/stats and /api/*
//!
//! [hub]
//! outbound_buffer = 256              # frames queued per connection
//! command_buffer = 1024              # pending registry operations
//! keepalive_interval_secs = 54       # ping cadence
//! read_deadline_secs = 60            # idle limit before the session drops
//! write_timeout_secs = 10
//! send_timeout_ms = 5000             # wait for room in the hub queue
//! max_malformed_frames = 5
//! max_frame_bytes = 65536
//! duplicate_policy = "evict_prior"   # evict_prior | reject_new | allow
//!
//! [status_cache]
//! status_ttl_secs = 300
//! connection_ttl_secs = 86400
//!
//! [outbox]
//! capacity = 1024
//!
//! [selector]
//! min_battery = 10
//! home_dialing_code = "+90"
//! base_unit_cost = 0.05
//! international_multiplier = 3.0
//!
//! [store]
//! seed_path = "devices.toml"         # optional device inventory
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub status_cache: StatusCacheConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8081`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Operator authentication for the stats and report endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `SMSHUB_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// What happens when a second connection authenticates as a device that
/// already has a live connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Close the older connection and bind the new one.
    #[default]
    EvictPrior,
    /// Refuse the new authentication while the older connection is live.
    RejectNew,
    /// Keep both; routing picks the earliest registered connection.
    Allow,
}

/// Connection registry and per-session timing.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Frames queued per connection before it is treated as dead (default 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Registry operations queued ahead of the hub loop (default 1024).
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Seconds between keepalive pings (default 54).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds without any inbound frame before the session ends (default 60).
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,
    /// Seconds allowed for a single frame write (default 10).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// How long a caller waits for room in the registry queue, in ms (default 5000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Consecutive undecodable envelopes tolerated before closing (default 5).
    #[serde(default = "default_max_malformed_frames")]
    pub max_malformed_frames: u32,
    /// Largest accepted inbound frame in bytes (default 64 KiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

/// TTLs for the online/offline status cache.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusCacheConfig {
    /// Seconds an online/offline status stays valid (default 300).
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,
    /// Seconds a device→connection mapping stays valid (default 86400).
    #[serde(default = "default_connection_ttl")]
    pub connection_ttl_secs: u64,
}

/// Event outbox between message handlers and the queue publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Events buffered before new ones are dropped (default 1024).
    #[serde(default = "default_outbox_capacity")]
    pub capacity: usize,
}

/// Device selection thresholds and cost estimation.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Minimum battery percentage for an eligible device (default 10).
    #[serde(default = "default_min_battery")]
    pub min_battery: u8,
    /// Dialing code treated as domestic for cost estimation (default `+90`).
    #[serde(default = "default_home_dialing_code")]
    pub home_dialing_code: String,
    /// Cost of one 160-character unit (default 0.05).
    #[serde(default = "default_base_unit_cost")]
    pub base_unit_cost: f64,
    /// Multiplier applied to non-domestic destinations (default 3.0).
    #[serde(default = "default_international_multiplier")]
    pub international_multiplier: f64,
}

/// Bundled in-memory store settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// TOML file with `[[devices]]` to preload. Override with `SMSHUB_SEED_PATH`.
    pub seed_path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_command_buffer() -> usize {
    1024
}
fn default_keepalive_interval() -> u64 {
    54
}
fn default_read_deadline() -> u64 {
    60
}
fn default_write_timeout() -> u64 {
    10
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_max_malformed_frames() -> u32 {
    5
}
fn default_max_frame_bytes() -> usize {
    64 * 1024
}
fn default_status_ttl() -> u64 {
    300
}
fn default_connection_ttl() -> u64 {
    24 * 60 * 60
}
fn default_outbox_capacity() -> usize {
    1024
}
fn default_min_battery() -> u8 {
    10
}
fn default_home_dialing_code() -> String {
    "+90".to_string()
}
fn default_base_unit_cost() -> f64 {
    0.05
}
fn default_international_multiplier() -> f64 {
    3.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            command_buffer: default_command_buffer(),
            keepalive_interval_secs: default_keepalive_interval(),
            read_deadline_secs: default_read_deadline(),
            write_timeout_secs: default_write_timeout(),
            send_timeout_ms: default_send_timeout_ms(),
            max_malformed_frames: default_max_malformed_frames(),
            max_frame_bytes: default_max_frame_bytes(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: default_status_ttl(),
            connection_ttl_secs: default_connection_ttl(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_outbox_capacity(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_battery: default_min_battery(),
            home_dialing_code: default_home_dialing_code(),
            base_unit_cost: default_base_unit_cost(),
            international_multiplier: default_international_multiplier(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl HubConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl StatusCacheConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `smshub.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("smshub.toml").exists() => Self::from_file("smshub.toml")?,
            None => Self::default(),
        };

        if let Ok(listen) = std::env::var("SMSHUB_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("SMSHUB_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(seed) = std::env::var("SMSHUB_SEED_PATH") {
            config.store.seed_path = Some(seed);
        }
        if let Ok(level) = std::env::var("SMSHUB_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject settings the hub, the session pumps or the operator auth
    /// cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hub = &self.hub;
        if hub.keepalive_interval_secs == 0 || hub.keepalive_interval_secs >= hub.read_deadline_secs
        {
            return Err(ConfigError::Invalid(format!(
                "hub.keepalive_interval_secs ({}) must be non-zero and shorter than hub.read_deadline_secs ({})",
                hub.keepalive_interval_secs, hub.read_deadline_secs
            )));
        }
        if hub.outbound_buffer == 0 || hub.command_buffer == 0 || self.outbox.capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub.outbound_buffer, hub.command_buffer and outbox.capacity must be non-zero"
                    .to_string(),
            ));
        }
        if hub.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "hub.send_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.auth.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.api_key must not be empty".to_string()));
        }
        if hub.max_malformed_frames == 0 {
            return Err(ConfigError::Invalid(
                "hub.max_malformed_frames must be at least 1".to_string(),
            ));
        }
        if !self.selector.home_dialing_code.starts_with('+') {
            return Err(ConfigError::Invalid(format!(
                "selector.home_dialing_code must start with '+', got {:?}",
                self.selector.home_dialing_code
            )));
        }
        Ok(())
    }
}
