//! Broker configuration.
//!
//! Configuration is read from a TOML file and then overridden by environment
//! variables. Every section has defaults, so an empty file is a valid
//! single-node config.
//!
//! ```toml
//! name = "broker-1"
//! host = "127.0.0.1"
//! port = 7100
//!
//! [coordination]
//! endpoints = ["127.0.0.1:2181"]
//!
//! [persistence]
//! type = "local"
//! path = "/var/lib/bundlemq"
//!
//! [heartbeat]
//! interval_ms = 1000
//! failure_threshold = 3
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |---|---|
//! | `BUNDLEMQ_NAME` | `name` |
//! | `BUNDLEMQ_HOST` | `host` |
//! | `BUNDLEMQ_PORT` | `port` |
//! | `BUNDLEMQ_HEALTH_PORT` | `health_port` (0 disables) |
//! | `BUNDLEMQ_ALLOW_RENAME` | `allow_rename` |
//! | `BUNDLEMQ_COORDINATION_ENDPOINTS` | `coordination.endpoints` (comma separated) |
//! | `BUNDLEMQ_DATA_PATH` | `persistence` (switches to `local`) |
//! | `BUNDLEMQ_MAX_REDO` | `redo.max_redo` |
//! | `BUNDLEMQ_OPERATION_TIMEOUT_MS` | `redo.operation_timeout_ms` |
//! | `BUNDLEMQ_HEARTBEAT_INTERVAL_MS` | `heartbeat.interval_ms` |
//! | `BUNDLEMQ_FAILURE_THRESHOLD` | `heartbeat.failure_threshold` |
//! | `BUNDLEMQ_BUNDLE_COUNT` | `bundles.count` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::*;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Unique broker name; the registry key under the broker root.
    pub name: String,
    /// Host advertised to clients and bound by the RPC server.
    pub host: String,
    pub port: u16,
    /// HTTP health/metrics port; 0 disables the endpoint.
    pub health_port: u16,
    /// Suffix colliding client names with `(n)` instead of rejecting them.
    pub allow_rename: bool,
    pub coordination: CoordinationConfig,
    pub persistence: PersistenceConfig,
    pub redo: RedoConfig,
    pub heartbeat: HeartbeatConfig,
    pub delivery: DeliveryConfig,
    pub bundles: BundleConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker-0".to_string(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_BROKER_PORT,
            health_port: DEFAULT_HEALTH_PORT,
            allow_rename: true,
            coordination: CoordinationConfig::default(),
            persistence: PersistenceConfig::default(),
            redo: RedoConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            delivery: DeliveryConfig::default(),
            bundles: BundleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Coordination service endpoints. Empty means the in-process store.
    pub endpoints: Vec<String>,
    pub broker_root: String,
    pub topic_root: String,
    pub bundle_root: String,
    pub leader_path: String,
    pub session_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            broker_root: DEFAULT_BROKER_ROOT.to_string(),
            topic_root: DEFAULT_TOPIC_ROOT.to_string(),
            bundle_root: DEFAULT_BUNDLE_ROOT.to_string(),
            leader_path: DEFAULT_LEADER_PATH.to_string(),
            session_timeout_ms: 10_000,
        }
    }
}

/// Where message bodies and subscription cursors live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceConfig {
    /// In-memory object store; lost on restart.
    #[default]
    Memory,
    /// Local filesystem object store rooted at `path`.
    Local { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedoConfig {
    /// Retries after the first attempt of a timed-out call.
    pub max_redo: u32,
    /// Deadline of a single attempt.
    pub operation_timeout_ms: u64,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            max_redo: DEFAULT_MAX_REDO,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl RedoConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Consecutive failed alive-checks that revoke a lease.
    pub failure_threshold: u32,
    pub check_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            check_timeout_ms: DEFAULT_ALIVE_CHECK_TIMEOUT_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Messages kept in the in-memory cache across all partitions.
    pub message_cache_capacity: u64,
    /// Deadline of one push to a subscriber.
    pub send_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            message_cache_capacity: DEFAULT_MESSAGE_CACHE_CAPACITY,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub count: u32,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_BUNDLE_COUNT,
        }
    }
}

impl BrokerConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read, override from the environment, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides()?;
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        info!(
            path = %path.display(),
            name = %config.name,
            url = %config.url(),
            "Loaded broker configuration"
        );
        Ok(config)
    }

    /// Apply `BUNDLEMQ_*` variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("BUNDLEMQ_NAME") {
            self.name = v;
        }
        if let Ok(v) = std::env::var("BUNDLEMQ_HOST") {
            self.host = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_PORT")? {
            self.port = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_HEALTH_PORT")? {
            self.health_port = v;
        }
        if let Ok(v) = std::env::var("BUNDLEMQ_ALLOW_RENAME") {
            self.allow_rename = v.to_lowercase() != "false" && v != "0";
        }
        if let Ok(v) = std::env::var("BUNDLEMQ_COORDINATION_ENDPOINTS") {
            self.coordination.endpoints = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(path) = std::env::var("BUNDLEMQ_DATA_PATH") {
            self.persistence = PersistenceConfig::Local { path };
        }
        if let Some(v) = parse_env("BUNDLEMQ_MAX_REDO")? {
            self.redo.max_redo = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_OPERATION_TIMEOUT_MS")? {
            self.redo.operation_timeout_ms = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_HEARTBEAT_INTERVAL_MS")? {
            self.heartbeat.interval_ms = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_FAILURE_THRESHOLD")? {
            self.heartbeat.failure_threshold = v;
        }
        if let Some(v) = parse_env("BUNDLEMQ_BUNDLE_COUNT")? {
            self.bundles.count = v;
        }
        Ok(())
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.name.contains('/') {
            errors.push(format!("name ({}) must not contain '/'", self.name));
        }
        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if self.heartbeat.interval_ms == 0 {
            errors.push("heartbeat.interval_ms must be greater than 0".to_string());
        }
        if self.heartbeat.failure_threshold == 0 {
            errors.push("heartbeat.failure_threshold must be at least 1".to_string());
        }
        if self.heartbeat.check_timeout_ms == 0 {
            errors.push("heartbeat.check_timeout_ms must be greater than 0".to_string());
        }
        if self.redo.operation_timeout_ms == 0 {
            errors.push("redo.operation_timeout_ms must be greater than 0".to_string());
        }
        if self.bundles.count == 0 || self.bundles.count > MAX_BUNDLE_COUNT {
            errors.push(format!(
                "bundles.count ({}) must be between 1 and {}",
                self.bundles.count, MAX_BUNDLE_COUNT
            ));
        }
        if self.delivery.message_cache_capacity == 0 {
            errors.push("delivery.message_cache_capacity must be at least 1".to_string());
        }
        if let PersistenceConfig::Local { path } = &self.persistence {
            if path.trim().is_empty() {
                errors.push("persistence.path must not be empty".to_string());
            }
        }
        for (field, root) in [
            ("coordination.broker_root", &self.coordination.broker_root),
            ("coordination.topic_root", &self.coordination.topic_root),
            ("coordination.bundle_root", &self.coordination.bundle_root),
            ("coordination.leader_path", &self.coordination.leader_path),
        ] {
            if !root.starts_with('/') {
                errors.push(format!("{field} ({root}) must start with '/'"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `host:port` advertised to clients.
    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}
