//! Subsystem configuration.
//!
//! Every group has serde defaults so a partial config file is enough.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Backend driver. `memory` ships in-crate; others plug in behind the
    /// `Broker` trait.
    /// Default: "memory"
    pub driver: String,

    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BrokerCredentials>,

    /// Topics the consumer path polls.
    #[serde(default)]
    pub topics: Vec<String>,

    /// Partitions per topic. Ordering holds within one partition only.
    /// Default: 1
    pub partitions: u32,

    pub consumer_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9092,
            credentials: None,
            topics: vec!["events".to_string()],
            partitions: 1,
            consumer_group: "toporia".to_string(),
        }
    }
}

/// Channel route declarations and middleware aliases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Alias -> middleware identifier, resolved at router build time.
    #[serde(default)]
    pub channel_middleware: HashMap<String, String>,

    #[serde(default)]
    pub channels: Vec<ChannelRouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRouteConfig {
    pub pattern: String,
    /// Empty means every authentication guard is accepted.
    #[serde(default)]
    pub guards: Vec<String>,
}

/// Rate-limit algorithm selector.
///
/// `leaky_bucket` and `fixed_window` are recognized and mapped to the
/// nearest implemented algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
    FixedWindow,
}

/// Limits for one admission layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub enabled: bool,
    pub limit: u32,
    /// Window length (sliding window) or refill horizon (token bucket).
    pub window_secs: u64,
    pub algorithm: LimitAlgorithm,
}

impl LayerConfig {
    fn new(enabled: bool, limit: u32, window_secs: u64) -> Self {
        Self {
            enabled,
            limit,
            window_secs,
            algorithm: LimitAlgorithm::SlidingWindow,
        }
    }
}

/// Per-layer rate limits, checked in ascending priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayeredConfig {
    #[serde(default = "LayeredConfig::default_global")]
    pub global: LayerConfig,
    #[serde(default = "LayeredConfig::default_ip")]
    pub ip: LayerConfig,
    #[serde(default = "LayeredConfig::default_connection")]
    pub connection: LayerConfig,
    #[serde(default = "LayeredConfig::default_user")]
    pub user: LayerConfig,
    #[serde(default = "LayeredConfig::default_api_key")]
    pub api_key: LayerConfig,
    #[serde(default = "LayeredConfig::default_channel")]
    pub channel: LayerConfig,
}

impl LayeredConfig {
    fn default_global() -> LayerConfig {
        LayerConfig::new(true, 10_000, 60)
    }
    fn default_ip() -> LayerConfig {
        LayerConfig::new(true, 100, 60)
    }
    fn default_connection() -> LayerConfig {
        LayerConfig::new(true, 60, 60)
    }
    fn default_user() -> LayerConfig {
        LayerConfig::new(false, 120, 60)
    }
    fn default_api_key() -> LayerConfig {
        LayerConfig::new(false, 600, 60)
    }
    fn default_channel() -> LayerConfig {
        LayerConfig::new(false, 300, 60)
    }
}

impl Default for LayeredConfig {
    fn default() -> Self {
        Self {
            global: Self::default_global(),
            ip: Self::default_ip(),
            connection: Self::default_connection(),
            user: Self::default_user(),
            api_key: Self::default_api_key(),
            channel: Self::default_channel(),
        }
    }
}

/// Adaptive limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub base_limit: u32,
    /// Fraction of the base limit shed at full load.
    /// Default: 0.5
    pub adjustment_rate: f64,
    /// Seconds between load-factor recomputations.
    /// Default: 5
    pub load_update_interval_secs: u64,
    pub algorithm: LimitAlgorithm,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_limit: 1000,
            adjustment_rate: 0.5,
            load_update_interval_secs: 5,
            algorithm: LimitAlgorithm::TokenBucket,
        }
    }
}

/// Consumer worker and supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub handler: String,
    pub driver: String,

    /// Worker process count. 1 runs in-process without forking.
    /// Default: 1
    pub workers: u32,

    /// Messages accumulated before a batch flush.
    /// Default: 100
    pub batch_size: usize,

    /// Maximum batch age before a flush.
    /// Default: 1000
    pub batch_timeout_ms: u64,

    /// Broker poll timeout.
    /// Default: 1000
    pub timeout_ms: u64,

    /// Stop after this many messages (0 = unlimited).
    /// Default: 0
    pub max_messages: u64,

    /// Stop when resident memory exceeds this (0 = unlimited).
    /// Default: 0
    pub memory_limit_mb: u64,

    /// Grace period between SIGTERM and SIGKILL at shutdown.
    /// Default: 30
    pub graceful_timeout_s: u64,

    /// Directory for worker process records.
    /// Default: <tmp>/toporia-consumers
    #[serde(default = "ConsumerConfig::default_state_dir")]
    pub state_dir: std::path::PathBuf,
}

impl ConsumerConfig {
    fn default_state_dir() -> std::path::PathBuf {
        std::env::temp_dir().join("toporia-consumers")
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            handler: String::new(),
            driver: "memory".to_string(),
            workers: 1,
            batch_size: 100,
            batch_timeout_ms: 1000,
            timeout_ms: 1000,
            max_messages: 0,
            memory_limit_mb: 0,
            graceful_timeout_s: 30,
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Task executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Default: process
    pub default_driver: TaskDriver,
    /// Default: 4
    pub max_concurrent: usize,
    /// Shared wall-clock budget per `run` call.
    /// Default: 60
    pub timeout_s: u64,
    /// Enables envelope signing when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDriver {
    Process,
    Fork,
    Sync,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_driver: TaskDriver::Process,
            max_concurrent: 4,
            timeout_s: 60,
            secret_key: None,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the rolling interval before the circuit opens.
    /// Default: 5
    pub failure_threshold: u32,
    /// Default: 30000
    pub cooldown_ms: u64,
    /// Probes admitted while half-open.
    /// Default: 1
    pub half_open_max_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_max_probes: 1,
        }
    }
}

/// Root configuration for the subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub rate_limit: LayeredConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
}

impl Config {
    /// Load from a JSON file. Missing groups fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Fatal(format!("cannot read config {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Fatal(format!("cannot parse config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"broker": {"driver": "memory", "host": "h", "port": 1, "partitions": 2, "consumer_group": "g"}}"#)
                .expect("parse");
        assert_eq!(cfg.broker.partitions, 2);
        assert_eq!(cfg.rate_limit.connection.limit, 60);
        assert_eq!(cfg.rate_limit.ip.limit, 100);
        assert_eq!(cfg.circuit.failure_threshold, 5);
    }

    #[test]
    fn algorithm_names_are_snake_case() {
        let alg: LimitAlgorithm = serde_json::from_str("\"token_bucket\"").expect("parse");
        assert_eq!(alg, LimitAlgorithm::TokenBucket);
        let alg: LimitAlgorithm = serde_json::from_str("\"sliding_window\"").expect("parse");
        assert_eq!(alg, LimitAlgorithm::SlidingWindow);
    }
}
