//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `serde` default functions
//! 2. **Config file**: TOML file named by the `MESH_CONFIG` env var (default `config/mesh.toml`)
//! 3. **Environment variables**: `MESH__*` env vars override specific fields
//!
//! # Example
//!
//! ```toml
//! [upstream]
//! brokers = ["tcp://broker-1:9999", "tcp://broker-2:9999"]
//! load_balance = "weighted-latency"
//! call_timeout_ms = 3000
//!
//! [[upstream.routes]]
//! service = "shop!Cart:1"
//! uris = ["tcp://10.0.0.7:42252"]
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::{path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    service::ServiceLocator,
    upstream::{LoadBalanceKind, RequesterConfig},
};

/// Static address list for one service, bypassing the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// `[group!]name[:version]`
    pub service: String,
    pub uris: Vec<String>,
}

/// The `[upstream]` section: brokers, static routes and requester timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default)]
    pub brokers: Vec<String>,

    #[serde(default)]
    pub routes: Vec<RouteSettings>,

    /// `random`, `round-robin` or `weighted-latency`. Defaults to `round-robin`.
    #[serde(default = "default_load_balance")]
    pub load_balance: String,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Removal delay for a URI dropped by discovery when nothing is exposed locally.
    #[serde(default = "default_consumer_grace_seconds")]
    pub consumer_grace_seconds: u64,

    #[serde(default = "default_provider_grace_seconds")]
    pub provider_grace_seconds: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u64,

    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    #[serde(default = "default_unhealthy_sweep_interval_seconds")]
    pub unhealthy_sweep_interval_seconds: u64,

    /// How long the very first call waits for the initial address update.
    #[serde(default = "default_initial_connect_timeout_ms")]
    pub initial_connect_timeout_ms: u64,
}

fn default_load_balance() -> String {
    LoadBalanceKind::default().as_str().to_string()
}

fn default_call_timeout_ms() -> u64 {
    3000
}

fn default_consumer_grace_seconds() -> u64 {
    15
}

fn default_provider_grace_seconds() -> u64 {
    45
}

fn default_reconnect_attempts() -> u32 {
    12
}

fn default_reconnect_interval_seconds() -> u64 {
    5
}

fn default_health_check_interval_seconds() -> u64 {
    15
}

fn default_unhealthy_sweep_interval_seconds() -> u64 {
    300
}

fn default_initial_connect_timeout_ms() -> u64 {
    3000
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            routes: Vec::new(),
            load_balance: default_load_balance(),
            call_timeout_ms: default_call_timeout_ms(),
            consumer_grace_seconds: default_consumer_grace_seconds(),
            provider_grace_seconds: default_provider_grace_seconds(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_seconds: default_reconnect_interval_seconds(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            unhealthy_sweep_interval_seconds: default_unhealthy_sweep_interval_seconds(),
            initial_connect_timeout_ms: default_initial_connect_timeout_ms(),
        }
    }
}

impl UpstreamSettings {
    #[must_use]
    pub fn requester_config(&self) -> RequesterConfig {
        RequesterConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            consumer_grace_delay: Duration::from_secs(self.consumer_grace_seconds),
            provider_grace_delay: Duration::from_secs(self.provider_grace_seconds),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: Duration::from_secs(self.reconnect_interval_seconds),
            health_check_interval: Duration::from_secs(self.health_check_interval_seconds),
            unhealthy_sweep_interval: Duration::from_secs(self.unhealthy_sweep_interval_seconds),
            initial_connect_timeout: Duration::from_millis(self.initial_connect_timeout_ms),
        }
    }
}

/// Credentials attached to outgoing calls by client stubs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Opaque bearer token; never interpreted by the mesh.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default directive when `RUST_LOG` is unset. Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from `config_path`, then applies `MESH__` environment
    /// overrides (`__` separates nested fields, e.g. `MESH__UPSTREAM__CALL_TIMEOUT_MS=500`).
    ///
    /// A missing file is not an error; compiled defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a value has the wrong type.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("upstream.load_balance", default_load_balance())?
            .set_default("upstream.call_timeout_ms", default_call_timeout_ms())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("MESH").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads from the path in `MESH_CONFIG`, or `config/mesh.toml`.
    ///
    /// # Errors
    ///
    /// See [`Self::from_file`].
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("MESH_CONFIG").unwrap_or_else(|_| "config/mesh.toml".to_string());
        Self::from_file(&config_path)
    }

    pub fn validate(&self) -> Result<(), String> {
        let upstream = &self.upstream;

        for broker in &upstream.brokers {
            validate_uri("broker", broker)?;
        }

        for route in &upstream.routes {
            ServiceLocator::parse(&route.service)
                .map_err(|e| format!("Invalid route service '{}': {e}", route.service))?;
            if route.uris.is_empty() {
                return Err(format!("Route {} has no URIs", route.service));
            }
            for uri in &route.uris {
                validate_uri(&route.service, uri)?;
            }
        }

        upstream.load_balance.parse::<LoadBalanceKind>()?;

        let intervals = [
            ("Call timeout", upstream.call_timeout_ms),
            ("Reconnect interval", upstream.reconnect_interval_seconds),
            ("Health check interval", upstream.health_check_interval_seconds),
            ("Unhealthy sweep interval", upstream.unhealthy_sweep_interval_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }

        if upstream.reconnect_attempts == 0 {
            return Err("Reconnect attempts must be greater than 0".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}

fn validate_uri(owner: &str, uri: &str) -> Result<(), String> {
    if uri.is_empty() {
        return Err(format!("Empty URI for {owner}"));
    }
    url::Url::parse(uri).map_err(|e| format!("Invalid URI for {owner}: {uri} ({e})"))?;
    Ok(())
}
