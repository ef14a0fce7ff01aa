//! Configuration for waypointd

use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypoint_registry::{
    HeartbeatConfig, LoadBalanceStrategy, RegistryConfig, ServiceRecord, WatchConfig,
};

use crate::error::{DaemonError, DaemonResult};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Coordination store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Registry key layout and timing
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Local service to register, if any
    #[serde(default)]
    pub service: Option<ServiceConfig>,

    /// Services to discover
    #[serde(default)]
    pub watch: WatchSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination store backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store, only visible to this daemon
    #[default]
    Memory,

    /// etcd cluster
    Etcd {
        #[serde(default = "default_endpoints")]
        endpoints: Vec<String>,

        /// Dial timeout in seconds
        #[serde(default = "default_dial_timeout")]
        dial_timeout_secs: u64,

        /// Keep-alive ping interval in seconds
        #[serde(default = "default_keep_alive")]
        keep_alive_secs: u64,

        #[serde(default)]
        username: Option<String>,

        #[serde(default)]
        password: Option<String>,
    },
}

/// Registry settings in config-file units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,

    /// Deadline for each store call in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Graceful deregistration budget in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub heartbeat_max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub heartbeat_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub heartbeat_max_backoff_ms: u64,

    /// Forced refresh interval when no watch events arrive, in seconds
    #[serde(default = "default_resync_interval")]
    pub watch_resync_secs: u64,

    #[serde(default = "default_reconnect_backoff")]
    pub watch_reconnect_backoff_ms: u64,

    #[serde(default = "default_max_reconnect_backoff")]
    pub watch_max_reconnect_backoff_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            lock_prefix: default_lock_prefix(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            heartbeat_max_attempts: default_max_attempts(),
            heartbeat_initial_backoff_ms: default_initial_backoff(),
            heartbeat_max_backoff_ms: default_max_backoff(),
            watch_resync_secs: default_resync_interval(),
            watch_reconnect_backoff_ms: default_reconnect_backoff(),
            watch_max_reconnect_backoff_secs: default_max_reconnect_backoff(),
        }
    }
}

impl RegistrySettings {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            prefix: self.prefix.clone(),
            lock_prefix: self.lock_prefix.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            heartbeat: HeartbeatConfig {
                max_attempts: self.heartbeat_max_attempts,
                initial_backoff: Duration::from_millis(self.heartbeat_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.heartbeat_max_backoff_ms),
            },
            watch: WatchConfig {
                resync_interval: Duration::from_secs(self.watch_resync_secs),
                reconnect_backoff: Duration::from_millis(self.watch_reconnect_backoff_ms),
                max_reconnect_backoff: Duration::from_secs(self.watch_max_reconnect_backoff_secs),
            },
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Local service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub address: String,
    pub port: u16,

    /// Lease TTL in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl ServiceConfig {
    pub fn to_record(&self) -> ServiceRecord {
        ServiceRecord::new(
            self.name.clone(),
            self.address.clone(),
            self.port,
            Duration::from_secs(self.ttl_secs),
        )
    }
}

/// Discovery settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Service names to subscribe to
    #[serde(default)]
    pub services: Vec<String>,

    /// How to pick an instance from each discovered set
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_keep_alive() -> u64 {
    30
}

fn default_prefix() -> String {
    "/waypoint/services".to_string()
}

fn default_lock_prefix() -> String {
    "/waypoint/locks".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_max_backoff() -> u64 {
    4_000
}

fn default_resync_interval() -> u64 {
    60
}

fn default_reconnect_backoff() -> u64 {
    1_000
}

fn default_max_reconnect_backoff() -> u64 {
    30
}

fn default_ttl() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `WAYPOINT_*` environment variables (`__` separates sections).
    pub fn load(path: Option<&str>) -> DaemonResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WAYPOINT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DaemonResult<()> {
        self.registry.to_registry_config().validate()?;
        if let Some(service) = &self.service {
            service.to_record().validate().map_err(|e| {
                DaemonError::Config(format!("invalid service {:?}: {e}", service.name))
            })?;
        }
        for name in &self.watch.services {
            ServiceRecord::validate_name(name)
                .map_err(|e| DaemonError::Config(format!("invalid watch entry {name:?}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert!(matches!(config.store, StoreConfig::Memory));
        assert!(config.service.is_none());
        assert!(config.watch.services.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_defaults_match_library() {
        let ours = RegistrySettings::default().to_registry_config();
        let lib = RegistryConfig::default();
        assert_eq!(ours.prefix, lib.prefix);
        assert_eq!(ours.request_timeout, lib.request_timeout);
        assert_eq!(ours.heartbeat.max_attempts, lib.heartbeat.max_attempts);
        assert_eq!(ours.heartbeat.initial_backoff, lib.heartbeat.initial_backoff);
        assert_eq!(ours.watch.resync_interval, lib.watch.resync_interval);
        assert_eq!(ours.shutdown_timeout, lib.shutdown_timeout);
    }

    #[test]
    fn test_load_without_file() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.registry.prefix, "/waypoint/services");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_etcd_store_deserializes() {
        let store: StoreConfig = serde_json::from_value(serde_json::json!({
            "type": "etcd",
            "endpoints": ["10.0.0.1:2379"],
        }))
        .unwrap();
        match store {
            StoreConfig::Etcd {
                endpoints,
                dial_timeout_secs,
                ..
            } => {
                assert_eq!(endpoints, vec!["10.0.0.1:2379"]);
                assert_eq!(dial_timeout_secs, 5);
            }
            StoreConfig::Memory => panic!("expected etcd"),
        }
    }

    #[test]
    fn test_invalid_service_rejected() {
        let config = DaemonConfig {
            service: Some(ServiceConfig {
                name: "orders".into(),
                address: "10.0.0.5".into(),
                port: 0,
                ttl_secs: 5,
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));

        let config = DaemonConfig {
            service: Some(ServiceConfig {
                name: "orders".into(),
                address: "10.0.0.5".into(),
                port: 8080,
                ttl_secs: u64::MAX,
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));

        let config = DaemonConfig {
            watch: WatchSettings {
                services: vec!["a/b".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
