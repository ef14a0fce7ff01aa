//! Registry configuration.
//!
//! Key layout, store call deadlines, and the retry policies of the
//! heartbeat and watch tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Configuration for a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root under which service records are written.
    pub prefix: String,

    /// Root under which lock keys are written.
    pub lock_prefix: String,

    /// Deadline applied to every individual store call.
    pub request_timeout: Duration,

    /// Heartbeat retry policy.
    pub heartbeat: HeartbeatConfig,

    /// Watch task policy.
    pub watch: WatchConfig,

    /// How long `shutdown` waits for background tasks to deregister.
    pub shutdown_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "/waypoint/services".to_string(),
            lock_prefix: "/waypoint/locks".to_string(),
            request_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
            watch: WatchConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.prefix.starts_with('/') || self.prefix.trim_end_matches('/').is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "prefix must be an absolute, non-root path: {:?}",
                self.prefix
            )));
        }
        if !self.lock_prefix.starts_with('/') || self.lock_prefix.trim_end_matches('/').is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "lock_prefix must be an absolute, non-root path: {:?}",
                self.lock_prefix
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "request_timeout must be positive".into(),
            ));
        }
        self.heartbeat.validate()?;
        self.watch.validate()
    }
}

/// Heartbeat retry policy.
///
/// Renewal happens every `ttl / 2`. A failed renewal is retried after
/// `initial_backoff`, doubling up to `max_backoff`, but only while the retry
/// would still land before the next tick. `max_attempts` consecutive
/// failures terminate the heartbeat and deregister the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl HeartbeatConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RegistryError::InvalidConfig(
                "heartbeat.max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(RegistryError::InvalidConfig(
                "heartbeat.initial_backoff exceeds max_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Back-off before retry number `failures` (1-based): 1s, 2s, 4s, ...
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

/// Watch task policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Longest wait for a watch event before doing a full refresh anyway.
    pub resync_interval: Duration,

    /// First delay before re-opening a broken watch.
    pub reconnect_backoff: Duration,

    /// Cap for the re-open delay.
    pub max_reconnect_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(30),
        }
    }
}

impl WatchConfig {
    fn validate(&self) -> Result<()> {
        if self.resync_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "watch.resync_interval must be positive".into(),
            ));
        }
        if self.reconnect_backoff.is_zero() || self.reconnect_backoff > self.max_reconnect_backoff
        {
            return Err(RegistryError::InvalidConfig(
                "watch.reconnect_backoff must be positive and within max_reconnect_backoff".into(),
            ));
        }
        Ok(())
    }
}
