use std::time::Duration;

use serde::Deserialize;

use tunetrail_gateway::{BackgroundConfig, DispatcherConfig};

/// Dispatcher tunables, in file-friendly units.
#[derive(Debug, Deserialize)]
pub struct DispatcherTomlConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_stale_while_error")]
    pub stale_while_error_seconds: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_default_limit")]
    pub default_limit: usize,
    /// Bound on the impression buffer.
    #[serde(default = "default_buffer_capacity")]
    pub impression_buffer_capacity: usize,
}

impl Default for DispatcherTomlConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl(),
            stale_while_error_seconds: default_stale_while_error(),
            retry_backoff_ms: default_retry_backoff(),
            max_limit: default_max_limit(),
            default_limit: default_default_limit(),
            impression_buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl DispatcherTomlConfig {
    /// Convert into the gateway's dispatcher configuration.
    #[must_use]
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
            stale_while_error: Duration::from_secs(self.stale_while_error_seconds),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_limit: self.max_limit,
            default_limit: self.default_limit,
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_stale_while_error() -> u64 {
    3_600
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_max_limit() -> usize {
    100
}

fn default_default_limit() -> usize {
    20
}

fn default_buffer_capacity() -> usize {
    10_000
}

/// Session lifecycle tunables.
#[derive(Debug, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_sweep_interval() -> u64 {
    60
}

/// API key lifecycle tunables.
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    /// How long a rotated-out key keeps authenticating.
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_hours: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            rotation_grace_hours: default_rotation_grace(),
        }
    }
}

fn default_rotation_grace() -> u64 {
    24
}

/// Background worker tunables, in file-friendly units.
#[derive(Debug, Deserialize)]
pub struct BackgroundTomlConfig {
    #[serde(default = "default_flush_interval")]
    pub impression_flush_interval_ms: u64,
    #[serde(default = "default_flush_batch")]
    pub flush_batch_size: usize,
    #[serde(default = "default_usage_capacity")]
    pub usage_channel_capacity: usize,
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_seconds: u64,
}

impl Default for BackgroundTomlConfig {
    fn default() -> Self {
        Self {
            impression_flush_interval_ms: default_flush_interval(),
            flush_batch_size: default_flush_batch(),
            usage_channel_capacity: default_usage_capacity(),
            shutdown_deadline_seconds: default_shutdown_deadline(),
        }
    }
}

impl BackgroundTomlConfig {
    /// Convert into the gateway's background configuration.
    #[must_use]
    pub fn to_background_config(&self, sweep_interval_seconds: u64) -> BackgroundConfig {
        BackgroundConfig {
            sweep_interval: Duration::from_secs(sweep_interval_seconds),
            impression_flush_interval: Duration::from_millis(self.impression_flush_interval_ms),
            flush_batch_size: self.flush_batch_size,
            usage_channel_capacity: self.usage_channel_capacity,
            shutdown_deadline: Duration::from_secs(self.shutdown_deadline_seconds),
        }
    }
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_flush_batch() -> usize {
    500
}

fn default_usage_capacity() -> usize {
    4_096
}

fn default_shutdown_deadline() -> u64 {
    10
}
