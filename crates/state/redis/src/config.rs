use std::time::Duration;

use serde::Deserialize;

/// Connection configuration for the Redis cache backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Key prefix applied to every key, isolating deployments sharing one
    /// Redis.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Maximum pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long to wait for a pooled connection before failing.
    #[serde(default = "default_connection_timeout", with = "seconds")]
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
            prefix: default_prefix(),
            pool_size: default_pool_size(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

fn default_prefix() -> String {
    "tunetrail".to_owned()
}

fn default_pool_size() -> usize {
    16
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
