use serde::Deserialize;

/// Which cache backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

/// Cache backend configuration.
#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Redis connection settings, required when `backend = "redis"`.
    #[cfg(feature = "redis")]
    pub redis: Option<tunetrail_state_redis::RedisConfig>,
}

/// Which repository backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    #[default]
    Memory,
    Postgres,
}

/// Repository backend configuration.
#[derive(Debug, Default, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub backend: RepositoryBackend,
    /// PostgreSQL connection settings, required when
    /// `backend = "postgres"`.
    #[cfg(feature = "postgres")]
    pub postgres: Option<tunetrail_repo_postgres::PostgresConfig>,
}

/// Which engine client to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// HTTP client against the internal worker pool.
    #[default]
    Http,
    /// Canned engine (dev mode only).
    Static,
}

/// Recommendation engine configuration.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: EngineBackend,
    /// Base URL of the worker pool, required when `backend = "http"`.
    #[serde(default = "default_engine_endpoint")]
    pub endpoint: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Http,
            endpoint: default_engine_endpoint(),
        }
    }
}

fn default_engine_endpoint() -> String {
    "http://127.0.0.1:9000".to_owned()
}
