mod auth;
mod backends;
mod gateway;
mod server;
mod telemetry;

pub use auth::*;
pub use backends::*;
pub use gateway::*;
pub use server::*;
pub use telemetry::*;

use serde::Deserialize;

/// Top-level configuration for the TuneTrail server, loaded from a TOML
/// file.
#[derive(Debug, Default, Deserialize)]
pub struct TuneTrailConfig {
    /// HTTP server bind configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Cache backend configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Repository backend configuration.
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// Recommendation engine endpoint configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Session-token signing and expiry configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Dispatcher tunables (cache TTLs, retry backoff, limits).
    #[serde(default)]
    pub dispatcher: DispatcherTomlConfig,
    /// Session lifecycle tunables.
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// API key lifecycle tunables.
    #[serde(default)]
    pub keys: KeysConfig,
    /// Background worker intervals and shutdown budget.
    #[serde(default)]
    pub background: BackgroundTomlConfig,
    /// Plan catalog override. The built-in table applies when absent.
    pub plans: Option<tunetrail_core::PlanCatalog>,
    /// OpenTelemetry distributed tracing configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: TuneTrailConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.sessions.idle_timeout_seconds, 900);
        assert!(config.plans.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: TuneTrailConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9090
            cors_origins = ["https://app.tunetrail.dev"]
            edition = "cloud"

            [cache]
            backend = "redis"
            [cache.redis]
            url = "redis://cache:6379"

            [repository]
            backend = "postgres"
            [repository.postgres]
            url = "postgres://db/tunetrail"

            [engine]
            backend = "http"
            endpoint = "http://engine:9000"

            [auth]
            token_expiry_seconds = 7200
            signing_secret_env = "TT_SECRET"

            [dispatcher]
            cache_ttl_seconds = 120
            stale_while_error_seconds = 1800

            [sessions]
            idle_timeout_seconds = 600
            sweep_interval_seconds = 30

            [keys]
            rotation_grace_hours = 12

            [telemetry]
            enabled = true
            endpoint = "http://otel:4317"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.repository.backend, RepositoryBackend::Postgres);
        assert_eq!(config.dispatcher.stale_while_error_seconds, 1800);
        assert_eq!(config.keys.rotation_grace_hours, 12);
        assert!(config.telemetry.enabled);
    }
}
