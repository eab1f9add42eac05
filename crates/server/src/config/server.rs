use serde::Deserialize;

/// HTTP server bind configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Graceful shutdown timeout in seconds.
    ///
    /// Maximum time to wait for in-flight requests and background queue
    /// drains after the stop signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Allowed CORS origins. Empty means permissive (dev mode).
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Deployment edition flag surfaced on the health endpoint
    /// (e.g. `"self-hosted"`, `"cloud"`).
    #[serde(default = "default_edition")]
    pub edition: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            cors_origins: Vec::new(),
            edition: default_edition(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_edition() -> String {
    "self-hosted".to_owned()
}
