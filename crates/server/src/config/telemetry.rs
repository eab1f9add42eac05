use std::collections::HashMap;

use serde::Deserialize;

/// OpenTelemetry distributed tracing configuration.
#[derive(Debug, Deserialize)]
pub struct TelemetryConfig {
    /// Whether OTLP export is enabled. When off, only the fmt subscriber
    /// runs.
    #[serde(default)]
    pub enabled: bool,
    /// OTLP collector endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// `"grpc"` or `"http"`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Reported service name.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Trace sampling ratio in `[0, 1]`.
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
    /// Export timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Additional resource attributes.
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            protocol: default_protocol(),
            service_name: default_service_name(),
            sample_ratio: default_sample_ratio(),
            timeout_seconds: default_timeout(),
            resource_attributes: HashMap::new(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4317".to_owned()
}

fn default_protocol() -> String {
    "grpc".to_owned()
}

fn default_service_name() -> String {
    "tunetrail-server".to_owned()
}

fn default_sample_ratio() -> f64 {
    1.0
}

fn default_timeout() -> u64 {
    10
}
