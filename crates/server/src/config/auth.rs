use serde::Deserialize;

/// Session-token configuration.
///
/// The signing secret itself never appears in the file; the config names
/// the environment variable that carries it.
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Session token lifetime in seconds.
    #[serde(default = "default_token_expiry")]
    pub token_expiry_seconds: u64,
    /// Environment variable holding the HS256 signing secret.
    #[serde(default = "default_signing_secret_env")]
    pub signing_secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiry_seconds: default_token_expiry(),
            signing_secret_env: default_signing_secret_env(),
        }
    }
}

fn default_token_expiry() -> u64 {
    3_600
}

fn default_signing_secret_env() -> String {
    "TUNETRAIL_SIGNING_SECRET".to_owned()
}
