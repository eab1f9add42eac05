use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{ApiKeyId, OrgId, UserId};

/// Number of leading characters of the presented secret stored as the
/// lookup prefix (`tt_` plus the first seven body characters).
pub const API_KEY_PREFIX_LEN: usize = 10;

/// Deployment environment a key is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyEnvironment {
    Development,
    Staging,
    #[default]
    Production,
}

impl ApiKeyEnvironment {
    /// Return the wire representation of the environment.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

/// Per-key request limits, evaluated in addition to the plan quotas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWindowLimits {
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
}

/// A long-lived API credential. The full secret is never stored; only its
/// argon2id hash and the lookup prefix survive creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub owner_user_id: UserId,
    pub org_id: OrgId,
    /// Human-readable label chosen by the owner.
    pub name: String,
    /// Argon2id PHC string of the full secret.
    #[serde(skip_serializing, default)]
    pub hash: String,
    /// First [`API_KEY_PREFIX_LEN`] characters of the presented key.
    pub prefix: String,
    pub scopes: Vec<String>,
    pub environment: ApiKeyEnvironment,
    #[serde(default)]
    pub limits: KeyWindowLimits,
    pub expires_at: Option<DateTime<Utc>>,
    /// When set and in the past, the key no longer authenticates. A value
    /// in the future marks a rotation grace period.
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub ip_allowlist: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Check whether the key authenticates at `now`.
    ///
    /// A `revoked_at` in the future (rotation grace) still authenticates.
    pub fn check_operational(&self, now: DateTime<Utc>) -> Result<(), ErrorKind> {
        if let Some(revoked_at) = self.revoked_at
            && revoked_at <= now
        {
            return Err(ErrorKind::RevokedCredential);
        }
        if let Some(expires_at) = self.expires_at
            && expires_at <= now
        {
            return Err(ErrorKind::ExpiredCredential);
        }
        Ok(())
    }

    /// The redacted representation returned on all reads after creation.
    #[must_use]
    pub fn redacted(&self) -> RedactedApiKey {
        RedactedApiKey {
            id: self.id.clone(),
            name: self.name.clone(),
            key_preview: format!("{}\u{2022}\u{2022}\u{2022}", self.prefix),
            scopes: self.scopes.clone(),
            environment: self.environment,
            limits: self.limits,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
        }
    }
}

/// Client-facing view of a key: prefix plus bullets, never the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedApiKey {
    pub id: ApiKeyId,
    pub name: String,
    pub key_preview: String,
    pub scopes: Vec<String>,
    pub environment: ApiKeyEnvironment,
    pub limits: KeyWindowLimits,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only API usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyUsageRecord {
    pub key_id: ApiKeyId,
    pub endpoint: String,
    pub status: u16,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(revoked_at: Option<DateTime<Utc>>, expires_at: Option<DateTime<Utc>>) -> ApiKey {
        ApiKey {
            id: ApiKeyId::new("key-1"),
            owner_user_id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            name: "ci".to_owned(),
            hash: "$argon2id$v=19$m=19456,t=2,p=1$salt$digest".to_owned(),
            prefix: "tt_abcdefg".to_owned(),
            scopes: vec!["*".to_owned()],
            environment: ApiKeyEnvironment::Production,
            limits: KeyWindowLimits::default(),
            expires_at,
            revoked_at,
            last_used_at: None,
            ip_allowlist: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn future_revocation_still_authenticates() {
        let now = Utc::now();
        let k = key(Some(now + Duration::hours(24)), None);
        assert!(k.check_operational(now).is_ok());
        assert_eq!(
            k.check_operational(now + Duration::hours(25)),
            Err(ErrorKind::RevokedCredential)
        );
    }

    #[test]
    fn expired_key_is_rejected() {
        let now = Utc::now();
        let k = key(None, Some(now - Duration::seconds(1)));
        assert_eq!(
            k.check_operational(now),
            Err(ErrorKind::ExpiredCredential)
        );
    }

    #[test]
    fn redacted_view_hides_the_hash() {
        let k = key(None, None);
        let redacted = k.redacted();
        assert_eq!(redacted.key_preview, "tt_abcdefg\u{2022}\u{2022}\u{2022}");
        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("argon2id"));
    }
}
