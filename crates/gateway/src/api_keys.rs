//! API-key lifecycle: issue, list, rotate, revoke, usage analytics.
//!
//! The full secret is returned exactly once, at creation. Every later read
//! gets the redacted form. Rotation keeps the old key alive for a grace
//! period so deployed clients can switch over.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use tunetrail_core::{
    ApiError, ApiKey, ApiKeyEnvironment, ApiKeyId, Clock, ErrorKind, IdGen, KeyWindowLimits,
    Principal, RedactedApiKey,
};
use tunetrail_repo::Repository;
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::secret;

/// Client request to mint a key.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueKeyRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub environment: ApiKeyEnvironment,
    #[serde(default)]
    pub limits: KeyWindowLimits,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_allowlist: Option<Vec<String>>,
}

/// A freshly minted key. `secret` appears here and nowhere else, ever.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub secret: String,
    pub key: RedactedApiKey,
}

/// Result of a rotation: the old key's id (now on a revocation timer) and
/// the replacement.
#[derive(Debug, Clone, Serialize)]
pub struct RotatedKey {
    pub old_key_id: ApiKeyId,
    pub old_key_revoked_at: DateTime<Utc>,
    pub new_key: IssuedKey,
}

/// Usage analytics aggregated from the append-only usage log.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub key_id: ApiKeyId,
    pub window_days: u32,
    pub total_requests: u64,
    /// Requests per UTC day, oldest first.
    pub by_day: Vec<DayCount>,
    /// Requests per endpoint, busiest first.
    pub by_endpoint: Vec<EndpointCount>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayCount {
    pub day: String,
    pub requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCount {
    pub endpoint: String,
    pub requests: u64,
}

/// Manages the API-key lifecycle.
pub struct ApiKeyService {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    metrics: Arc<GatewayMetrics>,
    rotation_grace: Duration,
}

impl ApiKeyService {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        metrics: Arc<GatewayMetrics>,
        rotation_grace: Duration,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ids,
            metrics,
            rotation_grace,
        }
    }

    /// Mint a new key for the caller. Returns the full secret exactly once.
    #[instrument(name = "api_keys.issue", skip_all, fields(user = %principal.user_id))]
    pub async fn issue(
        &self,
        principal: &Principal,
        request: IssueKeyRequest,
    ) -> Result<IssuedKey, GatewayError> {
        if request.name.trim().is_empty() {
            return Err(GatewayError::Api(ApiError::validation(
                "key name must not be empty",
            )));
        }
        // A key can never grant more than its owner holds.
        for scope in &request.scopes {
            if !principal.has_scope(scope) {
                return Err(GatewayError::Api(ApiError::validation(format!(
                    "cannot grant scope '{scope}' the caller does not hold"
                ))));
            }
        }

        let full_secret = secret::generate_secret();
        let prefix = secret::secret_prefix(&full_secret);
        let hash = secret::hash_secret(&full_secret)
            .map_err(GatewayError::Configuration)?;

        let scopes = if request.scopes.is_empty() {
            principal.scopes.clone()
        } else {
            request.scopes
        };

        let key = ApiKey {
            id: ApiKeyId::new(self.ids.mint()),
            owner_user_id: principal.user_id.clone(),
            org_id: principal.org_id.clone(),
            name: request.name,
            hash,
            prefix: prefix.clone(),
            scopes,
            environment: request.environment,
            limits: request.limits,
            expires_at: request.expires_at,
            revoked_at: None,
            last_used_at: None,
            ip_allowlist: request.ip_allowlist,
            created_at: self.clock.now(),
        };
        self.repo.insert_api_key(&key).await?;
        self.invalidate_prefix(&prefix).await;

        GatewayMetrics::bump(&self.metrics.keys_issued);
        info!(key_id = %key.id, prefix = %key.prefix, "api key issued");

        Ok(IssuedKey {
            secret: full_secret,
            key: key.redacted(),
        })
    }

    /// All of the caller's keys, redacted.
    pub async fn list(&self, principal: &Principal) -> Result<Vec<RedactedApiKey>, GatewayError> {
        let keys = self.repo.api_keys_for_user(&principal.user_id).await?;
        Ok(keys.iter().map(ApiKey::redacted).collect())
    }

    /// Rotate a key: mint a replacement with identical scopes, limits, and
    /// environment, and put the old key on the revocation timer.
    #[instrument(name = "api_keys.rotate", skip_all, fields(key = %key_id))]
    pub async fn rotate(
        &self,
        principal: &Principal,
        key_id: &ApiKeyId,
    ) -> Result<RotatedKey, GatewayError> {
        let old = self.owned_key(principal, key_id).await?;

        let full_secret = secret::generate_secret();
        let prefix = secret::secret_prefix(&full_secret);
        let hash = secret::hash_secret(&full_secret)
            .map_err(GatewayError::Configuration)?;

        let now = self.clock.now();
        let new_key = ApiKey {
            id: ApiKeyId::new(self.ids.mint()),
            owner_user_id: old.owner_user_id.clone(),
            org_id: old.org_id.clone(),
            name: old.name.clone(),
            hash,
            prefix: prefix.clone(),
            scopes: old.scopes.clone(),
            environment: old.environment,
            limits: old.limits,
            expires_at: old.expires_at,
            revoked_at: None,
            last_used_at: None,
            ip_allowlist: old.ip_allowlist.clone(),
            created_at: now,
        };
        self.repo.insert_api_key(&new_key).await?;

        let old_revoked_at = now + self.rotation_grace;
        self.repo
            .set_api_key_revoked_at(&old.id, old_revoked_at)
            .await?;
        self.invalidate_prefix(&old.prefix).await;
        self.invalidate_prefix(&prefix).await;

        GatewayMetrics::bump(&self.metrics.keys_rotated);
        info!(old_key = %old.id, new_key = %new_key.id, "api key rotated");

        Ok(RotatedKey {
            old_key_id: old.id,
            old_key_revoked_at: old_revoked_at,
            new_key: IssuedKey {
                secret: full_secret,
                key: new_key.redacted(),
            },
        })
    }

    /// Revoke a key immediately.
    #[instrument(name = "api_keys.revoke", skip_all, fields(key = %key_id))]
    pub async fn revoke(
        &self,
        principal: &Principal,
        key_id: &ApiKeyId,
    ) -> Result<RedactedApiKey, GatewayError> {
        let key = self.owned_key(principal, key_id).await?;
        let now = self.clock.now();
        self.repo.set_api_key_revoked_at(&key.id, now).await?;
        self.invalidate_prefix(&key.prefix).await;

        GatewayMetrics::bump(&self.metrics.keys_revoked);
        info!(key_id = %key.id, "api key revoked");

        let mut redacted = key.redacted();
        redacted.revoked_at = Some(now);
        Ok(redacted)
    }

    /// Aggregate the usage log for one key over the last `window_days`.
    pub async fn usage(
        &self,
        principal: &Principal,
        key_id: &ApiKeyId,
        window_days: u32,
    ) -> Result<UsageReport, GatewayError> {
        let key = self.owned_key(principal, key_id).await?;
        let window_days = window_days.clamp(1, 90);
        let since = self.clock.now() - Duration::days(i64::from(window_days));
        let records = self.repo.key_usage_since(&key.id, since).await?;

        let mut by_day: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_endpoint: BTreeMap<String, u64> = BTreeMap::new();
        for record in &records {
            *by_day
                .entry(record.occurred_at.format("%Y-%m-%d").to_string())
                .or_default() += 1;
            *by_endpoint.entry(record.endpoint.clone()).or_default() += 1;
        }

        let mut by_endpoint: Vec<EndpointCount> = by_endpoint
            .into_iter()
            .map(|(endpoint, requests)| EndpointCount { endpoint, requests })
            .collect();
        by_endpoint.sort_by(|a, b| b.requests.cmp(&a.requests));

        Ok(UsageReport {
            key_id: key.id,
            window_days,
            total_requests: records.len() as u64,
            by_day: by_day
                .into_iter()
                .map(|(day, requests)| DayCount { day, requests })
                .collect(),
            by_endpoint,
            last_used_at: key.last_used_at,
        })
    }

    /// Fetch a key and check ownership. Foreign keys read as missing.
    async fn owned_key(
        &self,
        principal: &Principal,
        key_id: &ApiKeyId,
    ) -> Result<ApiKey, GatewayError> {
        match self.repo.api_key_by_id(key_id).await? {
            Some(key) if key.owner_user_id == principal.user_id => Ok(key),
            _ => Err(GatewayError::api(ErrorKind::NotFound, "api key not found")),
        }
    }

    /// Drop the cached prefix lookup so verification sees the change.
    async fn invalidate_prefix(&self, prefix: &str) {
        let key = CacheKey::new(KeyKind::ApiKeyLookup, prefix);
        if let Err(e) = self.cache.delete(&key).await {
            tracing::warn!(error = %e, prefix, "failed to invalidate api key lookup cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use tunetrail_core::{ApiKeyUsageRecord, AuthMethod, ManualClock, OrgId, Plan, SequenceIdGen, UserId};
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    struct Fixture {
        service: ApiKeyService,
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let repo = Arc::new(MemoryRepository::new());
        let service = ApiKeyService::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::new(MemoryCacheStore::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(SequenceIdGen::new("key")),
            Arc::new(GatewayMetrics::default()),
            Duration::hours(24),
        );
        Fixture {
            service,
            repo,
            clock,
        }
    }

    fn principal() -> Principal {
        Principal {
            user_id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            plan: Plan::Pro,
            scopes: vec!["*".to_owned()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
        }
    }

    fn issue_request() -> IssueKeyRequest {
        IssueKeyRequest {
            name: "ci".to_owned(),
            scopes: vec!["recommendations:read".to_owned()],
            environment: ApiKeyEnvironment::Production,
            limits: KeyWindowLimits::default(),
            expires_at: None,
            ip_allowlist: None,
        }
    }

    #[tokio::test]
    async fn issue_returns_the_secret_exactly_once() {
        let f = fixture();
        let issued = f.service.issue(&principal(), issue_request()).await.unwrap();

        assert!(issued.secret.starts_with("tt_"));
        assert_eq!(issued.secret.len(), 46);
        assert!(issued.key.key_preview.ends_with('\u{2022}'));

        // The stored row holds a hash, never the secret.
        let stored = f
            .repo
            .api_key_by_id(&issued.key.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.hash.starts_with("$argon2"));
        assert_ne!(stored.hash, issued.secret);
        assert!(crate::secret::verify_secret(&stored.hash, &issued.secret));

        // Listing yields only redacted forms.
        let listed = f.service.list(&principal()).await.unwrap();
        assert_eq!(listed.len(), 1);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains(&issued.secret));
    }

    #[tokio::test]
    async fn scopes_cannot_exceed_the_owner() {
        let f = fixture();
        let mut p = principal();
        p.scopes = vec!["recommendations:read".to_owned()];

        let mut request = issue_request();
        request.scopes = vec!["keys:manage".to_owned()];
        let err = f.service.issue(&p, request).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));
    }

    #[tokio::test]
    async fn rotation_keeps_the_old_key_alive_for_the_grace_period() {
        let f = fixture();
        let p = principal();
        let issued = f.service.issue(&p, issue_request()).await.unwrap();

        let rotated = f.service.rotate(&p, &issued.key.id).await.unwrap();
        assert_ne!(rotated.new_key.key.id, issued.key.id);
        assert_eq!(rotated.new_key.key.scopes, issued.key.scopes);

        let old = f
            .repo
            .api_key_by_id(&issued.key.id)
            .await
            .unwrap()
            .unwrap();
        // Still operational inside the grace window.
        assert!(old.check_operational(f.clock.now()).is_ok());
        f.clock.advance(Duration::hours(25));
        assert_eq!(
            old.check_operational(f.clock.now()),
            Err(ErrorKind::RevokedCredential)
        );
    }

    #[tokio::test]
    async fn revoke_applies_immediately() {
        let f = fixture();
        let p = principal();
        let issued = f.service.issue(&p, issue_request()).await.unwrap();

        f.service.revoke(&p, &issued.key.id).await.unwrap();
        let stored = f
            .repo
            .api_key_by_id(&issued.key.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.check_operational(f.clock.now()),
            Err(ErrorKind::RevokedCredential)
        );
    }

    #[tokio::test]
    async fn foreign_key_reads_as_missing() {
        let f = fixture();
        let p = principal();
        let issued = f.service.issue(&p, issue_request()).await.unwrap();

        let mut other = principal();
        other.user_id = UserId::new("usr-2");
        let err = f.service.revoke(&other, &issued.key.id).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn usage_aggregates_by_day_and_endpoint() {
        let f = fixture();
        let p = principal();
        let issued = f.service.issue(&p, issue_request()).await.unwrap();

        for endpoint in ["/api/v1/recommendations", "/api/v1/recommendations", "/api/v1/interactions"] {
            f.repo
                .append_key_usage(&ApiKeyUsageRecord {
                    key_id: issued.key.id.clone(),
                    endpoint: endpoint.to_owned(),
                    status: 200,
                    occurred_at: f.clock.now(),
                })
                .await
                .unwrap();
        }

        let report = f.service.usage(&p, &issued.key.id, 30).await.unwrap();
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.by_day.len(), 1);
        assert_eq!(report.by_endpoint[0].endpoint, "/api/v1/recommendations");
        assert_eq!(report.by_endpoint[0].requests, 2);
    }
}
