//! Credential verification and principal resolution.
//!
//! Two credential carriers share the `Authorization: Bearer` scheme: signed
//! short-lived session tokens and long-lived `tt_` API keys. Discrimination
//! is by shape; anything matching the API-key pattern goes down the key
//! path, everything else is treated as a session token.

pub mod middleware;
pub mod password;
pub mod token;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use tunetrail_core::{
    ApiError, ApiKey, AuthMethod, Clock, ErrorKind, IdGen, Organization, Plan, Principal, User,
    UserId, UserRole, normalize_email,
};
use tunetrail_repo::{RepoError, Repository};
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use tunetrail_gateway::secret;

use self::token::TokenManager;

/// Shape of an API key: literal `tt_` prefix plus at least 32 url-safe
/// characters.
static API_KEY_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tt_[A-Za-z0-9_-]{32,}$").expect("static regex must compile"));

/// How long a prefix lookup stays cached before verification re-reads the
/// repository.
const PREFIX_CACHE_TTL: Duration = Duration::from_secs(300);

/// Registration request body.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: Option<String>,
    /// Slug for the organization created at signup. Derived from the email
    /// when omitted.
    pub org_slug: Option<String>,
}

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// An issued session: the signed token and its lifetime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub expires_in: u64,
    pub user_id: UserId,
}

/// A verified request identity: the principal plus the API key that backed
/// it, when one did.
#[derive(Debug, Clone)]
pub struct Verified {
    pub principal: Principal,
    pub api_key: Option<Arc<ApiKey>>,
}

/// Resolves inbound credentials to principals and owns the account
/// endpoints (register, login, logout).
pub struct AuthService {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    tokens: TokenManager,
}

impl AuthService {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        tokens: TokenManager,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ids,
            tokens,
        }
    }

    /// Register a new account. Creates the organization (free plan) and
    /// its first user as owner, then issues a session token.
    #[instrument(name = "auth.register", skip_all)]
    pub async fn register(&self, request: RegisterRequest) -> Result<IssuedSession, ApiError> {
        let email = normalize_email(&request.email);
        if !email.contains('@') || email.len() < 3 {
            return Err(ApiError::validation("a valid email is required"));
        }
        if request.password.len() < 12 {
            return Err(ApiError::validation(
                "password must be at least 12 characters",
            ));
        }

        let slug = match request.org_slug {
            Some(s) => s.trim().to_lowercase(),
            None => {
                let local: String = email
                    .split('@')
                    .next()
                    .unwrap_or("org")
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect();
                let local = if local.is_empty() { "org".to_owned() } else { local };
                let suffix = self.ids.mint();
                let suffix = &suffix[..suffix.len().min(8)];
                format!("{local}-{suffix}")
            }
        };
        if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ApiError::validation(
                "org_slug may contain only letters, digits, and dashes",
            ));
        }

        let now = self.clock.now();
        let org = Organization {
            id: tunetrail_core::OrgId::new(self.ids.mint()),
            slug,
            plan: Plan::Free,
            max_users: None,
            max_tracks: None,
            feature_overrides: std::collections::HashMap::new(),
            created_at: now,
        };
        self.repo
            .create_organization(&org)
            .await
            .map_err(conflict_to_validation)?;

        let password_hash =
            password::hash_password(&request.password).map_err(ApiError::internal)?;
        let user = User {
            id: UserId::new(self.ids.mint()),
            org_id: org.id.clone(),
            email,
            username: request.username,
            password_hash,
            role: UserRole::Owner,
            is_active: true,
            email_verified: false,
            created_at: now,
        };
        self.repo
            .create_user(&user)
            .await
            .map_err(conflict_to_validation)?;

        info!(user = %user.id, org = %user.org_id, "account registered");

        let (token, expires_in) = self.tokens.issue(&user, &self.ids, &self.cache).await?;
        Ok(IssuedSession {
            token,
            expires_in,
            user_id: user.id,
        })
    }

    /// Verify a password and issue a session token.
    #[instrument(name = "auth.login", skip_all)]
    pub async fn login(&self, request: LoginRequest) -> Result<IssuedSession, ApiError> {
        let email = normalize_email(&request.email);
        let user = self
            .repo
            .user_by_email(&email)
            .await
            .map_err(repo_internal)?;

        // One failure shape for unknown emails and wrong passwords.
        let invalid = || ApiError::new(ErrorKind::UnknownCredential, "invalid credentials");
        let Some(user) = user else {
            return Err(invalid());
        };
        if !password::verify_password(&user.password_hash, &request.password) {
            return Err(invalid());
        }
        if !user.is_active {
            return Err(ApiError::new(
                ErrorKind::RevokedCredential,
                "account is deactivated",
            ));
        }

        let (token, expires_in) = self.tokens.issue(&user, &self.ids, &self.cache).await?;
        Ok(IssuedSession {
            token,
            expires_in,
            user_id: user.id,
        })
    }

    /// Revoke the presented session token.
    pub async fn logout(&self, token: &str) -> Result<(), ApiError> {
        self.tokens.revoke(token, &self.cache).await
    }

    /// Resolve a bearer credential to a principal.
    ///
    /// `remote_ip` is the caller address used against API-key allowlists.
    #[instrument(name = "auth.verify", skip_all)]
    pub async fn verify(
        &self,
        bearer: &str,
        remote_ip: Option<&str>,
    ) -> Result<Verified, ApiError> {
        if API_KEY_SHAPE.is_match(bearer) {
            self.verify_api_key(bearer, remote_ip).await
        } else {
            self.verify_session_token(bearer).await
        }
    }

    async fn verify_session_token(&self, token: &str) -> Result<Verified, ApiError> {
        let claims = self.tokens.validate(token, &self.cache).await?;

        let user_id = UserId::new(claims.sub);
        let org_id = tunetrail_core::OrgId::new(claims.org);
        let plan = self.resolve_plan(&org_id).await;

        Ok(Verified {
            principal: Principal {
                user_id,
                org_id,
                plan,
                scopes: claims.scopes,
                auth_method: AuthMethod::SessionToken,
                key_id: None,
            },
            api_key: None,
        })
    }

    async fn verify_api_key(
        &self,
        presented: &str,
        remote_ip: Option<&str>,
    ) -> Result<Verified, ApiError> {
        let prefix = secret::secret_prefix(presented);
        let candidates = self.candidate_keys(&prefix).await?;

        // Prefix collisions are possible; the unique match is the row
        // whose memory-hard hash verifies. The comparison is constant-time
        // inside the verifier.
        let matched = candidates
            .into_iter()
            .find(|key| secret::verify_secret(&key.hash, presented));
        let Some(key) = matched else {
            return Err(ApiError::new(ErrorKind::UnknownCredential, "unknown API key"));
        };

        let now = self.clock.now();
        key.check_operational(now).map_err(|kind| match kind {
            ErrorKind::RevokedCredential => {
                ApiError::new(kind, "API key has been revoked")
            }
            _ => ApiError::new(kind, "API key has expired"),
        })?;

        if let Some(ref allowlist) = key.ip_allowlist
            && !allowlist.is_empty()
        {
            let allowed =
                remote_ip.is_some_and(|ip| allowlist.iter().any(|entry| entry == ip));
            if !allowed {
                return Err(ApiError::new(
                    ErrorKind::IpNotAllowed,
                    "caller address is not on the key's allowlist",
                ));
            }
        }

        let user = self
            .repo
            .user_by_id(&key.owner_user_id)
            .await
            .map_err(repo_internal)?;
        let Some(user) = user else {
            return Err(ApiError::new(ErrorKind::UnknownCredential, "unknown API key"));
        };
        if !user.is_active {
            return Err(ApiError::new(
                ErrorKind::RevokedCredential,
                "owner account is deactivated",
            ));
        }

        let plan = self.resolve_plan(&key.org_id).await;

        Ok(Verified {
            principal: Principal {
                user_id: key.owner_user_id.clone(),
                org_id: key.org_id.clone(),
                plan,
                scopes: key.scopes.clone(),
                auth_method: AuthMethod::ApiKey,
                key_id: Some(key.id.clone()),
            },
            api_key: Some(Arc::new(key)),
        })
    }

    /// Candidate keys for a presented prefix, via the lookup cache.
    ///
    /// Only key ids are cached; the rows themselves are re-read so
    /// revocations apply without waiting out the cache TTL.
    async fn candidate_keys(&self, prefix: &str) -> Result<Vec<ApiKey>, ApiError> {
        let cache_key = CacheKey::new(KeyKind::ApiKeyLookup, prefix);

        let cached_ids: Option<Vec<String>> = match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "api key lookup cache unavailable");
                None
            }
        };

        if let Some(ids) = cached_ids {
            let mut keys = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(key) = self
                    .repo
                    .api_key_by_id(&tunetrail_core::ApiKeyId::new(id))
                    .await
                    .map_err(repo_internal)?
                {
                    keys.push(key);
                }
            }
            return Ok(keys);
        }

        let keys = self
            .repo
            .api_keys_by_prefix(prefix)
            .await
            .map_err(repo_internal)?;

        let ids: Vec<&str> = keys.iter().map(|k| k.id.as_str()).collect();
        if let Ok(serialized) = serde_json::to_string(&ids)
            && let Err(e) = self
                .cache
                .set(&cache_key, &serialized, Some(PREFIX_CACHE_TTL))
                .await
        {
            warn!(error = %e, "failed to cache api key lookup");
        }

        Ok(keys)
    }

    /// The org's plan, floored to `free` when the org cannot be resolved
    /// (e.g. a downgrade in flight).
    async fn resolve_plan(&self, org_id: &tunetrail_core::OrgId) -> Plan {
        match self.repo.organization_by_id(org_id).await {
            Ok(Some(org)) => org.plan,
            Ok(None) => Plan::Free,
            Err(e) => {
                warn!(error = %e, org = %org_id, "plan lookup failed, flooring to free");
                Plan::Free
            }
        }
    }
}

fn conflict_to_validation(e: RepoError) -> ApiError {
    match e {
        RepoError::Conflict(msg) => ApiError::validation(msg),
        other => ApiError::internal(other.to_string()),
    }
}

fn repo_internal(e: RepoError) -> ApiError {
    ApiError::internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use tunetrail_core::{ManualClock, SequenceIdGen};
    use tunetrail_gateway::{ApiKeyService, GatewayMetrics, IssueKeyRequest};
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    struct Fixture {
        auth: AuthService,
        keys: ApiKeyService,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let ids = Arc::new(SequenceIdGen::new("id"));

        let auth = AuthService::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&ids) as Arc<dyn IdGen>,
            TokenManager::new("test-secret", 3_600),
        );
        let keys = ApiKeyService::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            ids as Arc<dyn IdGen>,
            Arc::new(GatewayMetrics::default()),
            ChronoDuration::hours(24),
        );
        Fixture { auth, keys, clock }
    }

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            email: "Owner@Example.com".to_owned(),
            password: "a-long-password".to_owned(),
            username: None,
            org_slug: Some("acme".to_owned()),
        }
    }

    #[tokio::test]
    async fn register_login_verify_logout() {
        let f = fixture();

        let session = f.auth.register(register_request()).await.unwrap();
        let verified = f.auth.verify(&session.token, None).await.unwrap();
        assert_eq!(verified.principal.auth_method, AuthMethod::SessionToken);
        assert_eq!(verified.principal.plan, Plan::Free);
        assert!(verified.principal.has_scope("anything")); // owner wildcard

        // Email comparison is case-folded.
        let relogin = f
            .auth
            .login(LoginRequest {
                email: "owner@example.COM".to_owned(),
                password: "a-long-password".to_owned(),
            })
            .await
            .unwrap();

        f.auth.logout(&relogin.token).await.unwrap();
        let err = f.auth.verify(&relogin.token, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevokedCredential);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_identical() {
        let f = fixture();
        f.auth.register(register_request()).await.unwrap();

        let a = f
            .auth
            .login(LoginRequest {
                email: "owner@example.com".to_owned(),
                password: "wrong-password!".to_owned(),
            })
            .await
            .unwrap_err();
        let b = f
            .auth
            .login(LoginRequest {
                email: "nobody@example.com".to_owned(),
                password: "wrong-password!".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(a.kind, ErrorKind::UnknownCredential);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.message, b.message);
    }

    async fn issue_key(f: &Fixture) -> (Principal, tunetrail_gateway::IssuedKey) {
        let session = f.auth.register(register_request()).await.unwrap();
        let verified = f.auth.verify(&session.token, None).await.unwrap();
        let issued = f
            .keys
            .issue(
                &verified.principal,
                IssueKeyRequest {
                    name: "ci".to_owned(),
                    scopes: vec![],
                    environment: tunetrail_core::ApiKeyEnvironment::Production,
                    limits: tunetrail_core::KeyWindowLimits::default(),
                    expires_at: None,
                    ip_allowlist: None,
                },
            )
            .await
            .unwrap();
        (verified.principal, issued)
    }

    #[tokio::test]
    async fn api_key_verifies_and_respects_revocation() {
        let f = fixture();
        let (principal, issued) = issue_key(&f).await;

        let verified = f.auth.verify(&issued.secret, None).await.unwrap();
        assert_eq!(verified.principal.auth_method, AuthMethod::ApiKey);
        assert_eq!(verified.principal.user_id, principal.user_id);
        assert_eq!(verified.principal.key_id, Some(issued.key.id.clone()));

        f.keys.revoke(&principal, &issued.key.id).await.unwrap();
        let err = f.auth.verify(&issued.secret, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevokedCredential);
    }

    #[tokio::test]
    async fn rotation_grace_keeps_both_keys_working_then_only_the_new() {
        let f = fixture();
        let (principal, issued) = issue_key(&f).await;

        let rotated = f.keys.rotate(&principal, &issued.key.id).await.unwrap();

        // Inside the 24h grace window both secrets authenticate.
        f.auth.verify(&issued.secret, None).await.unwrap();
        f.auth.verify(&rotated.new_key.secret, None).await.unwrap();

        // After the grace window only the replacement works.
        f.clock.advance(ChronoDuration::hours(25));
        let err = f.auth.verify(&issued.secret, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevokedCredential);
        f.auth.verify(&rotated.new_key.secret, None).await.unwrap();
    }

    #[tokio::test]
    async fn ip_allowlist_is_enforced() {
        let f = fixture();
        let session = f.auth.register(register_request()).await.unwrap();
        let verified = f.auth.verify(&session.token, None).await.unwrap();
        let issued = f
            .keys
            .issue(
                &verified.principal,
                IssueKeyRequest {
                    name: "locked".to_owned(),
                    scopes: vec![],
                    environment: tunetrail_core::ApiKeyEnvironment::Production,
                    limits: tunetrail_core::KeyWindowLimits::default(),
                    expires_at: None,
                    ip_allowlist: Some(vec!["10.0.0.1".to_owned()]),
                },
            )
            .await
            .unwrap();

        let err = f
            .auth
            .verify(&issued.secret, Some("192.168.1.5"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IpNotAllowed);

        let err = f.auth.verify(&issued.secret, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::IpNotAllowed);

        f.auth
            .verify(&issued.secret, Some("10.0.0.1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_short_key_is_unknown_not_a_token() {
        let f = fixture();
        // Shaped like a key but too short: treated as a session token and
        // rejected as malformed.
        let err = f.auth.verify("tt_short", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedCredential);
    }
}
