use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use tunetrail_core::{ApiError, ErrorKind, IdGen, User};
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

/// JWT claims embedded in issued session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Organization id.
    pub org: String,
    /// Unique token id for revocation tracking.
    pub jti: String,
    /// Role name.
    pub role: String,
    /// Scopes implied by the role at issue time.
    pub scopes: Vec<String>,
    /// Expiry (seconds since epoch).
    pub exp: usize,
}

/// Manages session-token issuance and validation with cache-backed
/// revocation. The signing secret and expiry are immutable after creation
/// so existing sessions survive reloads.
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_seconds: u64,
}

impl TokenManager {
    pub fn new(secret: &str, expiry_seconds: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_seconds,
        }
    }

    /// The configured token lifetime in seconds.
    #[must_use]
    pub fn expiry_seconds(&self) -> u64 {
        self.expiry_seconds
    }

    /// Issue a token for the given user, storing the `jti` in the cache.
    pub async fn issue(
        &self,
        user: &User,
        ids: &Arc<dyn IdGen>,
        cache: &Arc<dyn CacheStore>,
    ) -> Result<(String, u64), ApiError> {
        let jti = ids.mint();
        #[allow(clippy::cast_possible_truncation)]
        let exp = jsonwebtoken::get_current_timestamp() as usize + self.expiry_seconds as usize;

        let claims = Claims {
            sub: user.id.as_str().to_owned(),
            org: user.org_id.as_str().to_owned(),
            jti: jti.clone(),
            role: user.role.to_string(),
            scopes: user.role.implied_scopes(),
            exp,
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::internal(format!("token encoding failed: {e}")))?;

        // The jti lives in the cache for the token's lifetime; deleting it
        // revokes the token.
        let key = CacheKey::new(KeyKind::TokenJti, &jti);
        cache
            .set(&key, "1", Some(Duration::from_secs(self.expiry_seconds)))
            .await
            .map_err(|e| ApiError::internal(format!("failed to store token jti: {e}")))?;

        Ok((token, self.expiry_seconds))
    }

    /// Validate a token: signature, expiry, and live `jti`.
    pub async fn validate(
        &self,
        token: &str,
        cache: &Arc<dyn CacheStore>,
    ) -> Result<Claims, ApiError> {
        let token_data =
            decode::<Claims>(token, &self.decoding_key, &Validation::default()).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        ApiError::new(ErrorKind::ExpiredCredential, "session token has expired")
                    }
                    _ => ApiError::new(ErrorKind::MalformedCredential, "invalid session token"),
                }
            })?;

        let claims = token_data.claims;
        let key = CacheKey::new(KeyKind::TokenJti, &claims.jti);
        let live = cache
            .get(&key)
            .await
            .map_err(|e| ApiError::internal(format!("token revocation lookup failed: {e}")))?;

        if live.is_none() {
            return Err(ApiError::new(
                ErrorKind::RevokedCredential,
                "session token has been revoked",
            ));
        }

        Ok(claims)
    }

    /// Revoke a token by deleting its `jti` (logout).
    pub async fn revoke(
        &self,
        token: &str,
        cache: &Arc<dyn CacheStore>,
    ) -> Result<(), ApiError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| ApiError::new(ErrorKind::MalformedCredential, "invalid session token"))?;

        let key = CacheKey::new(KeyKind::TokenJti, &token_data.claims.jti);
        cache
            .delete(&key)
            .await
            .map_err(|e| ApiError::internal(format!("failed to revoke token: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tunetrail_core::{OrgId, SequenceIdGen, UserId, UserRole};
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    fn user() -> User {
        User {
            id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            email: "a@b.c".to_owned(),
            username: None,
            password_hash: String::new(),
            role: UserRole::User,
            is_active: true,
            email_verified: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn issue_validate_revoke() {
        let manager = TokenManager::new("test-secret", 3_600);
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let ids: Arc<dyn IdGen> = Arc::new(SequenceIdGen::new("jti"));

        let (token, expires_in) = manager.issue(&user(), &ids, &cache).await.unwrap();
        assert_eq!(expires_in, 3_600);

        let claims = manager.validate(&token, &cache).await.unwrap();
        assert_eq!(claims.sub, "usr-1");
        assert_eq!(claims.org, "org-1");

        manager.revoke(&token, &cache).await.unwrap();
        let err = manager.validate(&token, &cache).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevokedCredential);
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let manager = TokenManager::new("test-secret", 3_600);
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let err = manager.validate("not-a-jwt", &cache).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedCredential);
    }
}
