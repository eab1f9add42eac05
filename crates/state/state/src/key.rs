use serde::{Deserialize, Serialize};

/// The kind of cache entry being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Fixed-window request rate counters.
    RateCounter,
    /// Plan quota bucket counters.
    QuotaCounter,
    /// Active-session registry entries, keyed by `{user}:{device}`.
    ActiveSession,
    /// Per-session client sequence high-water marks.
    SessionSeq,
    /// Cached recommendation results, keyed by fingerprint.
    RecommendCache,
    /// Feedback idempotency markers, keyed by `{recommendation}:{signal}`.
    FeedbackDedup,
    /// Live session-token ids (`jti`); deleting one revokes the token.
    TokenJti,
    /// Cached API-key prefix lookups.
    ApiKeyLookup,
    Custom(String),
}

impl KeyKind {
    /// Return a string representation of the key kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::RateCounter => "rate",
            Self::QuotaCounter => "quota",
            Self::ActiveSession => "session_active",
            Self::SessionSeq => "session_seq",
            Self::RecommendCache => "rec_cache",
            Self::FeedbackDedup => "feedback_dedup",
            Self::TokenJti => "token_jti",
            Self::ApiKeyLookup => "api_key_lookup",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to address entries in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: KeyKind,
    pub id: String,
}

impl CacheKey {
    /// Create a new cache key.
    #[must_use]
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Return a canonical string representation: `kind:id`.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_kind_as_str() {
        assert_eq!(KeyKind::RateCounter.as_str(), "rate");
        assert_eq!(KeyKind::QuotaCounter.as_str(), "quota");
        assert_eq!(KeyKind::ActiveSession.as_str(), "session_active");
        assert_eq!(KeyKind::RecommendCache.as_str(), "rec_cache");
        assert_eq!(KeyKind::Custom("foo".into()).as_str(), "foo");
    }

    #[test]
    fn cache_key_canonical() {
        let key = CacheKey::new(KeyKind::QuotaCounter, "api_calls:org-1:1700000000");
        assert_eq!(key.canonical(), "quota:api_calls:org-1:1700000000");
    }
}
