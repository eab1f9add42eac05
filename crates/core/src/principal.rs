use serde::{Deserialize, Serialize};

use crate::plan::Plan;
use crate::types::{ApiKeyId, OrgId, UserId};

/// Named capabilities required by operations.
pub mod scopes {
    pub const WILDCARD: &str = "*";
    pub const RECOMMENDATIONS_READ: &str = "recommendations:read";
    pub const INTERACTIONS_WRITE: &str = "interactions:write";
    pub const SESSIONS_WRITE: &str = "sessions:write";
    pub const KEYS_MANAGE: &str = "keys:manage";
    pub const USAGE_READ: &str = "usage:read";
    pub const AUDIO_ANALYZE: &str = "audio:analyze";
}

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    SessionToken,
    ApiKey,
}

impl AuthMethod {
    /// Return the wire representation of the method.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionToken => "session_token",
            Self::ApiKey => "api_key",
        }
    }
}

/// The verified identity backing a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub org_id: OrgId,
    /// The organization's plan at verification time. Unknown plans floor
    /// to `free` (safe during a downgrade in flight).
    pub plan: Plan,
    pub scopes: Vec<String>,
    pub auth_method: AuthMethod,
    /// Set when the request was authenticated with an API key.
    pub key_id: Option<ApiKeyId>,
}

impl Principal {
    /// Whether this principal holds `scope` (or the wildcard).
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s == scopes::WILDCARD || s == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(scopes: &[&str]) -> Principal {
        Principal {
            user_id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            plan: Plan::Free,
            scopes: scopes.iter().map(|s| (*s).to_owned()).collect(),
            auth_method: AuthMethod::SessionToken,
            key_id: None,
        }
    }

    #[test]
    fn wildcard_grants_everything() {
        let p = principal(&["*"]);
        assert!(p.has_scope(scopes::KEYS_MANAGE));
        assert!(p.has_scope("anything:at-all"));
    }

    #[test]
    fn exact_scope_match() {
        let p = principal(&[scopes::RECOMMENDATIONS_READ]);
        assert!(p.has_scope(scopes::RECOMMENDATIONS_READ));
        assert!(!p.has_scope(scopes::KEYS_MANAGE));
    }
}
