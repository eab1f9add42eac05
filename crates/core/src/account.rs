use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;
use crate::principal::scopes;
use crate::types::{OrgId, UserId};

/// Case-fold an email for storage and comparison.
#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Role of a user within their organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
    Owner,
}

impl UserRole {
    /// Parse a role from a string, case-insensitively.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// The scope set a session token carries for this role.
    #[must_use]
    pub fn implied_scopes(self) -> Vec<String> {
        match self {
            Self::User => vec![
                scopes::RECOMMENDATIONS_READ.to_owned(),
                scopes::INTERACTIONS_WRITE.to_owned(),
                scopes::SESSIONS_WRITE.to_owned(),
                scopes::KEYS_MANAGE.to_owned(),
                scopes::AUDIO_ANALYZE.to_owned(),
            ],
            Self::Admin | Self::Owner => vec![scopes::WILDCARD.to_owned()],
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Admin => f.write_str("admin"),
            Self::Owner => f.write_str("owner"),
        }
    }
}

/// A billing tenant. Owns its users and their API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    /// Unique, URL-safe identifier chosen at signup.
    pub slug: String,
    pub plan: Plan,
    pub max_users: Option<u32>,
    pub max_tracks: Option<u64>,
    /// Per-org feature overrides layered on top of the plan catalog.
    /// `true` force-enables, `false` force-disables.
    #[serde(default)]
    pub feature_overrides: HashMap<String, bool>,
    pub created_at: DateTime<Utc>,
}

/// A user account. `email` is stored case-folded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub org_id: OrgId,
    pub email: String,
    pub username: Option<String>,
    /// Argon2id PHC string. Never serialized to clients.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: UserRole,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_case_folded() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn user_role_scopes() {
        assert!(
            UserRole::User
                .implied_scopes()
                .contains(&scopes::SESSIONS_WRITE.to_owned())
        );
        assert_eq!(UserRole::Owner.implied_scopes(), vec!["*".to_owned()]);
    }

    #[test]
    fn password_hash_never_serialized() {
        let user = User {
            id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            email: "a@b.c".to_owned(),
            username: None,
            password_hash: "$argon2id$v=19$secret".to_owned(),
            role: UserRole::User,
            is_active: true,
            email_verified: false,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2id"));
    }
}
