use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced to API clients.
///
/// Clients branch on the wire string of the kind, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationFailed,
    MalformedCredential,
    UnknownCredential,
    RevokedCredential,
    ExpiredCredential,
    ScopeInsufficient,
    IpNotAllowed,
    NotFound,
    PlanUpgradeRequired,
    FeatureNotInPlan,
    QuotaExceeded,
    StaleEvent,
    UpstreamUnavailable,
    Internal,
}

impl ErrorKind {
    /// The wire representation of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::MalformedCredential => "MALFORMED_CREDENTIAL",
            Self::UnknownCredential => "UNKNOWN_CREDENTIAL",
            Self::RevokedCredential => "REVOKED_CREDENTIAL",
            Self::ExpiredCredential => "EXPIRED_CREDENTIAL",
            Self::ScopeInsufficient => "SCOPE_INSUFFICIENT",
            Self::IpNotAllowed => "IP_NOT_ALLOWED",
            Self::NotFound => "NOT_FOUND",
            Self::PlanUpgradeRequired => "PLAN_UPGRADE_REQUIRED",
            Self::FeatureNotInPlan => "FEATURE_NOT_IN_PLAN",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::StaleEvent => "STALE_EVENT",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status code this kind maps to.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::ValidationFailed => 400,
            Self::MalformedCredential
            | Self::UnknownCredential
            | Self::RevokedCredential
            | Self::ExpiredCredential => 401,
            Self::PlanUpgradeRequired | Self::FeatureNotInPlan => 402,
            Self::ScopeInsufficient | Self::IpNotAllowed => 403,
            Self::NotFound => 404,
            Self::StaleEvent => 409,
            Self::QuotaExceeded => 429,
            Self::Internal => 500,
            Self::UpstreamUnavailable => 503,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-visible error: stable kind plus a human-readable message and
/// optional structured context.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

impl ApiError {
    /// Create an error with a kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after: None,
            upgrade_url: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a retry-after hint in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Attach an upgrade URL (plan/feature gate denials).
    #[must_use]
    pub fn with_upgrade_url(mut self, url: impl Into<String>) -> Self {
        self.upgrade_url = Some(url.into());
        self
    }

    /// Shorthand for a validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    /// Shorthand for a missing entity.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for an opaque internal error. The message is logged
    /// server-side; callers see only the kind.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}
