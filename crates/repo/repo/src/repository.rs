use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tunetrail_core::{
    ApiKey, ApiKeyId, ApiKeyUsageRecord, ContentView, EndedBy, Impression, Interaction, OrgId,
    Organization, PlayerEvent, Plan, RecommendationId, SearchQuery, Session, SessionId,
    SessionSummary, Track, TrackId, User, UserId,
};

use crate::error::RepoError;

/// Flags to raise on an impression. Flags already set stay set; a flag is
/// never lowered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImpressionFlags {
    pub clicked: bool,
    pub played: bool,
    pub liked: bool,
}

impl ImpressionFlags {
    /// Whether any flag is requested.
    #[must_use]
    pub fn any(self) -> bool {
        self.clicked || self.played || self.liked
    }
}

/// Persistence boundary over the entity store.
///
/// Implementations must be `Send + Sync` and honor cascade deletes: removing
/// an organization removes its users and everything they own.
#[async_trait]
pub trait Repository: Send + Sync {
    // -- Organizations ----------------------------------------------------

    /// Insert a new organization. Fails with [`RepoError::Conflict`] when
    /// the slug is taken.
    async fn create_organization(&self, org: &Organization) -> Result<(), RepoError>;

    async fn organization_by_id(&self, id: &OrgId) -> Result<Option<Organization>, RepoError>;

    async fn organization_by_slug(&self, slug: &str) -> Result<Option<Organization>, RepoError>;

    /// Change an organization's plan. Returns `false` when the org is
    /// unknown.
    async fn update_organization_plan(&self, id: &OrgId, plan: Plan) -> Result<bool, RepoError>;

    /// Delete an organization and cascade to all descendants.
    async fn delete_organization(&self, id: &OrgId) -> Result<bool, RepoError>;

    // -- Users ------------------------------------------------------------

    /// Insert a new user. Fails with [`RepoError::Conflict`] when the email
    /// or username is taken. The email must already be case-folded.
    async fn create_user(&self, user: &User) -> Result<(), RepoError>;

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>, RepoError>;

    /// Look up a user by case-folded email.
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;

    // -- API keys ---------------------------------------------------------

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), RepoError>;

    async fn api_key_by_id(&self, id: &ApiKeyId) -> Result<Option<ApiKey>, RepoError>;

    /// All keys sharing a presented-secret prefix. Prefix collisions are
    /// possible; the verifier disambiguates by hash.
    async fn api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, RepoError>;

    async fn api_keys_for_user(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError>;

    /// Schedule or apply revocation. Returns `false` when the key is
    /// unknown.
    async fn set_api_key_revoked_at(
        &self,
        id: &ApiKeyId,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Record when a key last authenticated. Fire-and-forget callers
    /// tolerate failures.
    async fn touch_api_key_last_used(
        &self,
        id: &ApiKeyId,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    /// Append one row to the API usage log.
    async fn append_key_usage(&self, record: &ApiKeyUsageRecord) -> Result<(), RepoError>;

    /// All usage rows for a key since `since`, oldest first.
    async fn key_usage_since(
        &self,
        id: &ApiKeyId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiKeyUsageRecord>, RepoError>;

    // -- Sessions ---------------------------------------------------------

    async fn insert_session(&self, session: &Session) -> Result<(), RepoError>;

    async fn session_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepoError>;

    /// Refresh a session's heartbeat and opportunistically persist the
    /// last-known position. Returns `false` when the session is unknown or
    /// already ended.
    async fn record_heartbeat(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
        position_ms: Option<u64>,
        current_track_id: Option<TrackId>,
    ) -> Result<bool, RepoError>;

    /// Finalize a session: set `ended_at`, `ended_by`, and the summary.
    ///
    /// Conditional on the session not being ended yet; returns `true` only
    /// for the call that performed the transition. This is the exactly-once
    /// guard for summary finalization.
    async fn finalize_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
        ended_by: EndedBy,
        summary: SessionSummary,
    ) -> Result<bool, RepoError>;

    // -- Interactions -----------------------------------------------------

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<(), RepoError>;

    /// All interactions attached to a session, oldest first.
    async fn interactions_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, RepoError>;

    // -- Impressions ------------------------------------------------------

    async fn insert_impressions(&self, impressions: &[Impression]) -> Result<(), RepoError>;

    async fn impression_by_recommendation(
        &self,
        recommendation_id: &RecommendationId,
    ) -> Result<Option<Impression>, RepoError>;

    /// Raise flags on an impression, set-true-once. Returns `true` when at
    /// least one flag actually flipped.
    async fn mark_impression_flags(
        &self,
        recommendation_id: &RecommendationId,
        flags: ImpressionFlags,
    ) -> Result<bool, RepoError>;

    // -- Tracks -----------------------------------------------------------

    async fn upsert_track(&self, track: &Track) -> Result<(), RepoError>;

    async fn track_by_id(&self, id: &TrackId) -> Result<Option<Track>, RepoError>;

    // -- Telemetry --------------------------------------------------------

    async fn append_search_query(&self, record: &SearchQuery) -> Result<(), RepoError>;

    async fn append_content_view(&self, record: &ContentView) -> Result<(), RepoError>;

    async fn append_player_event(&self, record: &PlayerEvent) -> Result<(), RepoError>;
}
