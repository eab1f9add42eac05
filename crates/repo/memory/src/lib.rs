//! In-memory [`Repository`] backed by [`DashMap`] tables.
//!
//! Used by the test suites and by dev-mode deployments without a database.
//! Conditional updates go through the `DashMap` entry API so the
//! exactly-once guards hold under concurrent access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use tunetrail_core::{
    ApiKey, ApiKeyId, ApiKeyUsageRecord, ContentView, EndedBy, Impression, Interaction, OrgId,
    Organization, Plan, PlayerEvent, RecommendationId, SearchQuery, Session, SessionId,
    SessionSummary, Track, TrackId, User, UserId,
};
use tunetrail_repo::{ImpressionFlags, RepoError, Repository};

/// In-memory repository. Cheap to construct per test.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    orgs: DashMap<String, Organization>,
    users: DashMap<String, User>,
    api_keys: DashMap<String, ApiKey>,
    sessions: DashMap<String, Session>,
    interactions: RwLock<Vec<Interaction>>,
    /// Impressions keyed by per-slot recommendation id.
    impressions: DashMap<String, Impression>,
    tracks: DashMap<String, Track>,
    key_usage: RwLock<Vec<ApiKeyUsageRecord>>,
    search_queries: RwLock<Vec<SearchQuery>>,
    content_views: RwLock<Vec<ContentView>>,
    player_events: RwLock<Vec<PlayerEvent>>,
}

impl MemoryRepository {
    /// Create a new, empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored impressions (test helper).
    #[must_use]
    pub fn impression_count(&self) -> usize {
        self.impressions.len()
    }

    /// Number of stored interactions (test helper).
    #[must_use]
    pub fn interaction_count(&self) -> usize {
        self.interactions.read().len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_organization(&self, org: &Organization) -> Result<(), RepoError> {
        if self.orgs.iter().any(|o| o.slug == org.slug) {
            return Err(RepoError::Conflict(format!(
                "organization slug '{}' is taken",
                org.slug
            )));
        }
        self.orgs.insert(org.id.as_str().to_owned(), org.clone());
        Ok(())
    }

    async fn organization_by_id(&self, id: &OrgId) -> Result<Option<Organization>, RepoError> {
        Ok(self.orgs.get(id.as_str()).map(|o| o.value().clone()))
    }

    async fn organization_by_slug(&self, slug: &str) -> Result<Option<Organization>, RepoError> {
        Ok(self
            .orgs
            .iter()
            .find(|o| o.slug == slug)
            .map(|o| o.value().clone()))
    }

    async fn update_organization_plan(&self, id: &OrgId, plan: Plan) -> Result<bool, RepoError> {
        match self.orgs.get_mut(id.as_str()) {
            Some(mut org) => {
                org.plan = plan;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_organization(&self, id: &OrgId) -> Result<bool, RepoError> {
        let Some((_, _org)) = self.orgs.remove(id.as_str()) else {
            return Ok(false);
        };

        let user_ids: Vec<String> = self
            .users
            .iter()
            .filter(|u| u.org_id == *id)
            .map(|u| u.id.as_str().to_owned())
            .collect();

        for user_id in &user_ids {
            self.users.remove(user_id);
        }
        self.api_keys.retain(|_, k| k.org_id != *id);
        self.sessions
            .retain(|_, s| !user_ids.contains(&s.user_id.as_str().to_owned()));
        self.interactions
            .write()
            .retain(|i| !user_ids.iter().any(|u| u == i.user_id.as_str()));
        self.impressions
            .retain(|_, imp| !user_ids.iter().any(|u| u == imp.user_id.as_str()));

        Ok(true)
    }

    async fn create_user(&self, user: &User) -> Result<(), RepoError> {
        let email_taken = self.users.iter().any(|u| u.email == user.email);
        if email_taken {
            return Err(RepoError::Conflict(format!(
                "email '{}' is taken",
                user.email
            )));
        }
        if let Some(ref username) = user.username
            && self
                .users
                .iter()
                .any(|u| u.username.as_deref() == Some(username))
        {
            return Err(RepoError::Conflict(format!(
                "username '{username}' is taken"
            )));
        }
        self.users.insert(user.id.as_str().to_owned(), user.clone());
        Ok(())
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>, RepoError> {
        Ok(self.users.get(id.as_str()).map(|u| u.value().clone()))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email == email)
            .map(|u| u.value().clone()))
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), RepoError> {
        self.api_keys
            .insert(key.id.as_str().to_owned(), key.clone());
        Ok(())
    }

    async fn api_key_by_id(&self, id: &ApiKeyId) -> Result<Option<ApiKey>, RepoError> {
        Ok(self.api_keys.get(id.as_str()).map(|k| k.value().clone()))
    }

    async fn api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, RepoError> {
        Ok(self
            .api_keys
            .iter()
            .filter(|k| k.prefix == prefix)
            .map(|k| k.value().clone())
            .collect())
    }

    async fn api_keys_for_user(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError> {
        let mut keys: Vec<ApiKey> = self
            .api_keys
            .iter()
            .filter(|k| k.owner_user_id == *user_id)
            .map(|k| k.value().clone())
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    async fn set_api_key_revoked_at(
        &self,
        id: &ApiKeyId,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        match self.api_keys.get_mut(id.as_str()) {
            Some(mut key) => {
                key.revoked_at = Some(revoked_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_api_key_last_used(
        &self,
        id: &ApiKeyId,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        if let Some(mut key) = self.api_keys.get_mut(id.as_str()) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn append_key_usage(&self, record: &ApiKeyUsageRecord) -> Result<(), RepoError> {
        self.key_usage.write().push(record.clone());
        Ok(())
    }

    async fn key_usage_since(
        &self,
        id: &ApiKeyId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiKeyUsageRecord>, RepoError> {
        Ok(self
            .key_usage
            .read()
            .iter()
            .filter(|r| r.key_id == *id && r.occurred_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), RepoError> {
        self.sessions
            .insert(session.id.as_str().to_owned(), session.clone());
        Ok(())
    }

    async fn session_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepoError> {
        Ok(self.sessions.get(id.as_str()).map(|s| s.value().clone()))
    }

    async fn record_heartbeat(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
        position_ms: Option<u64>,
        current_track_id: Option<TrackId>,
    ) -> Result<bool, RepoError> {
        match self.sessions.get_mut(id.as_str()) {
            Some(mut session) if session.ended_at.is_none() => {
                session.last_heartbeat_at = at;
                if position_ms.is_some() {
                    session.position_ms = position_ms;
                }
                if current_track_id.is_some() {
                    session.current_track_id = current_track_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
        ended_by: EndedBy,
        summary: SessionSummary,
    ) -> Result<bool, RepoError> {
        match self.sessions.get_mut(id.as_str()) {
            Some(mut session) if session.ended_at.is_none() => {
                session.ended_at = Some(ended_at);
                session.ended_by = Some(ended_by);
                session.summary = Some(summary);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<(), RepoError> {
        self.interactions.write().push(interaction.clone());
        Ok(())
    }

    async fn interactions_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, RepoError> {
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| i.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect())
    }

    async fn insert_impressions(&self, impressions: &[Impression]) -> Result<(), RepoError> {
        for imp in impressions {
            self.impressions
                .insert(imp.recommendation_id.as_str().to_owned(), imp.clone());
        }
        Ok(())
    }

    async fn impression_by_recommendation(
        &self,
        recommendation_id: &RecommendationId,
    ) -> Result<Option<Impression>, RepoError> {
        Ok(self
            .impressions
            .get(recommendation_id.as_str())
            .map(|i| i.value().clone()))
    }

    async fn mark_impression_flags(
        &self,
        recommendation_id: &RecommendationId,
        flags: ImpressionFlags,
    ) -> Result<bool, RepoError> {
        match self.impressions.get_mut(recommendation_id.as_str()) {
            Some(mut imp) => {
                let mut changed = false;
                if flags.clicked && !imp.clicked {
                    imp.clicked = true;
                    changed = true;
                }
                if flags.played && !imp.played {
                    imp.played = true;
                    changed = true;
                }
                if flags.liked && !imp.liked {
                    imp.liked = true;
                    changed = true;
                }
                Ok(changed)
            }
            None => Ok(false),
        }
    }

    async fn upsert_track(&self, track: &Track) -> Result<(), RepoError> {
        self.tracks
            .insert(track.id.as_str().to_owned(), track.clone());
        Ok(())
    }

    async fn track_by_id(&self, id: &TrackId) -> Result<Option<Track>, RepoError> {
        Ok(self.tracks.get(id.as_str()).map(|t| t.value().clone()))
    }

    async fn append_search_query(&self, record: &SearchQuery) -> Result<(), RepoError> {
        self.search_queries.write().push(record.clone());
        Ok(())
    }

    async fn append_content_view(&self, record: &ContentView) -> Result<(), RepoError> {
        self.content_views.write().push(record.clone());
        Ok(())
    }

    async fn append_player_event(&self, record: &PlayerEvent) -> Result<(), RepoError> {
        self.player_events.write().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tunetrail_core::{DeviceId, DeviceType, UserRole};

    use super::*;

    fn org(id: &str, slug: &str) -> Organization {
        Organization {
            id: OrgId::new(id),
            slug: slug.to_owned(),
            plan: Plan::Free,
            max_users: None,
            max_tracks: None,
            feature_overrides: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    fn user(id: &str, org_id: &str, email: &str) -> User {
        User {
            id: UserId::new(id),
            org_id: OrgId::new(org_id),
            email: email.to_owned(),
            username: None,
            password_hash: String::new(),
            role: UserRole::User,
            is_active: true,
            email_verified: false,
            created_at: Utc::now(),
        }
    }

    fn session(id: &str, user_id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new(id),
            user_id: UserId::new(user_id),
            device_id: DeviceId::new("dev-1"),
            device_type: DeviceType::Web,
            started_at: now,
            last_heartbeat_at: now,
            ended_at: None,
            ended_by: None,
            position_ms: None,
            current_track_id: None,
            client_context: HashMap::new(),
            summary: None,
        }
    }

    fn impression(rec_id: &str, user_id: &str) -> Impression {
        Impression {
            id: format!("imp-{rec_id}"),
            user_id: UserId::new(user_id),
            track_id: TrackId::new("trk-1"),
            recommendation_id: RecommendationId::new(rec_id),
            model_type: "collaborative".to_owned(),
            model_version: "1".to_owned(),
            score: 0.5,
            position: 1,
            context: "user_personal".to_owned(),
            shown_at: Utc::now(),
            clicked: false,
            played: false,
            liked: false,
        }
    }

    #[tokio::test]
    async fn duplicate_slug_conflicts() {
        let repo = MemoryRepository::new();
        repo.create_organization(&org("org-1", "acme")).await.unwrap();
        let err = repo
            .create_organization(&org("org-2", "acme"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let repo = MemoryRepository::new();
        repo.create_user(&user("usr-1", "org-1", "a@b.c")).await.unwrap();
        let err = repo
            .create_user(&user("usr-2", "org-1", "a@b.c"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }

    #[tokio::test]
    async fn finalize_session_is_exactly_once() {
        let repo = MemoryRepository::new();
        repo.insert_session(&session("ses-1", "usr-1")).await.unwrap();

        let first = repo
            .finalize_session(
                &SessionId::new("ses-1"),
                Utc::now(),
                EndedBy::User,
                SessionSummary::default(),
            )
            .await
            .unwrap();
        assert!(first, "first finalize performs the transition");

        let second = repo
            .finalize_session(
                &SessionId::new("ses-1"),
                Utc::now(),
                EndedBy::Timeout,
                SessionSummary::default(),
            )
            .await
            .unwrap();
        assert!(!second, "second finalize must be a no-op");

        let stored = repo
            .session_by_id(&SessionId::new("ses-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ended_by, Some(EndedBy::User));
    }

    #[tokio::test]
    async fn heartbeat_on_ended_session_fails() {
        let repo = MemoryRepository::new();
        repo.insert_session(&session("ses-1", "usr-1")).await.unwrap();
        repo.finalize_session(
            &SessionId::new("ses-1"),
            Utc::now(),
            EndedBy::User,
            SessionSummary::default(),
        )
        .await
        .unwrap();

        let updated = repo
            .record_heartbeat(&SessionId::new("ses-1"), Utc::now(), None, None)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn impression_flags_set_true_once() {
        let repo = MemoryRepository::new();
        repo.insert_impressions(&[impression("rec-1", "usr-1")])
            .await
            .unwrap();

        let flags = ImpressionFlags {
            played: true,
            ..ImpressionFlags::default()
        };
        let rec = RecommendationId::new("rec-1");

        assert!(repo.mark_impression_flags(&rec, flags).await.unwrap());
        assert!(
            !repo.mark_impression_flags(&rec, flags).await.unwrap(),
            "second identical mark must report no change"
        );

        let stored = repo.impression_by_recommendation(&rec).await.unwrap().unwrap();
        assert!(stored.played);
        assert!(!stored.clicked);
    }

    #[tokio::test]
    async fn org_delete_cascades() {
        let repo = MemoryRepository::new();
        repo.create_organization(&org("org-1", "acme")).await.unwrap();
        repo.create_user(&user("usr-1", "org-1", "a@b.c")).await.unwrap();
        repo.insert_session(&session("ses-1", "usr-1")).await.unwrap();
        repo.insert_impressions(&[impression("rec-1", "usr-1")])
            .await
            .unwrap();

        assert!(repo.delete_organization(&OrgId::new("org-1")).await.unwrap());

        assert!(repo.user_by_id(&UserId::new("usr-1")).await.unwrap().is_none());
        assert!(
            repo.session_by_id(&SessionId::new("ses-1"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.impression_count(), 0);
    }
}
