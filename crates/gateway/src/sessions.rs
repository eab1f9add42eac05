//! Listening-session lifecycle: start, heartbeat, end, expiry sweep.
//!
//! The active-session registry lives in the cache so the sweeper never
//! scans the repository. Summary finalization is exactly-once, guarded by
//! the repository's conditional transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use tunetrail_core::{
    ApiError, Clock, DeviceId, DeviceType, EndedBy, ErrorKind, IdGen, InteractionType, Principal,
    Session, SessionId, SessionSummary, TrackId, UserId,
};
use tunetrail_repo::Repository;
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;

/// Cache entry for an active session, keyed by `{user_id}:{device_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveSessionEntry {
    session_id: SessionId,
    user_id: UserId,
    last_heartbeat_at: DateTime<Utc>,
}

/// Manages listening-session state transitions.
pub struct SessionManager {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    metrics: Arc<GatewayMetrics>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        metrics: Arc<GatewayMetrics>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ids,
            metrics,
            idle_timeout,
        }
    }

    /// The configured idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn registry_key(user_id: &UserId, device_id: &DeviceId) -> CacheKey {
        CacheKey::new(KeyKind::ActiveSession, format!("{user_id}:{device_id}"))
    }

    /// Registry entries outlive the idle timeout so the sweeper can still
    /// find and finalize sessions that went quiet.
    fn registry_ttl(&self) -> Option<StdDuration> {
        let secs = self.idle_timeout.num_seconds().max(60);
        Some(StdDuration::from_secs(
            u64::try_from(secs).unwrap_or(900) * 4,
        ))
    }

    /// Start a session. An existing active session on the same
    /// `(user, device)` pair is expired first and its summary emitted.
    #[instrument(name = "sessions.start", skip_all, fields(user = %principal.user_id))]
    pub async fn start(
        &self,
        principal: &Principal,
        device_id: DeviceId,
        device_type: DeviceType,
        client_context: HashMap<String, String>,
    ) -> Result<Session, GatewayError> {
        let now = self.clock.now();
        let registry_key = Self::registry_key(&principal.user_id, &device_id);

        // At most one active session per (user, device): supersede the
        // previous one before starting.
        if let Some(raw) = self.cache.get(&registry_key).await?
            && let Ok(entry) = serde_json::from_str::<ActiveSessionEntry>(&raw)
        {
            self.expire_session(&entry.session_id, EndedBy::Superseded)
                .await?;
        }

        let session = Session {
            id: SessionId::new(self.ids.mint()),
            user_id: principal.user_id.clone(),
            device_id,
            device_type,
            started_at: now,
            last_heartbeat_at: now,
            ended_at: None,
            ended_by: None,
            position_ms: None,
            current_track_id: None,
            client_context,
            summary: None,
        };
        self.repo.insert_session(&session).await?;

        let entry = ActiveSessionEntry {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            last_heartbeat_at: now,
        };
        self.cache
            .set(
                &registry_key,
                &serde_json::to_string(&entry)
                    .map_err(|e| GatewayError::Configuration(e.to_string()))?,
                self.registry_ttl(),
            )
            .await?;

        GatewayMetrics::bump(&self.metrics.sessions_started);
        Ok(session)
    }

    /// Refresh a session's liveness and persist the last-known position.
    #[instrument(name = "sessions.heartbeat", skip_all, fields(session = %session_id))]
    pub async fn heartbeat(
        &self,
        principal: &Principal,
        session_id: &SessionId,
        position_ms: Option<u64>,
        current_track_id: Option<TrackId>,
    ) -> Result<(), GatewayError> {
        let session = self.owned_session(principal, session_id).await?;
        if session.ended_at.is_some() {
            return Err(GatewayError::api(
                ErrorKind::StaleEvent,
                "session has already ended",
            ));
        }

        let now = self.clock.now();
        let updated = self
            .repo
            .record_heartbeat(session_id, now, position_ms, current_track_id)
            .await?;
        if !updated {
            // Lost a race with End or the sweeper.
            return Err(GatewayError::api(
                ErrorKind::StaleEvent,
                "session has already ended",
            ));
        }

        let registry_key = Self::registry_key(&session.user_id, &session.device_id);
        let entry = ActiveSessionEntry {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            last_heartbeat_at: now,
        };
        self.cache
            .set(
                &registry_key,
                &serde_json::to_string(&entry)
                    .map_err(|e| GatewayError::Configuration(e.to_string()))?,
                self.registry_ttl(),
            )
            .await?;

        Ok(())
    }

    /// End a session explicitly. Idempotent: ending an already-ended
    /// session returns it unchanged.
    ///
    /// A session that idled past the timeout before this call is recorded
    /// as ended by timeout, not by the user.
    #[instrument(name = "sessions.end", skip_all, fields(session = %session_id))]
    pub async fn end(
        &self,
        principal: &Principal,
        session_id: &SessionId,
    ) -> Result<Session, GatewayError> {
        let session = self.owned_session(principal, session_id).await?;
        if session.ended_at.is_some() {
            return Ok(session);
        }

        let now = self.clock.now();
        let ended_by = if session.is_idle_expired(now, self.idle_timeout) {
            EndedBy::Timeout
        } else {
            EndedBy::User
        };

        let summary = self.summarize(&session, now).await?;
        let transitioned = self
            .repo
            .finalize_session(session_id, now, ended_by, summary)
            .await?;
        if transitioned {
            GatewayMetrics::bump(&self.metrics.sessions_ended);
        }

        let registry_key = Self::registry_key(&session.user_id, &session.device_id);
        self.cache.delete(&registry_key).await?;

        self.repo
            .session_by_id(session_id)
            .await?
            .ok_or_else(|| GatewayError::api(ErrorKind::NotFound, "session not found"))
    }

    /// One sweep pass over the active-session registry. Returns how many
    /// sessions were expired.
    #[instrument(name = "sessions.sweep", skip_all)]
    pub async fn sweep(&self) -> Result<u64, GatewayError> {
        let now = self.clock.now();
        let entries = self.cache.keys_by_prefix(KeyKind::ActiveSession, "").await?;

        let mut expired = 0u64;
        for (registry_id, raw) in entries {
            let Ok(entry) = serde_json::from_str::<ActiveSessionEntry>(&raw) else {
                warn!(registry_id = %registry_id, "dropping unreadable session registry entry");
                let _ = self
                    .cache
                    .delete(&CacheKey::new(KeyKind::ActiveSession, registry_id))
                    .await;
                continue;
            };

            if now - entry.last_heartbeat_at <= self.idle_timeout {
                continue;
            }

            if self
                .expire_session(&entry.session_id, EndedBy::Timeout)
                .await?
            {
                expired += 1;
            }
            let _ = self
                .cache
                .delete(&CacheKey::new(KeyKind::ActiveSession, registry_id))
                .await;
        }

        if expired > 0 {
            debug!(expired, "session sweep finalized idle sessions");
        }
        Ok(expired)
    }

    /// Expire one session and emit its summary. Returns whether this call
    /// performed the transition.
    async fn expire_session(
        &self,
        session_id: &SessionId,
        ended_by: EndedBy,
    ) -> Result<bool, GatewayError> {
        let Some(session) = self.repo.session_by_id(session_id).await? else {
            return Ok(false);
        };
        if session.ended_at.is_some() {
            return Ok(false);
        }

        let now = self.clock.now();
        let summary = self.summarize(&session, now).await?;
        let transitioned = self
            .repo
            .finalize_session(session_id, now, ended_by, summary)
            .await?;
        if transitioned {
            GatewayMetrics::bump(&self.metrics.sessions_expired);
        }
        Ok(transitioned)
    }

    /// Compute the summary aggregates from the session's interactions.
    async fn summarize(
        &self,
        session: &Session,
        ended_at: DateTime<Utc>,
    ) -> Result<SessionSummary, GatewayError> {
        let interactions = self.repo.interactions_for_session(&session.id).await?;

        let mut plays = 0u64;
        let mut skips = 0u64;
        let mut completes = 0u64;
        for interaction in &interactions {
            match interaction.kind {
                InteractionType::Play => plays += 1,
                InteractionType::Complete => {
                    plays += 1;
                    completes += 1;
                }
                InteractionType::Skip => skips += 1,
                _ => {}
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let completion_rate = if plays == 0 {
            0.0
        } else {
            completes as f64 / plays as f64
        };

        let total_duration_ms =
            u64::try_from((ended_at - session.started_at).num_milliseconds().max(0))
                .unwrap_or(0);

        Ok(SessionSummary {
            total_duration_ms,
            tracks_played: plays,
            tracks_skipped: skips,
            completion_rate,
        })
    }

    /// Fetch a session and check ownership. Foreign sessions read as
    /// missing.
    async fn owned_session(
        &self,
        principal: &Principal,
        session_id: &SessionId,
    ) -> Result<Session, GatewayError> {
        match self.repo.session_by_id(session_id).await? {
            Some(session) if session.user_id == principal.user_id => Ok(session),
            _ => Err(GatewayError::Api(ApiError::not_found("session not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use tunetrail_core::{AuthMethod, ManualClock, OrgId, Plan, SequenceIdGen};
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    struct Fixture {
        manager: SessionManager,
        repo: Arc<MemoryRepository>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let repo = Arc::new(MemoryRepository::new());
        let manager = SessionManager::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::new(MemoryCacheStore::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(SequenceIdGen::new("ses")),
            Arc::new(GatewayMetrics::default()),
            Duration::minutes(15),
        );
        Fixture {
            manager,
            repo,
            clock,
        }
    }

    fn principal() -> Principal {
        Principal {
            user_id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            plan: Plan::Free,
            scopes: vec!["*".to_owned()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
        }
    }

    #[tokio::test]
    async fn start_supersedes_prior_session_on_same_device() {
        let f = fixture();
        let p = principal();

        let first = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();
        let second = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let stored = f.repo.session_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.ended_by, Some(EndedBy::Superseded));
        assert!(stored.summary.is_some());

        // A different device keeps its own session.
        let other = f
            .manager
            .start(&p, DeviceId::new("dev-2"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();
        let second_again = f.repo.session_by_id(&second.id).await.unwrap().unwrap();
        assert!(second_again.ended_at.is_none());
        assert!(other.ended_at.is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_persists_position() {
        let f = fixture();
        let p = principal();
        let session = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(5));
        f.manager
            .heartbeat(&p, &session.id, Some(42_000), Some(TrackId::new("trk-9")))
            .await
            .unwrap();

        let stored = f.repo.session_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.position_ms, Some(42_000));
        assert_eq!(stored.current_track_id, Some(TrackId::new("trk-9")));
        assert_eq!(stored.last_heartbeat_at, f.clock.now());
    }

    #[tokio::test]
    async fn heartbeat_on_foreign_session_reads_as_missing() {
        let f = fixture();
        let p = principal();
        let session = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        let mut other = principal();
        other.user_id = UserId::new("usr-2");
        let err = f
            .manager
            .heartbeat(&other, &session.id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn sweep_expires_only_idle_sessions() {
        let f = fixture();
        let p = principal();

        let idle = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();
        let live = f
            .manager
            .start(&p, DeviceId::new("dev-2"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(10));
        f.manager.heartbeat(&p, &live.id, None, None).await.unwrap();

        // Idle session crosses the timeout; the live one does not.
        f.clock.advance(Duration::minutes(6));
        let expired = f.manager.sweep().await.unwrap();
        assert_eq!(expired, 1);

        let idle_stored = f.repo.session_by_id(&idle.id).await.unwrap().unwrap();
        assert_eq!(idle_stored.ended_by, Some(EndedBy::Timeout));
        let live_stored = f.repo.session_by_id(&live.id).await.unwrap().unwrap();
        assert!(live_stored.ended_at.is_none());

        // A second sweep finalizes nothing again.
        assert_eq!(f.manager.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn heartbeat_exactly_at_timeout_keeps_session_alive() {
        let f = fixture();
        let p = principal();
        let session = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(15));
        assert_eq!(f.manager.sweep().await.unwrap(), 0);
        f.manager.heartbeat(&p, &session.id, None, None).await.unwrap();

        f.clock.advance(Duration::minutes(15));
        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.manager.sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_end_after_idle_records_timeout() {
        let f = fixture();
        let p = principal();
        let session = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        // 16 minutes of silence, then an explicit End.
        f.clock.advance(Duration::minutes(16));
        let ended = f.manager.end(&p, &session.id).await.unwrap();
        assert_eq!(ended.ended_by, Some(EndedBy::Timeout));

        // Idempotent: a second End returns the same terminal state.
        let again = f.manager.end(&p, &session.id).await.unwrap();
        assert_eq!(again.ended_at, ended.ended_at);
        assert_eq!(again.ended_by, Some(EndedBy::Timeout));
    }

    #[tokio::test]
    async fn end_summarizes_interactions() {
        let f = fixture();
        let p = principal();
        let session = f
            .manager
            .start(&p, DeviceId::new("dev-1"), DeviceType::Web, HashMap::new())
            .await
            .unwrap();

        for (n, kind) in [
            InteractionType::Play,
            InteractionType::Complete,
            InteractionType::Skip,
            InteractionType::Like,
        ]
        .into_iter()
        .enumerate()
        {
            f.repo
                .insert_interaction(&tunetrail_core::Interaction {
                    id: format!("int-{n}"),
                    user_id: p.user_id.clone(),
                    track_id: TrackId::new(format!("trk-{n}")),
                    session_id: Some(session.id.clone()),
                    kind,
                    created_at: f.clock.now(),
                    play_duration_ms: None,
                    position_ms: None,
                    source: tunetrail_core::InteractionSource::Library,
                    source_id: None,
                    recommendation_id: None,
                    device_type: DeviceType::Web,
                    skip_reason: None,
                    mood: None,
                    activity: None,
                    completion_override: None,
                    extensions: HashMap::new(),
                })
                .await
                .unwrap();
        }

        f.clock.advance(Duration::minutes(3));
        let ended = f.manager.end(&p, &session.id).await.unwrap();
        let summary = ended.summary.unwrap();
        assert_eq!(summary.tracks_played, 2);
        assert_eq!(summary.tracks_skipped, 1);
        assert!((summary.completion_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.total_duration_ms, 3 * 60 * 1000);
        assert_eq!(ended.ended_by, Some(EndedBy::User));
    }
}
