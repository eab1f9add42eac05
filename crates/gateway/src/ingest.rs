//! Validated write-path for interaction and telemetry records.
//!
//! Writes are append-only. Validation may downgrade an event (soft error)
//! or reject it (hard error); batches stop at the first hard error and
//! report how many events were accepted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use tunetrail_core::{
    ApiError, Clock, ContentView, ErrorKind, IdGen, Impression, IngestEvent, Interaction,
    InteractionType, PlayerEvent, Principal, RecommendationId, SearchQuery, SessionId, TrackId,
};
use tunetrail_repo::{ImpressionFlags, Repository};
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;

/// How many CAS attempts the sequence high-water mark gets before the
/// write is treated as conflicting.
const SEQ_CAS_ATTEMPTS: usize = 8;

/// Outcome of a batch ingest: events accepted before the first hard error,
/// and the error itself when the batch stopped early.
#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub accepted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// A client-reported impression (list views rendered outside the
/// dispatcher).
#[derive(Debug, Clone, Deserialize)]
pub struct ImpressionReport {
    pub track_id: TrackId,
    pub recommendation_id: RecommendationId,
    pub model_type: String,
    pub model_version: String,
    #[serde(default)]
    pub score: f64,
    pub position: u32,
    pub context: String,
}

/// Validated write-path for play/skip/like/impression/view/player-event
/// records.
pub struct InteractionIngestor {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    metrics: Arc<GatewayMetrics>,
}

impl InteractionIngestor {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            repo,
            cache,
            clock,
            ids,
            metrics,
        }
    }

    /// Validate and persist one interaction event.
    #[instrument(name = "ingest.event", skip_all, fields(kind = event.kind.as_str()))]
    pub async fn ingest(
        &self,
        principal: &Principal,
        event: IngestEvent,
    ) -> Result<Interaction, GatewayError> {
        let result = self.ingest_inner(principal, event).await;
        match &result {
            Ok(_) => GatewayMetrics::bump(&self.metrics.interactions_ingested),
            Err(_) => GatewayMetrics::bump(&self.metrics.interactions_rejected),
        }
        result
    }

    /// Process events in order, stopping at the first hard error.
    /// Soft errors (auto-downgrades) do not stop the batch.
    pub async fn ingest_batch(
        &self,
        principal: &Principal,
        events: Vec<IngestEvent>,
    ) -> Result<BatchOutcome, GatewayError> {
        let mut accepted = 0usize;
        for event in events {
            match self.ingest(principal, event).await {
                Ok(_) => accepted += 1,
                Err(GatewayError::Api(api)) => {
                    return Ok(BatchOutcome {
                        accepted,
                        error: Some(api),
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(BatchOutcome {
            accepted,
            error: None,
        })
    }

    async fn ingest_inner(
        &self,
        principal: &Principal,
        mut event: IngestEvent,
    ) -> Result<Interaction, GatewayError> {
        let track = self
            .repo
            .track_by_id(&event.track_id)
            .await?
            .ok_or_else(|| GatewayError::api(ErrorKind::NotFound, "unknown track"))?;

        // Bound play duration against clock skew.
        if let Some(duration) = event.play_duration_ms
            && duration > 2 * track.duration_ms
        {
            return Err(GatewayError::Api(
                ApiError::validation("play_duration_ms exceeds twice the track duration")
                    .with_details(serde_json::json!({
                        "play_duration_ms": duration,
                        "track_duration_ms": track.duration_ms,
                    })),
            ));
        }

        let mut completion_override = None;
        match event.kind {
            InteractionType::Complete => {
                // A "complete" must cover at least 80% of the track.
                let threshold = track.duration_ms * 8 / 10;
                if event.play_duration_ms.is_none_or(|d| d < threshold) {
                    event.kind = InteractionType::Play;
                    completion_override = Some(false);
                    GatewayMetrics::bump(&self.metrics.interactions_downgraded);
                }
            }
            InteractionType::Skip => {
                // A "skip" after half the track is really a play.
                let threshold = track.duration_ms / 2;
                if event.play_duration_ms.is_some_and(|d| d >= threshold) {
                    event.kind = InteractionType::Play;
                    event.skip_reason = None;
                    GatewayMetrics::bump(&self.metrics.interactions_downgraded);
                }
            }
            _ => {}
        }

        if let Some(ref session_id) = event.session_id {
            self.check_session_owner(principal, session_id).await?;
            if let Some(seq) = event.client_seq {
                self.advance_session_seq(session_id, seq).await?;
            }
        }

        if let Some(ref recommendation_id) = event.recommendation_id {
            self.close_impression_loop(principal, recommendation_id, event.kind)
                .await?;
        }

        let interaction = Interaction {
            id: self.ids.mint(),
            user_id: principal.user_id.clone(),
            track_id: event.track_id,
            session_id: event.session_id,
            kind: event.kind,
            created_at: self.clock.now(),
            play_duration_ms: event.play_duration_ms,
            position_ms: event.position_ms,
            source: event.source,
            source_id: event.source_id,
            recommendation_id: event.recommendation_id,
            device_type: event.device_type,
            skip_reason: event.skip_reason,
            mood: event.mood,
            activity: event.activity,
            completion_override,
            extensions: event.extensions,
        };
        self.repo.insert_interaction(&interaction).await?;

        Ok(interaction)
    }

    /// The session must exist, belong to the caller, and have existed
    /// before the event (never a session that never existed).
    async fn check_session_owner(
        &self,
        principal: &Principal,
        session_id: &SessionId,
    ) -> Result<(), GatewayError> {
        match self.repo.session_by_id(session_id).await? {
            Some(session) if session.user_id == principal.user_id => Ok(()),
            Some(_) => Err(GatewayError::Api(ApiError::validation(
                "session does not belong to the caller",
            ))),
            None => Err(GatewayError::Api(ApiError::validation(
                "session does not exist",
            ))),
        }
    }

    /// Enforce per-session FIFO with a monotonic client sequence number.
    /// The high-water mark advances by CAS; regressions reject with
    /// `STALE_EVENT`.
    async fn advance_session_seq(
        &self,
        session_id: &SessionId,
        seq: u64,
    ) -> Result<(), GatewayError> {
        let key = CacheKey::new(KeyKind::SessionSeq, session_id.as_str());

        for _ in 0..SEQ_CAS_ATTEMPTS {
            let current = self.cache.get(&key).await?;
            let high_water = match current.as_deref() {
                Some(raw) => Some(raw.parse::<u64>().map_err(|e| {
                    tunetrail_state::StateError::Serialization(format!(
                        "session seq is not an integer: {e}"
                    ))
                })?),
                None => None,
            };

            if let Some(high) = high_water
                && seq <= high
            {
                return Err(GatewayError::Api(
                    ApiError::new(
                        ErrorKind::StaleEvent,
                        "event is older than the session's last accepted sequence",
                    )
                    .with_details(serde_json::json!({
                        "client_seq": seq,
                        "high_water": high,
                    })),
                ));
            }

            let applied = self
                .cache
                .compare_and_swap(&key, current.as_deref(), &seq.to_string(), None)
                .await?;
            if applied {
                return Ok(());
            }
            // Lost a CAS race with a concurrent writer; re-read and retry.
        }

        Err(GatewayError::api(
            ErrorKind::StaleEvent,
            "sequence contention, retry the event",
        ))
    }

    /// Tie an interaction back to the impression it answers, flipping the
    /// impression's flags set-true-once.
    async fn close_impression_loop(
        &self,
        principal: &Principal,
        recommendation_id: &RecommendationId,
        kind: InteractionType,
    ) -> Result<(), GatewayError> {
        let impression = self
            .repo
            .impression_by_recommendation(recommendation_id)
            .await?;
        let Some(impression) = impression else {
            return Err(GatewayError::Api(ApiError::validation(
                "recommendation_id does not reference a known impression",
            )));
        };
        if impression.user_id != principal.user_id {
            return Err(GatewayError::Api(ApiError::validation(
                "recommendation_id does not belong to the caller",
            )));
        }

        let flags = ImpressionFlags {
            clicked: true,
            played: matches!(kind, InteractionType::Play | InteractionType::Complete),
            liked: matches!(kind, InteractionType::Like),
        };
        self.repo
            .mark_impression_flags(recommendation_id, flags)
            .await?;
        Ok(())
    }

    /// Client-side impression write-path (`POST /impressions/...`).
    /// Existing recommendation ids are left untouched.
    pub async fn record_impressions(
        &self,
        principal: &Principal,
        reports: Vec<ImpressionReport>,
    ) -> Result<usize, GatewayError> {
        let now = self.clock.now();
        let impressions: Vec<Impression> = reports
            .into_iter()
            .map(|r| Impression {
                id: self.ids.mint(),
                user_id: principal.user_id.clone(),
                track_id: r.track_id,
                recommendation_id: r.recommendation_id,
                model_type: r.model_type,
                model_version: r.model_version,
                score: r.score,
                position: r.position,
                context: r.context,
                shown_at: now,
                clicked: false,
                played: false,
                liked: false,
            })
            .collect();

        let count = impressions.len();
        self.repo.insert_impressions(&impressions).await?;
        GatewayMetrics::add(&self.metrics.impressions_flushed, count as u64);
        Ok(count)
    }

    /// Append a search telemetry record.
    pub async fn record_search(
        &self,
        principal: &Principal,
        query: String,
        results_count: u32,
        extensions: std::collections::HashMap<String, String>,
    ) -> Result<SearchQuery, GatewayError> {
        if query.trim().is_empty() {
            return Err(GatewayError::Api(ApiError::validation(
                "query must not be empty",
            )));
        }
        let record = SearchQuery {
            id: self.ids.mint(),
            user_id: principal.user_id.clone(),
            query,
            results_count,
            created_at: self.clock.now(),
            extensions,
        };
        self.repo.append_search_query(&record).await?;
        Ok(record)
    }

    /// Append a content-view telemetry record.
    pub async fn record_content_view(
        &self,
        principal: &Principal,
        content_type: String,
        content_id: String,
        extensions: std::collections::HashMap<String, String>,
    ) -> Result<ContentView, GatewayError> {
        if content_type.trim().is_empty() || content_id.trim().is_empty() {
            return Err(GatewayError::Api(ApiError::validation(
                "content_type and content_id must not be empty",
            )));
        }
        let record = ContentView {
            id: self.ids.mint(),
            user_id: principal.user_id.clone(),
            content_type,
            content_id,
            created_at: self.clock.now(),
            extensions,
        };
        self.repo.append_content_view(&record).await?;
        Ok(record)
    }

    /// Append a low-level player event record.
    pub async fn record_player_event(
        &self,
        principal: &Principal,
        event: String,
        session_id: Option<SessionId>,
        track_id: Option<TrackId>,
        position_ms: Option<u64>,
        extensions: std::collections::HashMap<String, String>,
    ) -> Result<PlayerEvent, GatewayError> {
        if event.trim().is_empty() {
            return Err(GatewayError::Api(ApiError::validation(
                "event must not be empty",
            )));
        }
        if let Some(ref session_id) = session_id {
            self.check_session_owner(principal, session_id).await?;
        }
        let record = PlayerEvent {
            id: self.ids.mint(),
            user_id: principal.user_id.clone(),
            session_id,
            event,
            track_id,
            position_ms,
            created_at: self.clock.now(),
            extensions,
        };
        self.repo.append_player_event(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use tunetrail_core::{
        AuthMethod, DeviceId, DeviceType, InteractionSource, ManualClock, OrgId, Plan,
        SequenceIdGen, Session, Track, UserId,
    };
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    struct Fixture {
        ingestor: InteractionIngestor,
        repo: Arc<MemoryRepository>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_track(&Track {
            id: TrackId::new("trk-1"),
            title: "Song".to_owned(),
            artist: "Band".to_owned(),
            duration_ms: 200_000,
            created_at: clock.now(),
        })
        .await
        .unwrap();
        repo.insert_session(&Session {
            id: SessionId::new("ses-1"),
            user_id: UserId::new("usr-1"),
            device_id: DeviceId::new("dev-1"),
            device_type: DeviceType::Web,
            started_at: clock.now(),
            last_heartbeat_at: clock.now(),
            ended_at: None,
            ended_by: None,
            position_ms: None,
            current_track_id: None,
            client_context: HashMap::new(),
            summary: None,
        })
        .await
        .unwrap();

        let ingestor = InteractionIngestor::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Arc::new(MemoryCacheStore::new()),
            clock,
            Arc::new(SequenceIdGen::new("int")),
            Arc::new(GatewayMetrics::default()),
        );
        Fixture { ingestor, repo }
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

    fn event(kind: InteractionType, play_duration_ms: Option<u64>) -> IngestEvent {
        IngestEvent {
            track_id: TrackId::new("trk-1"),
            session_id: None,
            kind,
            play_duration_ms,
            position_ms: None,
            source: InteractionSource::Library,
            source_id: None,
            recommendation_id: None,
            device_type: DeviceType::Web,
            skip_reason: None,
            mood: None,
            activity: None,
            client_seq: None,
            extensions: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn short_complete_downgrades_to_play() {
        let f = fixture().await;
        // 200s track, 0.8 threshold = 160s. 100s is short.
        let stored = f
            .ingestor
            .ingest(&principal(), event(InteractionType::Complete, Some(100_000)))
            .await
            .unwrap();
        assert_eq!(stored.kind, InteractionType::Play);
        assert_eq!(stored.completion_override, Some(false));
    }

    #[tokio::test]
    async fn genuine_complete_is_kept() {
        let f = fixture().await;
        let stored = f
            .ingestor
            .ingest(&principal(), event(InteractionType::Complete, Some(170_000)))
            .await
            .unwrap();
        assert_eq!(stored.kind, InteractionType::Complete);
        assert!(stored.completion_override.is_none());
    }

    #[tokio::test]
    async fn long_skip_downgrades_to_play() {
        let f = fixture().await;
        // 200s track, skip threshold = 100s. A 150s "skip" is a play.
        let mut e = event(InteractionType::Skip, Some(150_000));
        e.skip_reason = Some("next".to_owned());
        let stored = f.ingestor.ingest(&principal(), e).await.unwrap();
        assert_eq!(stored.kind, InteractionType::Play);
        assert!(stored.skip_reason.is_none());
    }

    #[tokio::test]
    async fn play_duration_bound_rejects_clock_skew() {
        let f = fixture().await;
        let err = f
            .ingestor
            .ingest(&principal(), event(InteractionType::Play, Some(500_000)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));
    }

    #[tokio::test]
    async fn sequence_regression_is_stale() {
        let f = fixture().await;
        let p = principal();

        let mut first = event(InteractionType::Play, Some(1_000));
        first.session_id = Some(SessionId::new("ses-1"));
        first.client_seq = Some(5);
        f.ingestor.ingest(&p, first).await.unwrap();

        let mut replay = event(InteractionType::Play, Some(2_000));
        replay.session_id = Some(SessionId::new("ses-1"));
        replay.client_seq = Some(5);
        let err = f.ingestor.ingest(&p, replay).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::StaleEvent));

        let mut next = event(InteractionType::Play, Some(3_000));
        next.session_id = Some(SessionId::new("ses-1"));
        next.client_seq = Some(6);
        f.ingestor.ingest(&p, next).await.unwrap();
    }

    #[tokio::test]
    async fn foreign_session_is_rejected() {
        let f = fixture().await;
        let mut p = principal();
        p.user_id = UserId::new("usr-2");

        let mut e = event(InteractionType::Play, Some(1_000));
        e.session_id = Some(SessionId::new("ses-1"));
        let err = f.ingestor.ingest(&p, e).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));
    }

    #[tokio::test]
    async fn impression_loop_closes_idempotently() {
        let f = fixture().await;
        let p = principal();
        f.repo
            .insert_impressions(&[Impression {
                id: "imp-1".to_owned(),
                user_id: p.user_id.clone(),
                track_id: TrackId::new("trk-1"),
                recommendation_id: RecommendationId::new("rec-1"),
                model_type: "collaborative".to_owned(),
                model_version: "1".to_owned(),
                score: 0.9,
                position: 1,
                context: "user_personal".to_owned(),
                shown_at: Utc::now(),
                clicked: false,
                played: false,
                liked: false,
            }])
            .await
            .unwrap();

        let mut e = event(InteractionType::Play, Some(1_000));
        e.recommendation_id = Some(RecommendationId::new("rec-1"));
        f.ingestor.ingest(&p, e).await.unwrap();

        let imp = f
            .repo
            .impression_by_recommendation(&RecommendationId::new("rec-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(imp.clicked);
        assert!(imp.played);
        assert!(!imp.liked);
    }

    #[tokio::test]
    async fn batch_stops_on_first_hard_error() {
        let f = fixture().await;
        let p = principal();

        let events = vec![
            event(InteractionType::Play, Some(1_000)),
            // Unknown track: hard error.
            IngestEvent {
                track_id: TrackId::new("trk-missing"),
                ..event(InteractionType::Play, Some(1_000))
            },
            event(InteractionType::Play, Some(2_000)),
        ];

        let outcome = f.ingestor.ingest_batch(&p, events).await.unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::NotFound);
        assert_eq!(f.repo.interaction_count(), 1);
    }

    #[tokio::test]
    async fn batch_downgrades_are_soft() {
        let f = fixture().await;
        let p = principal();

        let events = vec![
            event(InteractionType::Complete, Some(10_000)),
            event(InteractionType::Play, Some(1_000)),
        ];
        let outcome = f.ingestor.ingest_batch(&p, events).await.unwrap();
        assert_eq!(outcome.accepted, 2);
        assert!(outcome.error.is_none());
    }
}
