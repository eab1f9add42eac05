//! Recommendation dispatch: cache, single-flight, engine fan-out, stale
//! fallback, and impression capture.
//!
//! The single-flight map coalesces concurrent computations per request
//! fingerprint. Its mutex is held only across map operations, never across
//! the engine call. Impression writes go through the bounded buffer and
//! never delay the response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use tunetrail_core::{
    ApiError, Clock, ErrorKind, FeedbackSignal, IdGen, Impression, Interaction, InteractionSource,
    InteractionType, ModelTier, Principal, RankedTrack, RecommendKind, RecommendRequest,
    RecommendationId, RecommendationSet, TrackId, recommendation_fingerprint,
};
use tunetrail_engine::{EngineError, EngineRequest, EngineResponse, RecommendationEngine};
use tunetrail_repo::{ImpressionFlags, Repository};
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use crate::error::GatewayError;
use crate::impressions::ImpressionBuffer;
use crate::metrics::GatewayMetrics;

/// Tunables for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a cache entry counts as fresh.
    pub cache_ttl: Duration,
    /// Horizon within which an expired entry may still be served when the
    /// engine fails.
    pub stale_while_error: Duration,
    /// Base backoff before the single internal retry.
    pub retry_backoff: Duration,
    /// Largest accepted `limit`.
    pub max_limit: usize,
    /// `limit` applied when the client omits one.
    pub default_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            stale_while_error: Duration::from_secs(3_600),
            retry_backoff: Duration::from_millis(100),
            max_limit: 100,
            default_limit: 20,
        }
    }
}

/// Acknowledgement of a feedback submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedbackAck {
    pub recommendation_id: RecommendationId,
    /// `true` when an identical submission was already recorded.
    pub duplicate: bool,
}

/// Outcome shared with single-flight followers: the set, or the stable
/// error kind the leader hit.
type FlightResult = Result<RecommendationSet, ErrorKind>;

/// Routes recommendation requests to the engine with caching and
/// coalescing.
pub struct RecommendationDispatcher {
    repo: Arc<dyn Repository>,
    cache: Arc<dyn CacheStore>,
    engine: Arc<dyn RecommendationEngine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    metrics: Arc<GatewayMetrics>,
    buffer: Arc<ImpressionBuffer>,
    config: DispatcherConfig,
    single_flight: Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>,
}

impl RecommendationDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<dyn CacheStore>,
        engine: Arc<dyn RecommendationEngine>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        metrics: Arc<GatewayMetrics>,
        buffer: Arc<ImpressionBuffer>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            engine,
            clock,
            ids,
            metrics,
            buffer,
            config,
            single_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The configured defaults (used by the HTTP layer for limits).
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Serve a recommendation request.
    ///
    /// `client_deadline` is the caller-supplied budget; the effective
    /// engine deadline is the smaller of it and the kind's default.
    #[instrument(name = "dispatch.recommend", skip_all, fields(kind = %kind))]
    pub async fn recommend(
        &self,
        principal: &Principal,
        kind: RecommendKind,
        seed: Option<TrackId>,
        limit: Option<usize>,
        tier_hint: Option<ModelTier>,
        client_deadline: Option<Duration>,
    ) -> Result<RecommendationSet, GatewayError> {
        let limit = limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > self.config.max_limit {
            return Err(GatewayError::Api(
                ApiError::validation(format!(
                    "limit must be between 1 and {}",
                    self.config.max_limit
                )),
            ));
        }

        let seed = self.resolve_seed(kind, seed).await?;

        // The effective tier is capped by the plan regardless of the hint.
        let plan_tier = ModelTier::for_plan(principal.plan);
        let tier = tier_hint.map_or(plan_tier, |hint| hint.min(plan_tier));

        let fingerprint =
            recommendation_fingerprint(kind, &principal.user_id, seed.as_ref(), limit, tier);

        // Fresh cache entry: answer immediately with a new serving.
        let cached = self.load_cached(&fingerprint).await;
        if let Some(ref template) = cached
            && template.is_fresh(
                self.clock.now(),
                i64::try_from(self.config.cache_ttl.as_secs()).unwrap_or(300),
            )
        {
            GatewayMetrics::bump(&self.metrics.recommend_cache_hits);
            GatewayMetrics::bump(&self.metrics.recommendations_served);
            return Ok(self.serve(principal, template.clone()));
        }

        // Single-flight: at most one concurrent computation per
        // fingerprint; everyone else attaches to the in-flight result.
        enum Role {
            Leader(watch::Sender<Option<FlightResult>>),
            Follower(watch::Receiver<Option<FlightResult>>),
        }

        let role = {
            let mut map = self.single_flight.lock();
            if let Some(rx) = map.get(&fingerprint) {
                Role::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                map.insert(fingerprint.clone(), rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => {
                loop {
                    let published = rx.borrow().clone();
                    if let Some(result) = published {
                        if result.is_ok() {
                            GatewayMetrics::bump(&self.metrics.recommendations_served);
                        }
                        return result.map_err(|kind| {
                            GatewayError::api(kind, "recommendation request failed")
                        });
                    }
                    if rx.changed().await.is_err() {
                        // Leader vanished without publishing (cancelled
                        // mid-flight). Clear the dead entry, unless a new
                        // leader already replaced it, so the next caller
                        // starts a fresh computation.
                        let mut map = self.single_flight.lock();
                        if map
                            .get(&fingerprint)
                            .is_some_and(|entry| entry.same_channel(&rx))
                        {
                            map.remove(&fingerprint);
                        }
                        return Err(GatewayError::api(
                            ErrorKind::UpstreamUnavailable,
                            "recommendation computation was cancelled",
                        ));
                    }
                }
            }
            Role::Leader(tx) => {
                let request = RecommendRequest {
                    kind,
                    seed,
                    limit,
                    model_tier: tier,
                };
                let outcome = self
                    .compute(principal, &request, &fingerprint, cached, client_deadline)
                    .await;

                let flight: FlightResult = match &outcome {
                    Ok(set) => Ok(set.clone()),
                    Err(e) => Err(e.kind().unwrap_or(ErrorKind::Internal)),
                };
                let _ = tx.send(Some(flight));
                self.single_flight.lock().remove(&fingerprint);

                if outcome.is_ok() {
                    GatewayMetrics::bump(&self.metrics.recommendations_served);
                }
                outcome
            }
        }
    }

    /// Record client feedback on a served recommendation slot.
    ///
    /// Idempotent per `(recommendation_id, signal)`: repeats record nothing
    /// and report `duplicate`.
    #[instrument(name = "dispatch.feedback", skip_all, fields(signal = signal.as_str()))]
    pub async fn feedback(
        &self,
        principal: &Principal,
        recommendation_id: RecommendationId,
        signal: FeedbackSignal,
        reason: Option<String>,
    ) -> Result<FeedbackAck, GatewayError> {
        let impression = self
            .repo
            .impression_by_recommendation(&recommendation_id)
            .await?;
        let Some(impression) = impression else {
            return Err(GatewayError::api(
                ErrorKind::NotFound,
                "unknown recommendation",
            ));
        };
        if impression.user_id != principal.user_id {
            return Err(GatewayError::api(
                ErrorKind::NotFound,
                "unknown recommendation",
            ));
        }

        let dedup_key = CacheKey::new(
            KeyKind::FeedbackDedup,
            format!("{recommendation_id}:{}", signal.as_str()),
        );
        let first_submission = self
            .cache
            .compare_and_swap(&dedup_key, None, "1", Some(Duration::from_secs(86_400)))
            .await?;
        if !first_submission {
            GatewayMetrics::bump(&self.metrics.feedback_duplicates);
            return Ok(FeedbackAck {
                recommendation_id,
                duplicate: true,
            });
        }

        let flags = match signal {
            FeedbackSignal::Accept => ImpressionFlags {
                clicked: true,
                ..ImpressionFlags::default()
            },
            FeedbackSignal::Played => ImpressionFlags {
                played: true,
                ..ImpressionFlags::default()
            },
            FeedbackSignal::Saved => ImpressionFlags {
                liked: true,
                ..ImpressionFlags::default()
            },
            FeedbackSignal::Reject | FeedbackSignal::Dismissed => ImpressionFlags::default(),
        };
        if flags.any() {
            self.repo
                .mark_impression_flags(&recommendation_id, flags)
                .await?;
        }

        let kind = match signal {
            FeedbackSignal::Played => InteractionType::Play,
            FeedbackSignal::Accept | FeedbackSignal::Saved => InteractionType::Save,
            FeedbackSignal::Reject => InteractionType::Dislike,
            FeedbackSignal::Dismissed => InteractionType::Skip,
        };
        let interaction = Interaction {
            id: self.ids.mint(),
            user_id: principal.user_id.clone(),
            track_id: impression.track_id.clone(),
            session_id: None,
            kind,
            created_at: self.clock.now(),
            play_duration_ms: None,
            position_ms: None,
            source: InteractionSource::Recommendation,
            source_id: Some(signal.as_str().to_owned()),
            recommendation_id: Some(recommendation_id.clone()),
            device_type: tunetrail_core::DeviceType::Unknown,
            skip_reason: reason,
            mood: None,
            activity: None,
            completion_override: None,
            extensions: std::collections::HashMap::new(),
        };
        self.repo.insert_interaction(&interaction).await?;
        GatewayMetrics::bump(&self.metrics.feedback_recorded);

        Ok(FeedbackAck {
            recommendation_id,
            duplicate: false,
        })
    }

    /// Validate the seed requirement for seeded kinds.
    async fn resolve_seed(
        &self,
        kind: RecommendKind,
        seed: Option<TrackId>,
    ) -> Result<Option<TrackId>, GatewayError> {
        match kind {
            RecommendKind::SimilarToTrack | RecommendKind::RadioSeed => {
                let Some(seed) = seed else {
                    return Err(GatewayError::Api(ApiError::validation(
                        "a seed track is required for this recommendation kind",
                    )));
                };
                if self.repo.track_by_id(&seed).await?.is_none() {
                    return Err(GatewayError::api(ErrorKind::NotFound, "unknown seed track"));
                }
                Ok(Some(seed))
            }
            _ => Ok(None),
        }
    }

    /// Cold path: call the engine (with one jittered retry), rank, cache,
    /// and fall back to a stale entry when the engine stays down.
    async fn compute(
        &self,
        principal: &Principal,
        request: &RecommendRequest,
        fingerprint: &str,
        cached: Option<RecommendationSet>,
        client_deadline: Option<Duration>,
    ) -> Result<RecommendationSet, GatewayError> {
        let default_deadline = Duration::from_millis(request.kind.default_timeout_ms());
        let deadline = client_deadline.map_or(default_deadline, |d| d.min(default_deadline));

        let engine_request = EngineRequest {
            kind: request.kind,
            user_id: principal.user_id.clone(),
            seed: request.seed.clone(),
            limit: request.limit,
            model_tier: request.model_tier,
        };

        let response = match self.call_engine(&engine_request, deadline).await {
            Ok(response) => response,
            Err(e) => {
                match e {
                    EngineError::Timeout => {
                        GatewayMetrics::bump(&self.metrics.engine_timeouts);
                    }
                    _ => GatewayMetrics::bump(&self.metrics.engine_errors),
                }
                warn!(error = %e, "engine unavailable, consulting stale cache");

                // Stale-while-error: a recently expired entry beats a 503.
                let now = self.clock.now();
                let stale_horizon =
                    i64::try_from(self.config.stale_while_error.as_secs()).unwrap_or(3_600);
                if let Some(template) = cached
                    && template.is_fresh(now, stale_horizon)
                {
                    GatewayMetrics::bump(&self.metrics.recommend_stale_served);
                    return Ok(self.serve(principal, template));
                }
                return Err(GatewayError::api(
                    ErrorKind::UpstreamUnavailable,
                    "recommendation engine is unavailable",
                ));
            }
        };

        let template = self.rank(request, response).await?;

        // The cache entry outlives freshness by the stale horizon so it can
        // back the stale-while-error path.
        let cache_key = CacheKey::new(KeyKind::RecommendCache, fingerprint);
        match serde_json::to_string(&template) {
            Ok(serialized) => {
                if let Err(e) = self
                    .cache
                    .set(&cache_key, &serialized, Some(self.config.stale_while_error))
                    .await
                {
                    warn!(error = %e, "failed to cache recommendation result");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize recommendation result"),
        }

        Ok(self.serve(principal, template))
    }

    /// One engine attempt plus one internal retry with jittered backoff.
    async fn call_engine(
        &self,
        request: &EngineRequest,
        deadline: Duration,
    ) -> Result<EngineResponse, EngineError> {
        match self.engine.recommend(request, deadline).await {
            Ok(response) => Ok(response),
            Err(first) => {
                let base = self.config.retry_backoff;
                let jitter_ms = u64::from(self.clock.now().timestamp_subsec_micros())
                    % (base.as_millis().max(1) as u64);
                let backoff = base / 2 + Duration::from_millis(jitter_ms);
                debug!(error = %first, backoff_ms = backoff.as_millis() as u64, "retrying engine call");
                tokio::time::sleep(backoff).await;
                self.engine.recommend(request, deadline).await
            }
        }
    }

    /// Order engine results deterministically: score descending, then older
    /// track first, then track id.
    async fn rank(
        &self,
        request: &RecommendRequest,
        response: EngineResponse,
    ) -> Result<RecommendationSet, GatewayError> {
        let mut scored = Vec::with_capacity(response.tracks.len());
        for track in response.tracks {
            let created_at = self
                .repo
                .track_by_id(&track.track_id)
                .await?
                .map(|t| t.created_at);
            scored.push((track, created_at));
        }

        scored.sort_by(|(a, a_created), (b, b_created)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| match (a_created, b_created) {
                    (Some(a), Some(b)) => a.cmp(b),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.track_id.as_str().cmp(b.track_id.as_str()))
        });

        let tracks = scored
            .into_iter()
            .take(request.limit)
            .map(|(track, _)| RankedTrack {
                track_id: track.track_id,
                score: track.score,
                reason: track.reason,
                recommendation_id: RecommendationId::new(self.ids.mint()),
            })
            .collect();

        Ok(RecommendationSet {
            request_id: self.ids.mint(),
            kind: request.kind,
            model_type: response.model_type,
            model_version: response.model_version,
            tracks,
            produced_at: self.clock.now(),
        })
    }

    /// Stamp a serving from a template: fresh per-slot recommendation ids,
    /// and one impression per returned track through the bounded buffer.
    fn serve(&self, principal: &Principal, template: RecommendationSet) -> RecommendationSet {
        let now = self.clock.now();
        let serving = RecommendationSet {
            request_id: self.ids.mint(),
            kind: template.kind,
            model_type: template.model_type.clone(),
            model_version: template.model_version.clone(),
            tracks: template
                .tracks
                .iter()
                .map(|t| RankedTrack {
                    track_id: t.track_id.clone(),
                    score: t.score,
                    reason: t.reason.clone(),
                    recommendation_id: RecommendationId::new(self.ids.mint()),
                })
                .collect(),
            produced_at: template.produced_at,
        };

        let impressions: Vec<Impression> = serving
            .tracks
            .iter()
            .enumerate()
            .map(|(index, track)| Impression {
                id: self.ids.mint(),
                user_id: principal.user_id.clone(),
                track_id: track.track_id.clone(),
                recommendation_id: track.recommendation_id.clone(),
                model_type: serving.model_type.clone(),
                model_version: serving.model_version.clone(),
                score: track.score,
                position: u32::try_from(index + 1).unwrap_or(u32::MAX),
                context: serving.kind.as_str().to_owned(),
                shown_at: now,
                clicked: false,
                played: false,
                liked: false,
            })
            .collect();

        GatewayMetrics::add(&self.metrics.impressions_buffered, impressions.len() as u64);
        self.buffer.push_all(impressions);

        serving
    }

    async fn load_cached(&self, fingerprint: &str) -> Option<RecommendationSet> {
        let cache_key = CacheKey::new(KeyKind::RecommendCache, fingerprint);
        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!(error = %e, "dropping unreadable recommendation cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                // Cache misses are normal; cache outages degrade to the
                // engine path.
                warn!(error = %e, "recommendation cache unavailable");
                None
            }
        }
    }
}
