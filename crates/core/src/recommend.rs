use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{ModelTier, Plan};
use crate::types::{RecommendationId, TrackId};

/// Kinds of recommendation requests, each with a minimum plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendKind {
    UserPersonal,
    SimilarToTrack,
    DailyMix,
    RadioSeed,
    TasteProfile,
}

impl RecommendKind {
    /// Return the wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPersonal => "user_personal",
            Self::SimilarToTrack => "similar_to_track",
            Self::DailyMix => "daily_mix",
            Self::RadioSeed => "radio_seed",
            Self::TasteProfile => "taste_profile",
        }
    }

    /// The minimum plan entitled to this kind (the stricter gate table).
    #[must_use]
    pub fn min_plan(self) -> Plan {
        match self {
            Self::UserPersonal | Self::SimilarToTrack => Plan::Free,
            Self::DailyMix | Self::RadioSeed => Plan::Starter,
            Self::TasteProfile => Plan::Pro,
        }
    }

    /// Default engine deadline for this kind.
    #[must_use]
    pub fn default_timeout_ms(self) -> u64 {
        match self {
            Self::TasteProfile => 10_000,
            _ => 2_000,
        }
    }
}

impl std::fmt::Display for RecommendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed recommendation request after plan resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendRequest {
    pub kind: RecommendKind,
    /// Seed track for `similar_to_track` and `radio_seed`.
    pub seed: Option<TrackId>,
    pub limit: usize,
    pub model_tier: ModelTier,
}

/// One ranked slot in a served recommendation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedTrack {
    pub track_id: TrackId,
    pub score: f64,
    pub reason: Option<String>,
    /// The per-slot id clients echo back in feedback and interactions.
    pub recommendation_id: RecommendationId,
}

/// A served (and cacheable) recommendation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub request_id: String,
    pub kind: RecommendKind,
    pub model_type: String,
    pub model_version: String,
    pub tracks: Vec<RankedTrack>,
    pub produced_at: DateTime<Utc>,
}

impl RecommendationSet {
    /// Whether this entry is still fresh at `now` for the given TTL.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl_seconds: i64) -> bool {
        (now - self.produced_at).num_seconds() < ttl_seconds
    }
}

/// Client feedback on a served recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    Accept,
    Reject,
    Played,
    Saved,
    Dismissed,
}

impl FeedbackSignal {
    /// Return the wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Played => "played",
            Self::Saved => "saved",
            Self::Dismissed => "dismissed",
        }
    }
}
