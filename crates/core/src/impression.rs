use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RecommendationId, TrackId, UserId};

/// A record that a specific track was shown to a user in a specific slot of
/// a recommendation response. Append-only; the boolean flags are flipped
/// set-true-once by the interaction ingestor when matching events arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impression {
    pub id: String,
    pub user_id: UserId,
    pub track_id: TrackId,
    /// The per-slot recommendation id clients echo back in feedback and
    /// interactions.
    pub recommendation_id: RecommendationId,
    pub model_type: String,
    pub model_version: String,
    pub score: f64,
    /// 1-based position within the served list.
    pub position: u32,
    /// The request kind that produced this impression.
    pub context: String,
    pub shown_at: DateTime<Utc>,
    pub clicked: bool,
    pub played: bool,
    pub liked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impression_serde_roundtrip() {
        let imp = Impression {
            id: "imp-1".to_owned(),
            user_id: UserId::new("usr-1"),
            track_id: TrackId::new("trk-1"),
            recommendation_id: RecommendationId::new("rec-1"),
            model_type: "collaborative".to_owned(),
            model_version: "2025.06.1".to_owned(),
            score: 0.93,
            position: 1,
            context: "user_personal".to_owned(),
            shown_at: Utc::now(),
            clicked: false,
            played: false,
            liked: false,
        };
        let json = serde_json::to_string(&imp).unwrap();
        let back: Impression = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recommendation_id, imp.recommendation_id);
        assert_eq!(back.position, 1);
    }
}
