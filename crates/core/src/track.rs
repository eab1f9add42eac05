use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TrackId;

/// Catalog entry the serving plane needs for validation and tie-breaking.
/// The full catalog (audio features, album art, ...) lives outside this
/// plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}
