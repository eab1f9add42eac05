//! Request fingerprinting for the recommendation cache and single-flight.

use sha2::{Digest, Sha256};

use crate::plan::ModelTier;
use crate::recommend::RecommendKind;
use crate::types::{TrackId, UserId};

/// Compute the deterministic fingerprint identifying a recommendation
/// request for caching and single-flight coalescing.
///
/// Hex-encoded SHA-256 over labeled fields, so reordering or omitting a
/// field can never collide with another request shape.
#[must_use]
pub fn recommendation_fingerprint(
    kind: RecommendKind,
    user_id: &UserId,
    seed: Option<&TrackId>,
    limit: usize,
    tier: ModelTier,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"kind=");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b";user=");
    hasher.update(user_id.as_str().as_bytes());
    hasher.update(b";seed=");
    hasher.update(seed.map_or("", TrackId::as_str).as_bytes());
    hasher.update(b";limit=");
    hasher.update(limit.to_string().as_bytes());
    hasher.update(b";tier=");
    hasher.update(tier.as_str().as_bytes());
    hasher.update(b";");
    hex::encode(hasher.finalize())
}
