use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters tracking serving-plane outcomes.
///
/// All counters use relaxed ordering for maximum throughput. For a
/// consistent point-in-time view, call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Recommendation responses served (any source).
    pub recommendations_served: AtomicU64,
    /// Recommendation responses answered from the fresh cache.
    pub recommend_cache_hits: AtomicU64,
    /// Recommendation responses answered from a stale entry after an
    /// engine failure.
    pub recommend_stale_served: AtomicU64,
    /// Engine calls that timed out.
    pub engine_timeouts: AtomicU64,
    /// Engine calls that failed for other reasons.
    pub engine_errors: AtomicU64,
    /// Impressions accepted into the buffer.
    pub impressions_buffered: AtomicU64,
    /// Impressions persisted by the flusher.
    pub impressions_flushed: AtomicU64,
    /// Impressions dropped on buffer overflow.
    pub impressions_dropped: AtomicU64,
    /// Requests denied by the plan gate.
    pub plan_denied: AtomicU64,
    /// Requests denied by the feature gate.
    pub feature_denied: AtomicU64,
    /// Requests denied by a quota window.
    pub quota_denied: AtomicU64,
    /// Sessions started.
    pub sessions_started: AtomicU64,
    /// Sessions ended by explicit client calls.
    pub sessions_ended: AtomicU64,
    /// Sessions expired by the sweeper or supersession.
    pub sessions_expired: AtomicU64,
    /// Interactions accepted.
    pub interactions_ingested: AtomicU64,
    /// Interactions rejected by validation or ordering.
    pub interactions_rejected: AtomicU64,
    /// Interaction events downgraded by validation.
    pub interactions_downgraded: AtomicU64,
    /// Feedback submissions that recorded a new interaction.
    pub feedback_recorded: AtomicU64,
    /// Feedback submissions swallowed as duplicates.
    pub feedback_duplicates: AtomicU64,
    /// API keys issued.
    pub keys_issued: AtomicU64,
    /// API keys rotated.
    pub keys_rotated: AtomicU64,
    /// API keys revoked.
    pub keys_revoked: AtomicU64,
}

/// Point-in-time view of [`GatewayMetrics`], serialized on `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub recommendations_served: u64,
    pub recommend_cache_hits: u64,
    pub recommend_stale_served: u64,
    pub engine_timeouts: u64,
    pub engine_errors: u64,
    pub impressions_buffered: u64,
    pub impressions_flushed: u64,
    pub impressions_dropped: u64,
    pub plan_denied: u64,
    pub feature_denied: u64,
    pub quota_denied: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub sessions_expired: u64,
    pub interactions_ingested: u64,
    pub interactions_rejected: u64,
    pub interactions_downgraded: u64,
    pub feedback_recorded: u64,
    pub feedback_duplicates: u64,
    pub keys_issued: u64,
    pub keys_rotated: u64,
    pub keys_revoked: u64,
}

impl GatewayMetrics {
    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recommendations_served: self.recommendations_served.load(Ordering::Relaxed),
            recommend_cache_hits: self.recommend_cache_hits.load(Ordering::Relaxed),
            recommend_stale_served: self.recommend_stale_served.load(Ordering::Relaxed),
            engine_timeouts: self.engine_timeouts.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            impressions_buffered: self.impressions_buffered.load(Ordering::Relaxed),
            impressions_flushed: self.impressions_flushed.load(Ordering::Relaxed),
            impressions_dropped: self.impressions_dropped.load(Ordering::Relaxed),
            plan_denied: self.plan_denied.load(Ordering::Relaxed),
            feature_denied: self.feature_denied.load(Ordering::Relaxed),
            quota_denied: self.quota_denied.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            interactions_ingested: self.interactions_ingested.load(Ordering::Relaxed),
            interactions_rejected: self.interactions_rejected.load(Ordering::Relaxed),
            interactions_downgraded: self.interactions_downgraded.load(Ordering::Relaxed),
            feedback_recorded: self.feedback_recorded.load(Ordering::Relaxed),
            feedback_duplicates: self.feedback_duplicates.load(Ordering::Relaxed),
            keys_issued: self.keys_issued.load(Ordering::Relaxed),
            keys_rotated: self.keys_rotated.load(Ordering::Relaxed),
            keys_revoked: self.keys_revoked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_counters() {
        let metrics = GatewayMetrics::default();
        GatewayMetrics::bump(&metrics.quota_denied);
        GatewayMetrics::add(&metrics.impressions_buffered, 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.quota_denied, 1);
        assert_eq!(snap.impressions_buffered, 3);
        assert_eq!(snap.engine_timeouts, 0);
    }
}
