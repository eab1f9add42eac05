//! The plan / feature / quota gate.
//!
//! Three layers evaluated in order: plan floor, feature flag, then quota
//! windows. Quota counters are atomic increments on the cache; there is no
//! read-then-write race between concurrent requests for the same org.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use tunetrail_core::{
    ApiError, ApiKey, Clock, ErrorKind, KeyWindowLimits, Plan, PlanCatalog, Principal, QuotaWindow,
    plan::buckets,
};
use tunetrail_repo::Repository;
use tunetrail_state::{CacheKey, CacheStore, KeyKind};

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;

/// What an operation demands from the gate.
#[derive(Debug, Clone, Default)]
pub struct ResourceDescriptor {
    /// Operation name used in denial messages and logs.
    pub operation: &'static str,
    /// Minimum plan, if the operation is plan-gated.
    pub required_plan: Option<Plan>,
    /// Feature flag, if the operation is feature-gated.
    pub feature: Option<&'static str>,
    /// Quota bucket metered for this operation.
    pub quota_bucket: Option<&'static str>,
    /// Fail closed on cache outage for pro/enterprise callers.
    pub sensitive: bool,
}

/// Advisory rate-limit state for the most-constrained active window,
/// surfaced as `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitAdvisory {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the window resets.
    pub reset: i64,
}

/// Evaluates plan, feature, and per-window quota entitlements.
pub struct QuotaGate {
    cache: Arc<dyn CacheStore>,
    repo: Arc<dyn Repository>,
    catalog: Arc<PlanCatalog>,
    clock: Arc<dyn Clock>,
    metrics: Arc<GatewayMetrics>,
}

impl QuotaGate {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        repo: Arc<dyn Repository>,
        catalog: Arc<PlanCatalog>,
        clock: Arc<dyn Clock>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            cache,
            repo,
            catalog,
            clock,
            metrics,
        }
    }

    /// The configured plan catalog.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Evaluate all gate layers for one operation.
    ///
    /// Returns the advisory header state for the most-constrained passing
    /// window, or `None` when no window applies (unmetered plan).
    #[instrument(name = "gate.check", skip_all, fields(operation = descriptor.operation))]
    pub async fn check(
        &self,
        principal: &Principal,
        descriptor: &ResourceDescriptor,
    ) -> Result<Option<RateLimitAdvisory>, GatewayError> {
        // (a) Plan gate.
        if let Some(required) = descriptor.required_plan
            && principal.plan < required
        {
            GatewayMetrics::bump(&self.metrics.plan_denied);
            return Err(self.plan_denial(principal.plan, required, descriptor.operation));
        }

        // (b) Feature gate.
        if let Some(feature) = descriptor.feature
            && !self.feature_enabled(principal, feature).await?
        {
            GatewayMetrics::bump(&self.metrics.feature_denied);
            return Err(GatewayError::Api(
                ApiError::new(
                    ErrorKind::FeatureNotInPlan,
                    format!("feature '{feature}' is not included in the current plan"),
                )
                .with_details(serde_json::json!({
                    "current_plan": principal.plan.as_str(),
                    "feature": feature,
                }))
                .with_upgrade_url(self.catalog.upgrade_url.clone()),
            ));
        }

        // (c) Quota gate.
        let mut advisory = None;
        if let Some(bucket) = descriptor.quota_bucket {
            advisory = self
                .check_bucket(principal, bucket, descriptor.sensitive)
                .await?;
        }

        Ok(advisory)
    }

    /// Evaluate the generic per-request buckets that apply to every
    /// authenticated call: the plan's `api_calls` windows plus the API
    /// key's own per-window limits when one is in play.
    pub async fn check_api_request(
        &self,
        principal: &Principal,
        key: Option<&ApiKey>,
    ) -> Result<Option<RateLimitAdvisory>, GatewayError> {
        let mut advisory = self
            .check_bucket(principal, buckets::API_CALLS, false)
            .await?;

        if let Some(key) = key {
            let key_advisory = self.check_key_windows(key).await?;
            advisory = most_constrained(advisory, key_advisory);
        }

        Ok(advisory)
    }

    /// Effective feature state: plan catalog layered with org overrides.
    async fn feature_enabled(
        &self,
        principal: &Principal,
        feature: &str,
    ) -> Result<bool, GatewayError> {
        if let Some(org) = self.repo.organization_by_id(&principal.org_id).await?
            && let Some(&forced) = org.feature_overrides.get(feature)
        {
            return Ok(forced);
        }
        Ok(self.catalog.feature_enabled(principal.plan, feature))
    }

    /// Check every metered window of a plan bucket. All windows must pass.
    async fn check_bucket(
        &self,
        principal: &Principal,
        bucket: &str,
        sensitive: bool,
    ) -> Result<Option<RateLimitAdvisory>, GatewayError> {
        let windows = self.catalog.metered_windows(principal.plan, bucket);
        let mut advisory: Option<RateLimitAdvisory> = None;

        for (window, limit) in windows {
            let counter_id = format!(
                "{bucket}:{}:{}",
                principal.org_id,
                window.window_start(self.clock.now())
            );
            let key = CacheKey::new(KeyKind::QuotaCounter, counter_id);
            let result = self
                .count_window(&key, window, limit, principal.plan, sensitive, bucket)
                .await?;
            advisory = most_constrained(advisory, result);
        }

        Ok(advisory)
    }

    /// Check an API key's own per-window limits.
    async fn check_key_windows(
        &self,
        key: &ApiKey,
    ) -> Result<Option<RateLimitAdvisory>, GatewayError> {
        let KeyWindowLimits {
            per_minute,
            per_hour,
            per_day,
        } = key.limits;
        let windows = [
            (QuotaWindow::Minute, per_minute),
            (QuotaWindow::Hour, per_hour),
            (QuotaWindow::Day, per_day),
        ];

        let mut advisory: Option<RateLimitAdvisory> = None;
        for (window, limit) in windows {
            let Some(limit) = limit else { continue };
            let counter_id = format!(
                "key:{}:{}",
                key.id,
                window.window_start(self.clock.now())
            );
            let cache_key = CacheKey::new(KeyKind::RateCounter, counter_id);
            let result = self
                .count_window(&cache_key, window, limit, Plan::Free, false, "api_key")
                .await?;
            advisory = most_constrained(advisory, result);
        }

        Ok(advisory)
    }

    /// Increment one fixed-window counter and compare against its limit.
    ///
    /// The limit in force is pinned when the window's counter is created:
    /// a plan change mid-window neither refunds consumed quota nor applies
    /// the new limit before the next boundary.
    async fn count_window(
        &self,
        key: &CacheKey,
        window: QuotaWindow,
        limit: u64,
        plan: Plan,
        sensitive: bool,
        bucket: &str,
    ) -> Result<Option<RateLimitAdvisory>, GatewayError> {
        let now = self.clock.now();
        let window_ttl = Some(Duration::from_secs(
            u64::try_from(window.duration_seconds()).unwrap_or(60),
        ));

        let count = match self.cache.increment(key, 1, window_ttl).await {
            Ok(c) => c,
            Err(e) => {
                // Cache outage policy: free/starter fail open to protect
                // tenant availability; pro/enterprise sensitive paths fail
                // closed to prevent unmetered premium use.
                if sensitive && plan >= Plan::Pro {
                    warn!(error = %e, bucket, "quota counter unavailable (fail-closed)");
                    return Err(GatewayError::api(
                        ErrorKind::UpstreamUnavailable,
                        "quota accounting is temporarily unavailable",
                    ));
                }
                warn!(error = %e, bucket, "quota counter unavailable (fail-open)");
                return Ok(None);
            }
        };

        let limit = self.pinned_limit(key, limit, count, window_ttl).await;

        #[allow(clippy::cast_sign_loss)]
        let used = count.max(0) as u64;

        if used > limit {
            GatewayMetrics::bump(&self.metrics.quota_denied);
            let retry_after = window.seconds_until_reset(now);
            return Err(GatewayError::Api(
                ApiError::new(
                    ErrorKind::QuotaExceeded,
                    format!("quota '{bucket}' exhausted for the current {window} window"),
                )
                .with_details(serde_json::json!({
                    "bucket": bucket,
                    "window": window.as_str(),
                    "limit": limit,
                }))
                .with_retry_after(retry_after),
            ));
        }

        Ok(Some(RateLimitAdvisory {
            limit,
            remaining: limit - used,
            reset: window.next_boundary(now),
        }))
    }

    /// The limit pinned for this window. The counter-creating request
    /// stores the current limit under a sibling key; later requests in the
    /// same window read it back so a mid-window plan change waits for the
    /// boundary.
    async fn pinned_limit(
        &self,
        counter_key: &CacheKey,
        current_limit: u64,
        count: i64,
        window_ttl: Option<Duration>,
    ) -> u64 {
        let limit_key = CacheKey::new(counter_key.kind.clone(), format!("{}:limit", counter_key.id));

        if count <= 1 {
            if let Err(e) = self
                .cache
                .compare_and_swap(&limit_key, None, &current_limit.to_string(), window_ttl)
                .await
            {
                warn!(error = %e, "failed to pin quota window limit");
            }
            return current_limit;
        }

        match self.cache.get(&limit_key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(current_limit),
            _ => current_limit,
        }
    }

    fn plan_denial(&self, current: Plan, required: Plan, operation: &str) -> GatewayError {
        GatewayError::Api(
            ApiError::new(
                ErrorKind::PlanUpgradeRequired,
                format!("operation '{operation}' requires the {required} plan or higher"),
            )
            .with_details(serde_json::json!({
                "current_plan": current.as_str(),
                "required_plans": Plan::at_or_above(required)
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>(),
                "feature_description": operation,
            }))
            .with_upgrade_url(self.catalog.upgrade_url.clone()),
        )
    }
}

/// Keep the advisory with the fewest remaining requests.
fn most_constrained(
    a: Option<RateLimitAdvisory>,
    b: Option<RateLimitAdvisory>,
) -> Option<RateLimitAdvisory> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.remaining < a.remaining { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;

    use tunetrail_core::{AuthMethod, ManualClock, OrgId, UserId};
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    fn principal(plan: Plan) -> Principal {
        Principal {
            user_id: UserId::new("usr-1"),
            org_id: OrgId::new("org-1"),
            plan,
            scopes: vec!["*".to_owned()],
            auth_method: AuthMethod::SessionToken,
            key_id: None,
        }
    }

    fn gate() -> (QuotaGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let gate = QuotaGate::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MemoryRepository::new()),
            Arc::new(PlanCatalog::builtin()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(GatewayMetrics::default()),
        );
        (gate, clock)
    }

    #[tokio::test]
    async fn plan_gate_denies_below_floor() {
        let (gate, _clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "daily_mix",
            required_plan: Some(Plan::Starter),
            ..ResourceDescriptor::default()
        };

        let err = gate
            .check(&principal(Plan::Free), &descriptor)
            .await
            .unwrap_err();
        let GatewayError::Api(api) = err else {
            panic!("expected an API error");
        };
        assert_eq!(api.kind, ErrorKind::PlanUpgradeRequired);
        assert!(api.upgrade_url.is_some());
        let details = api.details.unwrap();
        assert_eq!(
            details["required_plans"],
            serde_json::json!(["starter", "pro", "enterprise"])
        );
    }

    #[tokio::test]
    async fn quota_denies_exactly_after_limit() {
        let (gate, _clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "audio_analysis",
            quota_bucket: Some(buckets::AUDIO_ANALYSIS),
            ..ResourceDescriptor::default()
        };
        let caller = principal(Plan::Free); // 10/day

        for _ in 0..10 {
            gate.check(&caller, &descriptor).await.unwrap();
        }
        let err = gate.check(&caller, &descriptor).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::QuotaExceeded));
    }

    #[tokio::test]
    async fn quota_retry_after_reaches_utc_midnight() {
        let (gate, clock) = gate();
        clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap());

        let descriptor = ResourceDescriptor {
            operation: "audio_analysis",
            quota_bucket: Some(buckets::AUDIO_ANALYSIS),
            ..ResourceDescriptor::default()
        };
        let caller = principal(Plan::Free);

        for _ in 0..10 {
            gate.check(&caller, &descriptor).await.unwrap();
        }
        let err = gate.check(&caller, &descriptor).await.unwrap_err();
        let GatewayError::Api(api) = err else {
            panic!("expected an API error");
        };
        assert_eq!(api.retry_after, Some(3_600));
    }

    #[tokio::test]
    async fn window_boundary_resets_the_counter() {
        let (gate, clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "audio_analysis",
            quota_bucket: Some(buckets::AUDIO_ANALYSIS),
            ..ResourceDescriptor::default()
        };
        let caller = principal(Plan::Free);

        for _ in 0..10 {
            gate.check(&caller, &descriptor).await.unwrap();
        }
        assert!(gate.check(&caller, &descriptor).await.is_err());

        // Next UTC day: a fresh window with a fresh counter.
        clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 1).unwrap());
        assert!(gate.check(&caller, &descriptor).await.is_ok());
    }

    #[tokio::test]
    async fn downgrade_mid_window_keeps_the_pinned_limit_until_the_boundary() {
        let (gate, clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "audio_analysis",
            quota_bucket: Some(buckets::AUDIO_ANALYSIS),
            ..ResourceDescriptor::default()
        };

        // Starter (100/day) consumes past the free limit of 10.
        let starter = principal(Plan::Starter);
        for _ in 0..20 {
            gate.check(&starter, &descriptor).await.unwrap();
        }

        // Downgrade mid-window: consumed quota is not refunded and the
        // pinned starter limit still governs this window.
        let downgraded = principal(Plan::Free);
        assert!(gate.check(&downgraded, &descriptor).await.is_ok());

        // Next UTC day: the free limit applies, and 21 requests are
        // already more than it would allow afresh.
        clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 1).unwrap());
        for _ in 0..10 {
            gate.check(&downgraded, &descriptor).await.unwrap();
        }
        let err = gate.check(&downgraded, &descriptor).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::QuotaExceeded));
    }

    #[tokio::test]
    async fn enterprise_is_unmetered() {
        let (gate, _clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "api",
            quota_bucket: Some(buckets::API_CALLS),
            ..ResourceDescriptor::default()
        };

        let advisory = gate
            .check(&principal(Plan::Enterprise), &descriptor)
            .await
            .unwrap();
        assert!(advisory.is_none());
    }

    #[tokio::test]
    async fn advisory_tracks_most_constrained_window() {
        let (gate, _clock) = gate();
        let descriptor = ResourceDescriptor {
            operation: "api",
            quota_bucket: Some(buckets::API_CALLS),
            ..ResourceDescriptor::default()
        };

        // Free plan: 60/min is the tightest window.
        let advisory = gate
            .check(&principal(Plan::Free), &descriptor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(advisory.limit, 60);
        assert_eq!(advisory.remaining, 59);
    }

    #[tokio::test]
    async fn org_override_force_enables_a_feature() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let repo = Arc::new(MemoryRepository::new());
        repo.create_organization(&tunetrail_core::Organization {
            id: OrgId::new("org-1"),
            slug: "acme".to_owned(),
            plan: Plan::Free,
            max_users: None,
            max_tracks: None,
            feature_overrides: std::collections::HashMap::from([(
                "daily_mix".to_owned(),
                true,
            )]),
            created_at: clock.now(),
        })
        .await
        .unwrap();

        let gate = QuotaGate::new(
            Arc::new(MemoryCacheStore::new()),
            repo,
            Arc::new(PlanCatalog::builtin()),
            clock,
            Arc::new(GatewayMetrics::default()),
        );

        let descriptor = ResourceDescriptor {
            operation: "daily_mix",
            feature: Some("daily_mix"),
            ..ResourceDescriptor::default()
        };
        assert!(gate.check(&principal(Plan::Free), &descriptor).await.is_ok());
    }
}
