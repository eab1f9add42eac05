//! Billing plans, model tiers, and the plan catalog.
//!
//! The catalog is data, not code: it maps each plan to its feature set and
//! its named quota buckets with per-window limits. A `None` limit means the
//! window is unmetered for that plan.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing tier of an organization. Ordering follows upgrade order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Plan {
    /// Parse a plan from a string, case-insensitively.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(Self::Free),
            "starter" => Some(Self::Starter),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Return the wire representation of the plan.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// All plans at or above the given floor, in upgrade order.
    #[must_use]
    pub fn at_or_above(floor: Self) -> Vec<Self> {
        [Self::Free, Self::Starter, Self::Pro, Self::Enterprise]
            .into_iter()
            .filter(|p| *p >= floor)
            .collect()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model tier submitted to the recommendation engine, derived from the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Lite,
    Standard,
    Advanced,
}

impl ModelTier {
    /// The highest tier a plan is entitled to.
    #[must_use]
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => Self::Lite,
            Plan::Starter => Self::Standard,
            Plan::Pro | Plan::Enterprise => Self::Advanced,
        }
    }

    /// Return the wire representation of the tier.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "lite",
            Self::Standard => "standard",
            Self::Advanced => "advanced",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed metering window, aligned to UTC boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Minute,
    Hour,
    Day,
}

impl QuotaWindow {
    /// Window length in seconds.
    #[must_use]
    pub fn duration_seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Unix timestamp of the start of the window containing `now`.
    ///
    /// Epoch-aligned, so the day window starts at UTC midnight.
    #[must_use]
    pub fn window_start(self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp();
        ts - ts.rem_euclid(self.duration_seconds())
    }

    /// Unix timestamp of the next window boundary after `now`.
    #[must_use]
    pub fn next_boundary(self, now: DateTime<Utc>) -> i64 {
        self.window_start(now) + self.duration_seconds()
    }

    /// Seconds remaining until the window containing `now` resets.
    #[must_use]
    pub fn seconds_until_reset(self, now: DateTime<Utc>) -> u64 {
        let remaining = self.next_boundary(now) - now.timestamp();
        u64::try_from(remaining.max(1)).unwrap_or(1)
    }

    /// Return the wire representation of the window.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-window limits for a quota bucket. `None` means unmetered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
}

impl WindowLimits {
    /// The limit for a specific window, `None` if unmetered.
    #[must_use]
    pub fn for_window(&self, window: QuotaWindow) -> Option<u64> {
        match window {
            QuotaWindow::Minute => self.per_minute,
            QuotaWindow::Hour => self.per_hour,
            QuotaWindow::Day => self.per_day,
        }
    }

    /// Iterate the windows that carry a limit.
    pub fn metered_windows(&self) -> impl Iterator<Item = (QuotaWindow, u64)> {
        [
            (QuotaWindow::Minute, self.per_minute),
            (QuotaWindow::Hour, self.per_hour),
            (QuotaWindow::Day, self.per_day),
        ]
        .into_iter()
        .filter_map(|(w, l)| l.map(|l| (w, l)))
    }
}

/// Entitlements of a single plan: feature flags and quota buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Named features enabled for this plan.
    #[serde(default)]
    pub features: BTreeSet<String>,
    /// Quota bucket name to per-window limits.
    #[serde(default)]
    pub quotas: HashMap<String, WindowLimits>,
}

/// The plan table: entitlements per plan plus the upgrade URL surfaced in
/// plan-gate denials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    #[serde(default)]
    pub plans: HashMap<Plan, PlanLimits>,
    #[serde(default = "default_upgrade_url")]
    pub upgrade_url: String,
}

fn default_upgrade_url() -> String {
    "https://tunetrail.dev/upgrade".to_owned()
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlanCatalog {
    /// The built-in plan table. Config may override individual entries.
    #[must_use]
    pub fn builtin() -> Self {
        let mut plans = HashMap::new();

        plans.insert(
            Plan::Free,
            PlanLimits {
                features: BTreeSet::new(),
                quotas: HashMap::from([
                    (
                        buckets::API_CALLS.to_owned(),
                        WindowLimits {
                            per_minute: Some(60),
                            per_hour: Some(1_000),
                            per_day: Some(10_000),
                        },
                    ),
                    (
                        buckets::AUDIO_ANALYSIS.to_owned(),
                        WindowLimits {
                            per_day: Some(10),
                            ..WindowLimits::default()
                        },
                    ),
                    (
                        buckets::RECOMMENDATIONS.to_owned(),
                        WindowLimits {
                            per_day: Some(500),
                            ..WindowLimits::default()
                        },
                    ),
                ]),
            },
        );

        plans.insert(
            Plan::Starter,
            PlanLimits {
                features: BTreeSet::from([
                    features::DAILY_MIX.to_owned(),
                    features::RADIO.to_owned(),
                ]),
                quotas: HashMap::from([
                    (
                        buckets::API_CALLS.to_owned(),
                        WindowLimits {
                            per_minute: Some(300),
                            per_hour: Some(5_000),
                            per_day: Some(50_000),
                        },
                    ),
                    (
                        buckets::AUDIO_ANALYSIS.to_owned(),
                        WindowLimits {
                            per_day: Some(100),
                            ..WindowLimits::default()
                        },
                    ),
                    (
                        buckets::RECOMMENDATIONS.to_owned(),
                        WindowLimits {
                            per_day: Some(2_000),
                            ..WindowLimits::default()
                        },
                    ),
                ]),
            },
        );

        plans.insert(
            Plan::Pro,
            PlanLimits {
                features: BTreeSet::from([
                    features::DAILY_MIX.to_owned(),
                    features::RADIO.to_owned(),
                    features::TASTE_PROFILE.to_owned(),
                    features::ADVANCED_ANALYTICS.to_owned(),
                    features::API_USAGE_ANALYTICS.to_owned(),
                ]),
                quotas: HashMap::from([
                    (
                        buckets::API_CALLS.to_owned(),
                        WindowLimits {
                            per_minute: Some(1_000),
                            per_hour: Some(20_000),
                            per_day: Some(200_000),
                        },
                    ),
                    (
                        buckets::AUDIO_ANALYSIS.to_owned(),
                        WindowLimits {
                            per_day: Some(1_000),
                            ..WindowLimits::default()
                        },
                    ),
                    (
                        buckets::RECOMMENDATIONS.to_owned(),
                        WindowLimits {
                            per_day: Some(10_000),
                            ..WindowLimits::default()
                        },
                    ),
                ]),
            },
        );

        plans.insert(
            Plan::Enterprise,
            PlanLimits {
                features: BTreeSet::from([
                    features::DAILY_MIX.to_owned(),
                    features::RADIO.to_owned(),
                    features::TASTE_PROFILE.to_owned(),
                    features::ADVANCED_ANALYTICS.to_owned(),
                    features::API_USAGE_ANALYTICS.to_owned(),
                ]),
                // Enterprise is unmetered on every bucket.
                quotas: HashMap::new(),
            },
        );

        Self {
            plans,
            upgrade_url: default_upgrade_url(),
        }
    }

    /// Whether `feature` is enabled for `plan` (before org-level overrides).
    #[must_use]
    pub fn feature_enabled(&self, plan: Plan, feature: &str) -> bool {
        self.plans
            .get(&plan)
            .is_some_and(|l| l.features.contains(feature))
    }

    /// The limit for `(plan, bucket, window)`. `None` means unmetered.
    #[must_use]
    pub fn quota_limit(&self, plan: Plan, bucket: &str, window: QuotaWindow) -> Option<u64> {
        self.plans
            .get(&plan)
            .and_then(|l| l.quotas.get(bucket))
            .and_then(|w| w.for_window(window))
    }

    /// All metered windows for `(plan, bucket)`.
    #[must_use]
    pub fn metered_windows(&self, plan: Plan, bucket: &str) -> Vec<(QuotaWindow, u64)> {
        self.plans
            .get(&plan)
            .and_then(|l| l.quotas.get(bucket))
            .map(|w| w.metered_windows().collect())
            .unwrap_or_default()
    }

}

/// Well-known quota bucket names.
pub mod buckets {
    pub const API_CALLS: &str = "api_calls";
    pub const AUDIO_ANALYSIS: &str = "audio_analysis_per_day";
    pub const RECOMMENDATIONS: &str = "recommendations_per_day";
}

/// Well-known feature flag names.
pub mod features {
    pub const DAILY_MIX: &str = "daily_mix";
    pub const RADIO: &str = "radio";
    pub const TASTE_PROFILE: &str = "taste_profile";
    pub const ADVANCED_ANALYTICS: &str = "advanced_analytics";
    pub const API_USAGE_ANALYTICS: &str = "api_usage_analytics";
}
