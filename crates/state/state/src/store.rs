use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateError;
use crate::key::{CacheKey, KeyKind};

/// Trait for the fast key/value cache backing rate counters, quota
/// counters, session liveness, and recommendation caching.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get the value for a key. Returns `None` if not found or expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, StateError>;

    /// Set a value with an optional TTL, overwriting any previous value.
    async fn set(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StateError>;

    /// Atomically increment a counter by `delta`. Returns the new value.
    ///
    /// Creates the counter at 0 if it doesn't exist before incrementing.
    /// The TTL applies only when the counter is created; the expiry of an
    /// existing counter is preserved, which is what fixed metering windows
    /// need.
    async fn increment(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError>;

    /// Value-based compare-and-swap. Returns `true` when the swap was
    /// applied.
    ///
    /// `expected = None` means "set only if the key is absent", which
    /// doubles as an atomic set-if-absent for idempotency markers.
    async fn compare_and_swap(
        &self,
        key: &CacheKey,
        expected: Option<&str>,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError>;

    /// Scan live keys of a kind whose id starts with `prefix`.
    ///
    /// Returns `(id, value)` pairs, with the kind segment stripped from
    /// the id. May be expensive on some backends; only the expiry sweep
    /// uses it.
    async fn keys_by_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError>;
}
