use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use tunetrail_state::error::StateError;
use tunetrail_state::key::{CacheKey, KeyKind};
use tunetrail_state::store::CacheStore;

/// A single entry in the in-memory store.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    /// Returns `true` if this entry has passed its TTL deadline.
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Compute the expiry instant from an optional TTL duration.
fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

/// In-memory [`CacheStore`] backed by a [`DashMap`].
///
/// Entries are lazily evicted on read when their TTL has elapsed. This
/// implementation is fully synchronous internally; the async trait methods
/// return immediately.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    data: DashMap<String, Entry>,
}

impl MemoryCacheStore {
    /// Create a new, empty in-memory cache store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a [`CacheKey`] into the string used as the map key.
    fn render_key(key: &CacheKey) -> String {
        key.canonical()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, StateError> {
        let rendered = Self::render_key(key);

        // Lazy TTL eviction: check and remove if expired.
        if let Some(entry) = self.data.get(&rendered) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(&rendered);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }

        Ok(None)
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        self.data
            .entry(rendered)
            .and_modify(|entry| {
                value.clone_into(&mut entry.value);
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry {
                value: value.to_owned(),
                expires_at,
            });

        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Remove, but treat expired entries as "not found".
        match self.data.remove(&rendered) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn increment(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        let rendered = Self::render_key(key);

        // Remove any expired entry first so the counter starts fresh.
        self.data.remove_if(&rendered, |_, entry| entry.is_expired());

        let mut ref_mut = self.data.entry(rendered).or_insert_with(|| Entry {
            value: "0".to_owned(),
            // TTL applies only at creation; an existing counter keeps its
            // original window expiry.
            expires_at: expiry_from_ttl(ttl),
        });

        let current: i64 = ref_mut
            .value
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                StateError::Serialization(format!("counter value is not an integer: {e}"))
            })?;

        let new_value = current + delta;
        ref_mut.value = new_value.to_string();

        Ok(new_value)
    }

    async fn compare_and_swap(
        &self,
        key: &CacheKey,
        expected: Option<&str>,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Expired entries behave as missing.
        self.data.remove_if(&rendered, |_, entry| entry.is_expired());

        let applied = match self.data.entry(rendered) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get().value.as_str()) {
                    let prior_expiry = occupied.get().expires_at;
                    occupied.insert(Entry {
                        value: new_value.to_owned(),
                        expires_at: expiry_from_ttl(ttl).or(prior_expiry),
                    });
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(Entry {
                        value: new_value.to_owned(),
                        expires_at: expiry_from_ttl(ttl),
                    });
                    true
                } else {
                    false
                }
            }
        };

        Ok(applied)
    }

    async fn keys_by_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError> {
        let kind_prefix = format!("{kind}:");
        let full_prefix = format!("{kind_prefix}{prefix}");

        let mut results = Vec::new();
        for entry in &self.data {
            let key = entry.key();
            if key.starts_with(&full_prefix) && !entry.value().is_expired() {
                let id = key[kind_prefix.len()..].to_owned();
                results.push((id, entry.value().value.clone()));
            }
        }

        Ok(results)
    }
}
