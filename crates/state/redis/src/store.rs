use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};

use tunetrail_state::error::StateError;
use tunetrail_state::key::{CacheKey, KeyKind};
use tunetrail_state::store::CacheStore;

use crate::config::RedisConfig;
use crate::scripts;

/// Redis-backed implementation of [`CacheStore`].
///
/// Uses a `deadpool-redis` connection pool. All values are plain Redis
/// strings; compare-and-swap runs as a Lua script for atomicity.
pub struct RedisCacheStore {
    pool: Pool,
    prefix: String,
}

impl RedisCacheStore {
    /// Create a new `RedisCacheStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StateError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StateError::Connection(e.to_string()))?
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    /// Build the full Redis key for a cache key.
    fn render_key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.prefix, key.canonical())
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))
    }

    fn ttl_ms(ttl: Option<Duration>) -> i64 {
        ttl.map_or(0i64, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;

        let val: Option<String> = conn
            .get(&redis_key)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(val)
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;

        if let Some(d) = ttl {
            let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            let () = conn
                .pset_ex(&redis_key, value, ms)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;
        } else {
            let () = conn
                .set(&redis_key, value)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;
        }

        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;

        let deleted: i64 = conn
            .del(&redis_key)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(deleted > 0)
    }

    async fn increment(
        &self,
        key: &CacheKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;

        let new_val: i64 = conn
            .incr(&redis_key, delta)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        // `PEXPIRE .. NX` arms the window TTL only when the key has none,
        // i.e. on the increment that created the counter.
        if let Some(d) = ttl {
            let ms = Self::ttl_ms(Some(d));
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&redis_key)
                .arg(ms)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;
        }

        Ok(new_val)
    }

    async fn compare_and_swap(
        &self,
        key: &CacheKey,
        expected: Option<&str>,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;

        let script = Script::new(scripts::COMPARE_AND_SWAP);
        let result: i64 = script
            .key(&redis_key)
            .arg(i32::from(expected.is_some()))
            .arg(expected.unwrap_or(""))
            .arg(new_value)
            .arg(Self::ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(result == 1)
    }

    async fn keys_by_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError> {
        let match_prefix = format!("{}:{}:{}", self.prefix, kind, prefix);
        let pattern = format!("{match_prefix}*");
        let strip = format!("{}:{}:", self.prefix, kind);

        let mut conn = self.conn().await?;
        let mut results = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StateError::Backend(e.to_string()))?;

            for key in keys {
                let val: Option<String> = conn
                    .get(&key)
                    .await
                    .map_err(|e| StateError::Backend(e.to_string()))?;

                // The key may have expired between SCAN and GET.
                let Some(value) = val else { continue };

                let id = key.strip_prefix(&strip).unwrap_or(&key).to_owned();
                results.push((id, value));
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(results)
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::config::RedisConfig;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            prefix: format!("tunetrail-test-{}", uuid::Uuid::new_v4()),
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn store_conformance() {
        let config = test_config();
        let store = RedisCacheStore::new(&config).expect("pool creation should succeed");
        tunetrail_state::testing::run_store_conformance_tests(&store)
            .await
            .expect("conformance tests should pass");
    }
}
