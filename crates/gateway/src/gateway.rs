//! The serving-plane aggregate: every component wired once at startup and
//! passed down as a unit.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use tunetrail_core::{Clock, IdGen, PlanCatalog, SystemClock, UuidIdGen};
use tunetrail_engine::RecommendationEngine;
use tunetrail_repo::Repository;
use tunetrail_state::CacheStore;

use crate::api_keys::ApiKeyService;
use crate::dispatch::{DispatcherConfig, RecommendationDispatcher};
use crate::error::GatewayError;
use crate::gate::QuotaGate;
use crate::impressions::ImpressionBuffer;
use crate::ingest::InteractionIngestor;
use crate::metrics::GatewayMetrics;
use crate::sessions::SessionManager;

/// Default bound on the impression buffer.
const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// The assembled serving plane. Components share the injected
/// repository, cache, clock, and id minter.
pub struct Gateway {
    pub repo: Arc<dyn Repository>,
    pub cache: Arc<dyn CacheStore>,
    pub engine: Arc<dyn RecommendationEngine>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGen>,
    pub catalog: Arc<PlanCatalog>,
    pub metrics: Arc<GatewayMetrics>,
    pub gate: Arc<QuotaGate>,
    pub sessions: Arc<SessionManager>,
    pub ingestor: Arc<InteractionIngestor>,
    pub dispatcher: Arc<RecommendationDispatcher>,
    pub api_keys: Arc<ApiKeyService>,
    pub impression_buffer: Arc<ImpressionBuffer>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

/// Fluent builder for constructing a [`Gateway`] instance.
///
/// At minimum, a [`Repository`], a [`CacheStore`], and a
/// [`RecommendationEngine`] must be supplied. Everything else has sensible
/// defaults (system clock, UUID ids, built-in plan catalog).
pub struct GatewayBuilder {
    repo: Option<Arc<dyn Repository>>,
    cache: Option<Arc<dyn CacheStore>>,
    engine: Option<Arc<dyn RecommendationEngine>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    catalog: PlanCatalog,
    dispatcher_config: DispatcherConfig,
    idle_timeout: ChronoDuration,
    rotation_grace: ChronoDuration,
    buffer_capacity: usize,
}

impl GatewayBuilder {
    /// Create a new builder with all optional fields set to their
    /// defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            repo: None,
            cache: None,
            engine: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIdGen),
            catalog: PlanCatalog::builtin(),
            dispatcher_config: DispatcherConfig::default(),
            idle_timeout: ChronoDuration::minutes(15),
            rotation_grace: ChronoDuration::hours(24),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Set the repository implementation.
    #[must_use]
    pub fn repo(mut self, repo: Arc<dyn Repository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Set the cache store implementation.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the recommendation engine implementation.
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn RecommendationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Override the wall clock (tests use a manual clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the id minter.
    #[must_use]
    pub fn ids(mut self, ids: Arc<dyn IdGen>) -> Self {
        self.ids = ids;
        self
    }

    /// Replace the plan catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Set the dispatcher tunables (TTLs, limits, retry backoff).
    #[must_use]
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Set the session idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: ChronoDuration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the rotation grace period for old API keys.
    #[must_use]
    pub fn rotation_grace(mut self, grace: ChronoDuration) -> Self {
        self.rotation_grace = grace;
        self
    }

    /// Set the impression buffer capacity.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Assemble the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] when a required component
    /// is missing.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let repo = self
            .repo
            .ok_or_else(|| GatewayError::Configuration("a repository is required".into()))?;
        let cache = self
            .cache
            .ok_or_else(|| GatewayError::Configuration("a cache store is required".into()))?;
        let engine = self
            .engine
            .ok_or_else(|| GatewayError::Configuration("an engine is required".into()))?;

        let metrics = Arc::new(GatewayMetrics::default());
        let catalog = Arc::new(self.catalog);
        let impression_buffer = Arc::new(ImpressionBuffer::new(self.buffer_capacity));

        let gate = Arc::new(QuotaGate::new(
            Arc::clone(&cache),
            Arc::clone(&repo),
            Arc::clone(&catalog),
            Arc::clone(&self.clock),
            Arc::clone(&metrics),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&repo),
            Arc::clone(&cache),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            Arc::clone(&metrics),
            self.idle_timeout,
        ));
        let ingestor = Arc::new(InteractionIngestor::new(
            Arc::clone(&repo),
            Arc::clone(&cache),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            Arc::clone(&metrics),
        ));
        let dispatcher = Arc::new(RecommendationDispatcher::new(
            Arc::clone(&repo),
            Arc::clone(&cache),
            Arc::clone(&engine),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            Arc::clone(&metrics),
            Arc::clone(&impression_buffer),
            self.dispatcher_config,
        ));
        let api_keys = Arc::new(ApiKeyService::new(
            Arc::clone(&repo),
            Arc::clone(&cache),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            Arc::clone(&metrics),
            self.rotation_grace,
        ));

        Ok(Gateway {
            repo,
            cache,
            engine,
            clock: self.clock,
            ids: self.ids,
            catalog,
            metrics,
            gate,
            sessions,
            ingestor,
            dispatcher,
            api_keys,
            impression_buffer,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tunetrail_engine::StaticEngine;
    use tunetrail_repo_memory::MemoryRepository;
    use tunetrail_state_memory::MemoryCacheStore;

    use super::*;

    #[test]
    fn build_requires_the_backends() {
        let err = GatewayBuilder::new().build().unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn build_with_backends_succeeds() {
        let gateway = GatewayBuilder::new()
            .repo(Arc::new(MemoryRepository::new()))
            .cache(Arc::new(MemoryCacheStore::new()))
            .engine(Arc::new(StaticEngine::new(vec![])))
            .build()
            .unwrap();
        assert_eq!(gateway.impression_buffer.len(), 0);
    }
}
