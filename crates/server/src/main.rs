use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use tunetrail_core::PlanCatalog;
use tunetrail_engine::{HttpEngine, RecommendationEngine, StaticEngine};
use tunetrail_gateway::{BackgroundWorkers, GatewayBuilder};
use tunetrail_repo::Repository;
use tunetrail_server::api::AppState;
use tunetrail_server::auth::AuthService;
use tunetrail_server::auth::token::TokenManager;
use tunetrail_server::config::{
    CacheBackend, EngineBackend, RepositoryBackend, TuneTrailConfig,
};
use tunetrail_server::telemetry;
use tunetrail_state::CacheStore;

/// TuneTrail serving-plane HTTP server.
#[derive(Parser, Debug)]
#[command(name = "tunetrail-server", about = "HTTP API server for TuneTrail")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tunetrail.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from the TOML file, or use defaults if the file
    // does not exist.
    let config: TuneTrailConfig = if Path::new(&cli.config).exists() {
        let contents = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&contents)?
    } else {
        toml::from_str("")?
    };

    let telemetry_guard = telemetry::init(&config.telemetry);
    if !Path::new(&cli.config).exists() {
        info!(path = %cli.config, "config file not found, using defaults");
    }

    // Create the cache backend.
    let cache = create_cache(&config)?;

    // Create the repository backend.
    let repo = create_repository(&config).await?;

    // Create the engine client.
    let engine: Arc<dyn RecommendationEngine> = match config.engine.backend {
        EngineBackend::Http => {
            info!(endpoint = %config.engine.endpoint, "engine client: http");
            Arc::new(HttpEngine::new(&config.engine.endpoint).map_err(|e| e.to_string())?)
        }
        EngineBackend::Static => {
            warn!("engine client: static (dev mode, canned results)");
            Arc::new(StaticEngine::new(Vec::new()))
        }
    };

    // Assemble the gateway.
    let catalog = config.plans.clone().unwrap_or_else(PlanCatalog::builtin);
    let gateway = Arc::new(
        GatewayBuilder::new()
            .repo(Arc::clone(&repo))
            .cache(Arc::clone(&cache))
            .engine(engine)
            .catalog(catalog)
            .dispatcher_config(config.dispatcher.to_dispatcher_config())
            .idle_timeout(chrono::Duration::seconds(
                i64::try_from(config.sessions.idle_timeout_seconds).unwrap_or(900),
            ))
            .rotation_grace(chrono::Duration::hours(
                i64::try_from(config.keys.rotation_grace_hours).unwrap_or(24),
            ))
            .buffer_capacity(config.dispatcher.impression_buffer_capacity)
            .build()?,
    );

    // Spawn the background workers.
    let background_config = config
        .background
        .to_background_config(config.sessions.sweep_interval_seconds);
    let (usage_tx, usage_rx) = BackgroundWorkers::usage_channel(&background_config);
    let background = BackgroundWorkers::spawn(
        Arc::clone(&gateway.sessions),
        Arc::clone(&gateway.repo),
        Arc::clone(&gateway.impression_buffer),
        Arc::clone(&gateway.metrics),
        usage_rx,
        background_config,
    );

    // Build the auth service. The signing secret comes from the
    // environment, never the config file.
    let signing_secret = load_signing_secret(&config)?;
    let auth = Arc::new(AuthService::new(
        Arc::clone(&gateway.repo),
        Arc::clone(&gateway.cache),
        Arc::clone(&gateway.clock),
        Arc::clone(&gateway.ids),
        TokenManager::new(
            signing_secret.expose_secret(),
            config.auth.token_expiry_seconds,
        ),
    ));

    let state = AppState {
        gateway: Arc::clone(&gateway),
        auth,
        usage_tx,
        cors_origins: config.server.cors_origins.clone(),
        edition: config.server.edition.clone(),
    };
    let app = tunetrail_server::api::router(state);

    // Resolve the bind address (CLI overrides take precedence).
    let host = cli.host.unwrap_or(config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "tunetrail-server listening");

    // Serve with graceful shutdown on SIGINT / SIGTERM. Connect info feeds
    // the API-key IP allowlist checks.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain background queues within the shutdown budget.
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    info!(
        timeout_secs = config.server.shutdown_timeout_seconds,
        "draining background workers..."
    );
    if tokio::time::timeout(shutdown_timeout, background.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.server.shutdown_timeout_seconds,
            "shutdown timeout exceeded, some buffered telemetry may be lost"
        );
    }

    telemetry_guard.shutdown();
    info!("tunetrail-server shut down");
    Ok(())
}

/// Build the configured cache backend.
fn create_cache(config: &TuneTrailConfig) -> Result<Arc<dyn CacheStore>, String> {
    match config.cache.backend {
        CacheBackend::Memory => {
            info!("cache backend: memory");
            Ok(Arc::new(tunetrail_state_memory::MemoryCacheStore::new()))
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            let redis_config = config.cache.redis.clone().unwrap_or_default();
            let store = tunetrail_state_redis::RedisCacheStore::new(&redis_config)
                .map_err(|e| format!("failed to create redis cache: {e}"))?;
            info!(url = %redis_config.url, "cache backend: redis");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => {
            Err("this build does not include the redis backend (enable the `redis` feature)"
                .to_owned())
        }
    }
}

/// Build the configured repository backend.
async fn create_repository(config: &TuneTrailConfig) -> Result<Arc<dyn Repository>, String> {
    match config.repository.backend {
        RepositoryBackend::Memory => {
            warn!("repository backend: memory (data is lost on restart)");
            Ok(Arc::new(tunetrail_repo_memory::MemoryRepository::new()))
        }
        #[cfg(feature = "postgres")]
        RepositoryBackend::Postgres => {
            let pg_config = config.repository.postgres.clone().unwrap_or_default();
            let repo = tunetrail_repo_postgres::PostgresRepository::new(&pg_config)
                .await
                .map_err(|e| format!("failed to connect to postgres: {e}"))?;
            info!("repository backend: postgres");
            Ok(Arc::new(repo))
        }
        #[cfg(not(feature = "postgres"))]
        RepositoryBackend::Postgres => Err(
            "this build does not include the postgres backend (enable the `postgres` feature)"
                .to_owned(),
        ),
    }
}

/// Load the session-token signing secret from the configured environment
/// variable. Dev deployments on memory backends get a generated secret.
fn load_signing_secret(config: &TuneTrailConfig) -> Result<SecretString, String> {
    match std::env::var(&config.auth.signing_secret_env) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretString::from(value)),
        _ if config.repository.backend == RepositoryBackend::Memory => {
            warn!(
                env = %config.auth.signing_secret_env,
                "signing secret not set; generating an ephemeral one (sessions will not survive restarts)"
            );
            Ok(SecretString::from(uuid::Uuid::new_v4().to_string()))
        }
        _ => Err(format!(
            "the {} environment variable is required",
            config.auth.signing_secret_env
        )),
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
