use sqlx::PgPool;

/// Run database migrations, creating required tables if they do not exist.
///
/// Cascade deletes are enforced in the schema: removing an organization
/// removes its users and everything they own.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            plan TEXT NOT NULL,
            max_users BIGINT,
            max_tracks BIGINT,
            feature_overrides TEXT NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
            email TEXT NOT NULL UNIQUE,
            username TEXT UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            is_active BOOLEAN NOT NULL,
            email_verified BOOLEAN NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            owner_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            org_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            hash TEXT NOT NULL,
            prefix TEXT NOT NULL,
            scopes TEXT NOT NULL,
            environment TEXT NOT NULL,
            limits TEXT NOT NULL,
            expires_at TIMESTAMPTZ,
            revoked_at TIMESTAMPTZ,
            last_used_at TIMESTAMPTZ,
            ip_allowlist TEXT,
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS api_keys_prefix_idx ON api_keys (prefix)",
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL,
            device_type TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            last_heartbeat_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            ended_by TEXT,
            position_ms BIGINT,
            current_track_id TEXT,
            client_context TEXT NOT NULL DEFAULT '{}',
            summary TEXT
        )",
        "CREATE INDEX IF NOT EXISTS sessions_user_device_idx ON sessions (user_id, device_id)",
        "CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            track_id TEXT NOT NULL,
            session_id TEXT,
            kind TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            play_duration_ms BIGINT,
            position_ms BIGINT,
            source TEXT NOT NULL,
            source_id TEXT,
            recommendation_id TEXT,
            device_type TEXT NOT NULL,
            skip_reason TEXT,
            mood TEXT,
            activity TEXT,
            completion_override BOOLEAN,
            extensions TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE INDEX IF NOT EXISTS interactions_session_idx ON interactions (session_id, created_at)",
        "CREATE TABLE IF NOT EXISTS impressions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            track_id TEXT NOT NULL,
            recommendation_id TEXT NOT NULL UNIQUE,
            model_type TEXT NOT NULL,
            model_version TEXT NOT NULL,
            score DOUBLE PRECISION NOT NULL,
            position INTEGER NOT NULL,
            context TEXT NOT NULL,
            shown_at TIMESTAMPTZ NOT NULL,
            clicked BOOLEAN NOT NULL DEFAULT FALSE,
            played BOOLEAN NOT NULL DEFAULT FALSE,
            liked BOOLEAN NOT NULL DEFAULT FALSE
        )",
        "CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            duration_ms BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS api_key_usage (
            seq BIGSERIAL PRIMARY KEY,
            key_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            status INTEGER NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS api_key_usage_key_idx ON api_key_usage (key_id, occurred_at)",
        "CREATE TABLE IF NOT EXISTS search_queries (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            query TEXT NOT NULL,
            results_count INTEGER NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            extensions TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS content_views (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            content_type TEXT NOT NULL,
            content_id TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            extensions TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS player_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_id TEXT,
            event TEXT NOT NULL,
            track_id TEXT,
            position_ms BIGINT,
            created_at TIMESTAMPTZ NOT NULL,
            extensions TEXT NOT NULL DEFAULT '{}'
        )",
    ];

    for ddl in statements {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
