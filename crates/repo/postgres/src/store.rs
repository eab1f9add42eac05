use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use tunetrail_core::{
    ApiKey, ApiKeyId, ApiKeyUsageRecord, ContentView, EndedBy, Impression, Interaction, OrgId,
    Organization, Plan, PlayerEvent, RecommendationId, SearchQuery, Session, SessionId,
    SessionSummary, Track, TrackId, User, UserId,
};
use tunetrail_repo::{ImpressionFlags, RepoError, Repository};

use crate::codec::{enum_from_str, enum_to_str, json_from_text, json_to_text};
use crate::config::PostgresConfig;
use crate::migrations;

/// PostgreSQL-backed implementation of [`Repository`].
///
/// Uses `sqlx::PgPool` for connection pooling. Enum columns are TEXT in
/// their serde form; open-ended blobs (`extensions`, `client_context`,
/// scopes) are JSON TEXT.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect, create the pool, and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Connection`] if pool creation fails, or
    /// [`RepoError::Backend`] if migrations fail.
    pub async fn new(config: &PostgresConfig) -> Result<Self, RepoError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await
            .map_err(|e| RepoError::Connection(e.to_string()))?;

        migrations::run_migrations(&pool)
            .await
            .map_err(|e| RepoError::Backend(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create a repository from an existing pool. Runs migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, RepoError> {
        migrations::run_migrations(&pool)
            .await
            .map_err(|e| RepoError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}

/// Map a sqlx error, turning unique violations into [`RepoError::Conflict`].
fn map_sqlx_err(e: sqlx::Error) -> RepoError {
    if let sqlx::Error::Database(ref db) = e
        && db.code().as_deref() == Some("23505")
    {
        return RepoError::Conflict(db.message().to_owned());
    }
    RepoError::Backend(e.to_string())
}

fn get_str(row: &PgRow, col: &str) -> Result<String, RepoError> {
    row.try_get::<String, _>(col)
        .map_err(|e| RepoError::Backend(e.to_string()))
}

fn get_opt_str(row: &PgRow, col: &str) -> Result<Option<String>, RepoError> {
    row.try_get::<Option<String>, _>(col)
        .map_err(|e| RepoError::Backend(e.to_string()))
}

fn get_opt_u64(row: &PgRow, col: &str) -> Result<Option<u64>, RepoError> {
    let v: Option<i64> = row
        .try_get(col)
        .map_err(|e| RepoError::Backend(e.to_string()))?;
    Ok(v.and_then(|n| u64::try_from(n).ok()))
}

fn row_to_org(row: &PgRow) -> Result<Organization, RepoError> {
    Ok(Organization {
        id: OrgId::new(get_str(row, "id")?),
        slug: get_str(row, "slug")?,
        plan: enum_from_str::<Plan>(&get_str(row, "plan")?)?,
        max_users: row
            .try_get::<Option<i64>, _>("max_users")
            .map_err(|e| RepoError::Backend(e.to_string()))?
            .and_then(|n| u32::try_from(n).ok()),
        max_tracks: get_opt_u64(row, "max_tracks")?,
        feature_overrides: json_from_text(&get_str(row, "feature_overrides")?)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
    })
}

fn row_to_user(row: &PgRow) -> Result<User, RepoError> {
    Ok(User {
        id: UserId::new(get_str(row, "id")?),
        org_id: OrgId::new(get_str(row, "org_id")?),
        email: get_str(row, "email")?,
        username: get_opt_str(row, "username")?,
        password_hash: get_str(row, "password_hash")?,
        role: enum_from_str(&get_str(row, "role")?)?,
        is_active: row
            .try_get("is_active")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        email_verified: row
            .try_get("email_verified")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
    })
}

fn row_to_api_key(row: &PgRow) -> Result<ApiKey, RepoError> {
    let ip_allowlist = match get_opt_str(row, "ip_allowlist")? {
        Some(text) => Some(json_from_text(&text)?),
        None => None,
    };
    Ok(ApiKey {
        id: ApiKeyId::new(get_str(row, "id")?),
        owner_user_id: UserId::new(get_str(row, "owner_user_id")?),
        org_id: OrgId::new(get_str(row, "org_id")?),
        name: get_str(row, "name")?,
        hash: get_str(row, "hash")?,
        prefix: get_str(row, "prefix")?,
        scopes: json_from_text(&get_str(row, "scopes")?)?,
        environment: enum_from_str(&get_str(row, "environment")?)?,
        limits: json_from_text(&get_str(row, "limits")?)?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        revoked_at: row
            .try_get("revoked_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        last_used_at: row
            .try_get("last_used_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        ip_allowlist,
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
    })
}

fn row_to_session(row: &PgRow) -> Result<Session, RepoError> {
    let ended_by = match get_opt_str(row, "ended_by")? {
        Some(s) => Some(enum_from_str::<EndedBy>(&s)?),
        None => None,
    };
    let summary = match get_opt_str(row, "summary")? {
        Some(text) => Some(json_from_text::<SessionSummary>(&text)?),
        None => None,
    };
    Ok(Session {
        id: SessionId::new(get_str(row, "id")?),
        user_id: UserId::new(get_str(row, "user_id")?),
        device_id: get_str(row, "device_id")?.into(),
        device_type: enum_from_str(&get_str(row, "device_type")?)?,
        started_at: row
            .try_get("started_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        last_heartbeat_at: row
            .try_get("last_heartbeat_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        ended_at: row
            .try_get("ended_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        ended_by,
        position_ms: get_opt_u64(row, "position_ms")?,
        current_track_id: get_opt_str(row, "current_track_id")?.map(TrackId::new),
        client_context: json_from_text(&get_str(row, "client_context")?)?,
        summary,
    })
}

fn row_to_interaction(row: &PgRow) -> Result<Interaction, RepoError> {
    Ok(Interaction {
        id: get_str(row, "id")?,
        user_id: UserId::new(get_str(row, "user_id")?),
        track_id: TrackId::new(get_str(row, "track_id")?),
        session_id: get_opt_str(row, "session_id")?.map(SessionId::new),
        kind: enum_from_str(&get_str(row, "kind")?)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        play_duration_ms: get_opt_u64(row, "play_duration_ms")?,
        position_ms: get_opt_u64(row, "position_ms")?,
        source: enum_from_str(&get_str(row, "source")?)?,
        source_id: get_opt_str(row, "source_id")?,
        recommendation_id: get_opt_str(row, "recommendation_id")?.map(RecommendationId::new),
        device_type: enum_from_str(&get_str(row, "device_type")?)?,
        skip_reason: get_opt_str(row, "skip_reason")?,
        mood: get_opt_str(row, "mood")?,
        activity: get_opt_str(row, "activity")?,
        completion_override: row
            .try_get("completion_override")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        extensions: json_from_text(&get_str(row, "extensions")?)?,
    })
}

fn row_to_impression(row: &PgRow) -> Result<Impression, RepoError> {
    Ok(Impression {
        id: get_str(row, "id")?,
        user_id: UserId::new(get_str(row, "user_id")?),
        track_id: TrackId::new(get_str(row, "track_id")?),
        recommendation_id: RecommendationId::new(get_str(row, "recommendation_id")?),
        model_type: get_str(row, "model_type")?,
        model_version: get_str(row, "model_version")?,
        score: row
            .try_get("score")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        position: row
            .try_get::<i32, _>("position")
            .map_err(|e| RepoError::Backend(e.to_string()))
            .map(|n| u32::try_from(n).unwrap_or(0))?,
        context: get_str(row, "context")?,
        shown_at: row
            .try_get("shown_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        clicked: row
            .try_get("clicked")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        played: row
            .try_get("played")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
        liked: row
            .try_get("liked")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
    })
}

fn row_to_track(row: &PgRow) -> Result<Track, RepoError> {
    Ok(Track {
        id: TrackId::new(get_str(row, "id")?),
        title: get_str(row, "title")?,
        artist: get_str(row, "artist")?,
        duration_ms: get_opt_u64(row, "duration_ms")?.unwrap_or(0),
        created_at: row
            .try_get("created_at")
            .map_err(|e| RepoError::Backend(e.to_string()))?,
    })
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_organization(&self, org: &Organization) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO organizations
                (id, slug, plan, max_users, max_tracks, feature_overrides, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(org.id.as_str())
        .bind(&org.slug)
        .bind(enum_to_str(&org.plan)?)
        .bind(org.max_users.map(i64::from))
        .bind(org.max_tracks.and_then(|n| i64::try_from(n).ok()))
        .bind(json_to_text(&org.feature_overrides)?)
        .bind(org.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn organization_by_id(&self, id: &OrgId) -> Result<Option<Organization>, RepoError> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn organization_by_slug(&self, slug: &str) -> Result<Option<Organization>, RepoError> {
        let row = sqlx::query("SELECT * FROM organizations WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn update_organization_plan(&self, id: &OrgId, plan: Plan) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE organizations SET plan = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(enum_to_str(&plan)?)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_organization(&self, id: &OrgId) -> Result<bool, RepoError> {
        // Descendant rows go with the org via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_user(&self, user: &User) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO users
                (id, org_id, email, username, password_hash, role, is_active,
                 email_verified, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(user.id.as_str())
        .bind(user.org_id.as_str())
        .bind(&user.email)
        .bind(user.username.as_deref())
        .bind(&user.password_hash)
        .bind(enum_to_str(&user.role)?)
        .bind(user.is_active)
        .bind(user.email_verified)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn user_by_id(&self, id: &UserId) -> Result<Option<User>, RepoError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), RepoError> {
        let ip_allowlist = key
            .ip_allowlist
            .as_ref()
            .map(json_to_text)
            .transpose()?;
        sqlx::query(
            "INSERT INTO api_keys
                (id, owner_user_id, org_id, name, hash, prefix, scopes, environment,
                 limits, expires_at, revoked_at, last_used_at, ip_allowlist, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(key.id.as_str())
        .bind(key.owner_user_id.as_str())
        .bind(key.org_id.as_str())
        .bind(&key.name)
        .bind(&key.hash)
        .bind(&key.prefix)
        .bind(json_to_text(&key.scopes)?)
        .bind(enum_to_str(&key.environment)?)
        .bind(json_to_text(&key.limits)?)
        .bind(key.expires_at)
        .bind(key.revoked_at)
        .bind(key.last_used_at)
        .bind(ip_allowlist)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn api_key_by_id(&self, id: &ApiKeyId) -> Result<Option<ApiKey>, RepoError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_api_key).transpose()
    }

    async fn api_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>, RepoError> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE prefix = $1")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter().map(row_to_api_key).collect()
    }

    async fn api_keys_for_user(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError> {
        let rows =
            sqlx::query("SELECT * FROM api_keys WHERE owner_user_id = $1 ORDER BY created_at")
                .bind(user_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        rows.iter().map(row_to_api_key).collect()
    }

    async fn set_api_key_revoked_at(
        &self,
        id: &ApiKeyId,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE api_keys SET revoked_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(revoked_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_api_key_last_used(
        &self,
        id: &ApiKeyId,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn append_key_usage(&self, record: &ApiKeyUsageRecord) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO api_key_usage (key_id, endpoint, status, occurred_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(record.key_id.as_str())
        .bind(&record.endpoint)
        .bind(i32::from(record.status))
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn key_usage_since(
        &self,
        id: &ApiKeyId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiKeyUsageRecord>, RepoError> {
        let rows = sqlx::query(
            "SELECT key_id, endpoint, status, occurred_at FROM api_key_usage
             WHERE key_id = $1 AND occurred_at >= $2 ORDER BY occurred_at",
        )
        .bind(id.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter()
            .map(|row| {
                Ok(ApiKeyUsageRecord {
                    key_id: ApiKeyId::new(get_str(row, "key_id")?),
                    endpoint: get_str(row, "endpoint")?,
                    status: row
                        .try_get::<i32, _>("status")
                        .map_err(|e| RepoError::Backend(e.to_string()))
                        .map(|n| u16::try_from(n).unwrap_or(0))?,
                    occurred_at: row
                        .try_get("occurred_at")
                        .map_err(|e| RepoError::Backend(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn insert_session(&self, session: &Session) -> Result<(), RepoError> {
        let summary = session.summary.as_ref().map(json_to_text).transpose()?;
        sqlx::query(
            "INSERT INTO sessions
                (id, user_id, device_id, device_type, started_at, last_heartbeat_at,
                 ended_at, ended_by, position_ms, current_track_id, client_context, summary)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(session.id.as_str())
        .bind(session.user_id.as_str())
        .bind(session.device_id.as_str())
        .bind(enum_to_str(&session.device_type)?)
        .bind(session.started_at)
        .bind(session.last_heartbeat_at)
        .bind(session.ended_at)
        .bind(
            session
                .ended_by
                .as_ref()
                .map(enum_to_str)
                .transpose()?,
        )
        .bind(session.position_ms.and_then(|n| i64::try_from(n).ok()))
        .bind(session.current_track_id.as_ref().map(TrackId::as_str))
        .bind(json_to_text(&session.client_context)?)
        .bind(summary)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn session_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepoError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn record_heartbeat(
        &self,
        id: &SessionId,
        at: DateTime<Utc>,
        position_ms: Option<u64>,
        current_track_id: Option<TrackId>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE sessions SET
                last_heartbeat_at = $2,
                position_ms = COALESCE($3, position_ms),
                current_track_id = COALESCE($4, current_track_id)
             WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(id.as_str())
        .bind(at)
        .bind(position_ms.and_then(|n| i64::try_from(n).ok()))
        .bind(current_track_id.as_ref().map(TrackId::as_str))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn finalize_session(
        &self,
        id: &SessionId,
        ended_at: DateTime<Utc>,
        ended_by: EndedBy,
        summary: SessionSummary,
    ) -> Result<bool, RepoError> {
        // The `ended_at IS NULL` predicate is the exactly-once guard.
        let result = sqlx::query(
            "UPDATE sessions SET ended_at = $2, ended_by = $3, summary = $4
             WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(id.as_str())
        .bind(ended_at)
        .bind(enum_to_str(&ended_by)?)
        .bind(json_to_text(&summary)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO interactions
                (id, user_id, track_id, session_id, kind, created_at, play_duration_ms,
                 position_ms, source, source_id, recommendation_id, device_type,
                 skip_reason, mood, activity, completion_override, extensions)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                     $16, $17)",
        )
        .bind(&interaction.id)
        .bind(interaction.user_id.as_str())
        .bind(interaction.track_id.as_str())
        .bind(interaction.session_id.as_ref().map(SessionId::as_str))
        .bind(enum_to_str(&interaction.kind)?)
        .bind(interaction.created_at)
        .bind(
            interaction
                .play_duration_ms
                .and_then(|n| i64::try_from(n).ok()),
        )
        .bind(interaction.position_ms.and_then(|n| i64::try_from(n).ok()))
        .bind(enum_to_str(&interaction.source)?)
        .bind(interaction.source_id.as_deref())
        .bind(
            interaction
                .recommendation_id
                .as_ref()
                .map(RecommendationId::as_str),
        )
        .bind(enum_to_str(&interaction.device_type)?)
        .bind(interaction.skip_reason.as_deref())
        .bind(interaction.mood.as_deref())
        .bind(interaction.activity.as_deref())
        .bind(interaction.completion_override)
        .bind(json_to_text(&interaction.extensions)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn interactions_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Interaction>, RepoError> {
        let rows =
            sqlx::query("SELECT * FROM interactions WHERE session_id = $1 ORDER BY created_at")
                .bind(session_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        rows.iter().map(row_to_interaction).collect()
    }

    async fn insert_impressions(&self, impressions: &[Impression]) -> Result<(), RepoError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::Backend(e.to_string()))?;

        for imp in impressions {
            sqlx::query(
                "INSERT INTO impressions
                    (id, user_id, track_id, recommendation_id, model_type, model_version,
                     score, position, context, shown_at, clicked, played, liked)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (recommendation_id) DO NOTHING",
            )
            .bind(&imp.id)
            .bind(imp.user_id.as_str())
            .bind(imp.track_id.as_str())
            .bind(imp.recommendation_id.as_str())
            .bind(&imp.model_type)
            .bind(&imp.model_version)
            .bind(imp.score)
            .bind(i32::try_from(imp.position).unwrap_or(i32::MAX))
            .bind(&imp.context)
            .bind(imp.shown_at)
            .bind(imp.clicked)
            .bind(imp.played)
            .bind(imp.liked)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit()
            .await
            .map_err(|e| RepoError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn impression_by_recommendation(
        &self,
        recommendation_id: &RecommendationId,
    ) -> Result<Option<Impression>, RepoError> {
        let row = sqlx::query("SELECT * FROM impressions WHERE recommendation_id = $1")
            .bind(recommendation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_impression).transpose()
    }

    async fn mark_impression_flags(
        &self,
        recommendation_id: &RecommendationId,
        flags: ImpressionFlags,
    ) -> Result<bool, RepoError> {
        // Set-true-once: the WHERE clause only matches when at least one
        // requested flag is still unset, so repeats report no change.
        let result = sqlx::query(
            "UPDATE impressions SET
                clicked = clicked OR $2,
                played = played OR $3,
                liked = liked OR $4
             WHERE recommendation_id = $1
               AND (($2 AND NOT clicked) OR ($3 AND NOT played) OR ($4 AND NOT liked))",
        )
        .bind(recommendation_id.as_str())
        .bind(flags.clicked)
        .bind(flags.played)
        .bind(flags.liked)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_track(&self, track: &Track) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO tracks (id, title, artist, duration_ms, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                artist = EXCLUDED.artist,
                duration_ms = EXCLUDED.duration_ms",
        )
        .bind(track.id.as_str())
        .bind(&track.title)
        .bind(&track.artist)
        .bind(i64::try_from(track.duration_ms).unwrap_or(i64::MAX))
        .bind(track.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn track_by_id(&self, id: &TrackId) -> Result<Option<Track>, RepoError> {
        let row = sqlx::query("SELECT * FROM tracks WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.as_ref().map(row_to_track).transpose()
    }

    async fn append_search_query(&self, record: &SearchQuery) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO search_queries (id, user_id, query, results_count, created_at, extensions)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.id)
        .bind(record.user_id.as_str())
        .bind(&record.query)
        .bind(i32::try_from(record.results_count).unwrap_or(i32::MAX))
        .bind(record.created_at)
        .bind(json_to_text(&record.extensions)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn append_content_view(&self, record: &ContentView) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO content_views (id, user_id, content_type, content_id, created_at, extensions)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.id)
        .bind(record.user_id.as_str())
        .bind(&record.content_type)
        .bind(&record.content_id)
        .bind(record.created_at)
        .bind(json_to_text(&record.extensions)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn append_player_event(&self, record: &PlayerEvent) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO player_events
                (id, user_id, session_id, event, track_id, position_ms, created_at, extensions)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.id)
        .bind(record.user_id.as_str())
        .bind(record.session_id.as_ref().map(SessionId::as_str))
        .bind(&record.event)
        .bind(record.track_id.as_ref().map(TrackId::as_str))
        .bind(record.position_ms.and_then(|n| i64::try_from(n).ok()))
        .bind(record.created_at)
        .bind(json_to_text(&record.extensions)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;

    async fn test_repo() -> PostgresRepository {
        let config = PostgresConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tunetrail_test".to_owned()),
            ..PostgresConfig::default()
        };
        PostgresRepository::new(&config)
            .await
            .expect("repository should connect")
    }

    #[tokio::test]
    async fn track_upsert_roundtrip() {
        let repo = test_repo().await;
        let id = TrackId::new(format!("trk-{}", uuid::Uuid::new_v4()));
        let track = Track {
            id: id.clone(),
            title: "Song".to_owned(),
            artist: "Band".to_owned(),
            duration_ms: 180_000,
            created_at: Utc::now(),
        };
        repo.upsert_track(&track).await.unwrap();
        let back = repo.track_by_id(&id).await.unwrap().unwrap();
        assert_eq!(back.duration_ms, 180_000);
    }
}
