use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tower::ServiceExt;

use tunetrail_core::{Clock, ManualClock, Track, TrackId};
use tunetrail_engine::{EngineTrack, RecommendationEngine, StaticEngine};
use tunetrail_gateway::{BackgroundConfig, BackgroundWorkers, GatewayBuilder};
use tunetrail_repo::Repository;
use tunetrail_repo_memory::MemoryRepository;
use tunetrail_server::api::AppState;
use tunetrail_server::auth::AuthService;
use tunetrail_server::auth::token::TokenManager;
use tunetrail_state::CacheStore;
use tunetrail_state_memory::MemoryCacheStore;

// -- Fixture --------------------------------------------------------------

struct Fixture {
    app: axum::Router,
    repo: Arc<MemoryRepository>,
    engine: Arc<StaticEngine>,
    clock: Arc<ManualClock>,
    gateway: Arc<tunetrail_gateway::Gateway>,
}

fn build_fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let repo = Arc::new(MemoryRepository::new());
    let cache = Arc::new(MemoryCacheStore::new());
    let engine = Arc::new(StaticEngine::new(vec![]));

    let gateway = Arc::new(
        GatewayBuilder::new()
            .repo(Arc::clone(&repo) as Arc<dyn Repository>)
            .cache(Arc::clone(&cache) as Arc<dyn CacheStore>)
            .engine(Arc::clone(&engine) as Arc<dyn RecommendationEngine>)
            .clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .build()
            .expect("gateway should build"),
    );

    let auth = Arc::new(AuthService::new(
        Arc::clone(&repo) as Arc<dyn Repository>,
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&gateway.ids),
        TokenManager::new("test-secret", 3_600),
    ));

    let (usage_tx, _usage_rx) = BackgroundWorkers::usage_channel(&BackgroundConfig::default());

    let state = AppState {
        gateway: Arc::clone(&gateway),
        auth,
        usage_tx,
        cors_origins: vec![],
        edition: "test".to_owned(),
    };

    Fixture {
        app: tunetrail_server::api::router(state),
        repo,
        engine,
        clock,
        gateway,
    }
}

async fn seed_catalog(repo: &MemoryRepository) {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    for (i, id) in ["T1", "T2", "T3"].iter().enumerate() {
        repo.upsert_track(&Track {
            id: TrackId::new(*id),
            title: format!("Track {id}"),
            artist: "Band".to_owned(),
            duration_ms: 200_000,
            created_at: base + ChronoDuration::days(i as i64),
        })
        .await
        .unwrap();
    }
}

// -- Request helpers ------------------------------------------------------

async fn send(
    app: &axum::Router,
    method: http::Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, http::HeaderMap, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, headers, json)
}

async fn register(app: &axum::Router, email: &str, slug: &str) -> String {
    let (status, _, body) = send(
        app,
        http::Method::POST,
        "/api/v1/auth/register",
        None,
        Some(serde_json::json!({
            "email": email,
            "password": "a-long-password",
            "org_slug": slug,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
    body["token"].as_str().unwrap().to_owned()
}

// -- Tests ----------------------------------------------------------------

#[tokio::test]
async fn healthz_returns_200() {
    let f = build_fixture();
    let (status, _, body) = send(&f.app, http::Method::GET, "/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["edition"], "test");
}

#[tokio::test]
async fn metrics_returns_counters() {
    let f = build_fixture();
    let (status, _, body) = send(&f.app, http::Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["gateway"].is_object());
    assert_eq!(body["impression_buffer"]["dropped"], 0);
}

#[tokio::test]
async fn missing_credential_is_401_with_stable_kind() {
    let f = build_fixture();
    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/recommendations",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "MALFORMED_CREDENTIAL");
}

#[tokio::test]
async fn register_login_me_roundtrip() {
    let f = build_fixture();
    let token = register(&f.app, "owner@example.com", "acme").await;

    let (status, headers, body) =
        send(&f.app, http::Method::GET, "/api/v1/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "free");
    assert_eq!(body["auth_method"], "session_token");

    // Advisory rate-limit headers ride on every authenticated response.
    assert!(headers.contains_key("x-ratelimit-limit"));
    assert!(headers.contains_key("x-ratelimit-remaining"));
    assert!(headers.contains_key("x-ratelimit-reset"));

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/auth/login",
        None,
        Some(serde_json::json!({
            "email": "OWNER@example.com",
            "password": "a-long-password",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    assert!(body["token"].is_string());
}

/// Scenario: cold personal recommendation on the free plan. Ties broken by
/// older track creation, three impressions captured with positions 1..3.
#[tokio::test]
async fn cold_personal_recommendation_free_plan() {
    let f = build_fixture();
    seed_catalog(&f.repo).await;
    f.engine.set_tracks(vec![
        EngineTrack {
            track_id: TrackId::new("T2"),
            score: 0.9,
            reason: None,
        },
        EngineTrack {
            track_id: TrackId::new("T1"),
            score: 0.9,
            reason: None,
        },
        EngineTrack {
            track_id: TrackId::new("T3"),
            score: 0.5,
            reason: None,
        },
    ]);

    let token = register(&f.app, "listener@example.com", "listeners").await;
    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/recommendations?limit=3",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "recommendation failed: {body}");

    let order: Vec<&str> = body["tracks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["track_id"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["T1", "T2", "T3"]);

    // One impression per returned track, positions 1..3.
    let buffered = f.gateway.impression_buffer.drain(10);
    assert_eq!(buffered.len(), 3);
    assert_eq!(buffered[0].position, 1);
    assert_eq!(buffered[0].track_id.as_str(), "T1");
    assert_eq!(buffered[2].position, 3);
}

/// Scenario: a free-plan caller hitting the daily mix gets 402 with the
/// upgrade path spelled out.
#[tokio::test]
async fn plan_gate_denies_daily_mix_on_free() {
    let f = build_fixture();
    let token = register(&f.app, "cheapskate@example.com", "cheap").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/ml/daily-mix",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "PLAN_UPGRADE_REQUIRED");
    assert_eq!(
        body["details"]["required_plans"],
        serde_json::json!(["starter", "pro", "enterprise"])
    );
    assert!(body["upgrade_url"].is_string());
}

/// Scenario: the audio-analysis day quota denies the 11th call with a
/// retry hint that reaches the next UTC midnight.
#[tokio::test]
async fn audio_analysis_quota_exhausts() {
    let f = build_fixture();
    seed_catalog(&f.repo).await;
    f.clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap());
    let token = register(&f.app, "analyst@example.com", "analysts").await;

    for n in 0..10 {
        let (status, _, body) = send(
            &f.app,
            http::Method::POST,
            "/api/v1/audio/analyze",
            Some(&token),
            Some(serde_json::json!({ "track_id": "T1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "call {n} failed: {body}");
    }

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/audio/analyze",
        Some(&token),
        Some(serde_json::json!({ "track_id": "T1" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "QUOTA_EXCEEDED");
    assert_eq!(body["retry_after"], 3_600);
}

/// Scenario: feedback closes the loop idempotently.
#[tokio::test]
async fn feedback_closes_the_loop() {
    let f = build_fixture();
    seed_catalog(&f.repo).await;
    f.engine.set_tracks(vec![EngineTrack {
        track_id: TrackId::new("T1"),
        score: 0.9,
        reason: None,
    }]);

    let token = register(&f.app, "fan@example.com", "fans").await;
    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/recommendations?limit=1",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rec_id = body["tracks"][0]["recommendation_id"]
        .as_str()
        .unwrap()
        .to_owned();

    // Persist the buffered impressions (the flusher's job in production).
    let buffered = f.gateway.impression_buffer.drain(10);
    f.repo.insert_impressions(&buffered).await.unwrap();

    let feedback = serde_json::json!({ "recommendation_id": rec_id, "signal": "played" });
    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/ml/recommendations/feedback",
        Some(&token),
        Some(feedback.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "feedback failed: {body}");
    assert_eq!(body["duplicate"], false);

    let imp = f
        .repo
        .impression_by_recommendation(&tunetrail_core::RecommendationId::new(rec_id.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(imp.played);
    assert_eq!(f.repo.interaction_count(), 1);

    // Resubmission: unchanged impression, no second interaction.
    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/ml/recommendations/feedback",
        Some(&token),
        Some(feedback),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(f.repo.interaction_count(), 1);
}

/// Scenario: key rotation keeps both secrets alive for the grace period.
#[tokio::test]
async fn key_rotation_grace_period() {
    let f = build_fixture();
    let token = register(&f.app, "dev@example.com", "devs").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/api-keys",
        Some(&token),
        Some(serde_json::json!({ "name": "ci" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "issue failed: {body}");
    let old_secret = body["secret"].as_str().unwrap().to_owned();
    let key_id = body["key"]["id"].as_str().unwrap().to_owned();
    assert!(old_secret.starts_with("tt_"));
    assert_eq!(old_secret.len(), 46);

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        &format!("/api/v1/api-keys/{key_id}/rotate"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "rotate failed: {body}");
    let new_secret = body["new_key"]["secret"].as_str().unwrap().to_owned();

    // Both keys authenticate inside the grace window.
    let (status, _, _) =
        send(&f.app, http::Method::GET, "/api/v1/auth/me", Some(&old_secret), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) =
        send(&f.app, http::Method::GET, "/api/v1/auth/me", Some(&new_secret), None).await;
    assert_eq!(status, StatusCode::OK);

    // After 24h only the replacement works.
    f.clock.advance(ChronoDuration::hours(25));
    let (status, _, body) =
        send(&f.app, http::Method::GET, "/api/v1/auth/me", Some(&old_secret), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "REVOKED_CREDENTIAL");
    let (status, _, _) =
        send(&f.app, http::Method::GET, "/api/v1/auth/me", Some(&new_secret), None).await;
    assert_eq!(status, StatusCode::OK);
}

/// Scenario: a session left idle past the timeout ends as "timeout" even
/// when the client calls End late; the call stays idempotent.
#[tokio::test]
async fn session_auto_expiry_and_idempotent_end() {
    let f = build_fixture();
    let token = register(&f.app, "walker@example.com", "walkers").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/sessions/start",
        Some(&token),
        Some(serde_json::json!({ "device_id": "phone-1", "device_type": "mobile" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "start failed: {body}");
    let session_id = body["id"].as_str().unwrap().to_owned();

    // 16 minutes of silence.
    f.clock.advance(ChronoDuration::minutes(16));

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        &format!("/api/v1/sessions/{session_id}/end"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ended_by"], "timeout");

    let (status, _, again) = send(
        &f.app,
        http::Method::POST,
        &format!("/api/v1/sessions/{session_id}/end"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["ended_at"], body["ended_at"]);
}

#[tokio::test]
async fn session_heartbeat_keeps_sessions_alive() {
    let f = build_fixture();
    let token = register(&f.app, "runner@example.com", "runners").await;

    let (_, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/sessions/start",
        Some(&token),
        Some(serde_json::json!({ "device_id": "watch-1", "device_type": "mobile" })),
    )
    .await;
    let session_id = body["id"].as_str().unwrap().to_owned();

    f.clock.advance(ChronoDuration::minutes(10));
    let (status, _, _) = send(
        &f.app,
        http::Method::PUT,
        &format!("/api/v1/sessions/{session_id}/heartbeat"),
        Some(&token),
        Some(serde_json::json!({ "position_ms": 42000, "current_track_id": "T1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Ten more minutes: still inside the timeout thanks to the heartbeat.
    f.clock.advance(ChronoDuration::minutes(10));
    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        &format!("/api/v1/sessions/{session_id}/end"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ended_by"], "user");
}

#[tokio::test]
async fn interactions_ingest_and_batch_stop_on_hard_error() {
    let f = build_fixture();
    seed_catalog(&f.repo).await;
    let token = register(&f.app, "clicker@example.com", "clickers").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/interactions",
        Some(&token),
        Some(serde_json::json!({
            "track_id": "T1",
            "type": "complete",
            "play_duration_ms": 100_000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "ingest failed: {body}");
    // Short "complete" downgraded on the way in.
    assert_eq!(body["type"], "play");
    assert_eq!(body["completion_override"], false);

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/interactions/batch",
        Some(&token),
        Some(serde_json::json!({
            "events": [
                { "track_id": "T1", "type": "play", "play_duration_ms": 1000 },
                { "track_id": "missing", "type": "play" },
                { "track_id": "T2", "type": "play" },
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["error"]["kind"], "NOT_FOUND");
}

#[tokio::test]
async fn api_key_scopes_are_enforced() {
    let f = build_fixture();
    let token = register(&f.app, "scoped@example.com", "scoped").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::POST,
        "/api/v1/api-keys",
        Some(&token),
        Some(serde_json::json!({
            "name": "read-only",
            "scopes": ["recommendations:read"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "issue failed: {body}");
    let secret = body["secret"].as_str().unwrap().to_owned();

    // The limited key cannot manage keys.
    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/api-keys",
        Some(&secret),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "SCOPE_INSUFFICIENT");
}

#[tokio::test]
async fn upstream_unavailable_without_stale_entry() {
    let f = build_fixture();
    seed_catalog(&f.repo).await;
    f.engine.set_failing(true);
    let token = register(&f.app, "unlucky@example.com", "unlucky").await;

    let (status, _, body) = send(
        &f.app,
        http::Method::GET,
        "/api/v1/recommendations?limit=3",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "UPSTREAM_UNAVAILABLE");
}
