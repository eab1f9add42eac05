//! Per-request rate limiting and API-key usage accounting.
//!
//! Runs inside the auth layer, so the verified identity is available. Every
//! authenticated response carries `X-RateLimit-Limit`, `-Remaining`, and
//! `-Reset` for the most-constrained active window; denials are 429 with
//! `retry_after`. Key usage events leave the request path through a bounded
//! channel consumed by the background writer.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::response::Response;
use tower::{Layer, Service};
use tracing::warn;

use tunetrail_core::{ApiError, ErrorKind};
use tunetrail_gateway::{Gateway, GatewayError, RateLimitAdvisory, UsageEvent};

use crate::auth::Verified;
use crate::error::envelope;

/// Tower layer applying the generic per-request quota windows.
#[derive(Clone)]
pub struct RateLimitLayer {
    gateway: Arc<Gateway>,
    usage_tx: tokio::sync::mpsc::Sender<UsageEvent>,
}

impl RateLimitLayer {
    pub fn new(gateway: Arc<Gateway>, usage_tx: tokio::sync::mpsc::Sender<UsageEvent>) -> Self {
        Self { gateway, usage_tx }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            gateway: Arc::clone(&self.gateway),
            usage_tx: self.usage_tx.clone(),
        }
    }
}

/// Tower service enforcing the `api_calls` windows and per-key limits.
#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    gateway: Arc<Gateway>,
    usage_tx: tokio::sync::mpsc::Sender<UsageEvent>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        let usage_tx = self.usage_tx.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(verified) = req.extensions().get::<Verified>().cloned() else {
                // The auth layer always runs first; a missing identity is a
                // wiring bug, not a caller mistake.
                warn!("rate limit layer saw an unauthenticated request");
                return inner.call(req).await;
            };

            let endpoint = req.uri().path().to_owned();

            let advisory = match gateway
                .gate
                .check_api_request(&verified.principal, verified.api_key.as_deref())
                .await
            {
                Ok(advisory) => advisory,
                Err(GatewayError::Api(api)) => {
                    let now = gateway.clock.now();
                    let mut response = envelope(&api);
                    apply_denial_headers(&mut response, &api, now);
                    record_usage(&usage_tx, &verified, &endpoint, response.status().as_u16(), now);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(error = %e, "rate limit check failed, allowing request");
                    None
                }
            };

            let mut response = inner.call(req).await?;
            if let Some(advisory) = advisory {
                apply_advisory_headers(&mut response, advisory);
            }
            let now = gateway.clock.now();
            record_usage(&usage_tx, &verified, &endpoint, response.status().as_u16(), now);
            Ok(response)
        })
    }
}

fn apply_advisory_headers(response: &mut Response, advisory: RateLimitAdvisory) {
    let headers = response.headers_mut();
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from(advisory.limit),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from(advisory.remaining),
    );
    headers.insert("x-ratelimit-reset", HeaderValue::from(advisory.reset));
}

/// On a denial the remaining budget is zero and the reset equals the
/// retry hint.
fn apply_denial_headers(
    response: &mut Response,
    api: &ApiError,
    now: chrono::DateTime<chrono::Utc>,
) {
    if api.kind != ErrorKind::QuotaExceeded {
        return;
    }
    let limit = api
        .details
        .as_ref()
        .and_then(|d| d.get("limit"))
        .and_then(serde_json::Value::as_u64);

    let headers = response.headers_mut();
    if let Some(limit) = limit {
        headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    }
    headers.insert("x-ratelimit-remaining", HeaderValue::from(0u64));
    if let Some(retry_after) = api.retry_after {
        let reset = now.timestamp() + i64::try_from(retry_after).unwrap_or(0);
        headers.insert("x-ratelimit-reset", HeaderValue::from(reset));
    }
}

/// Ship a usage event without blocking the response; a full channel drops
/// the event.
fn record_usage(
    usage_tx: &tokio::sync::mpsc::Sender<UsageEvent>,
    verified: &Verified,
    endpoint: &str,
    status: u16,
    now: chrono::DateTime<chrono::Utc>,
) {
    let Some(ref key) = verified.api_key else {
        return;
    };
    let event = UsageEvent {
        key_id: key.id.clone(),
        endpoint: endpoint.to_owned(),
        status,
        occurred_at: now,
        touch_last_used: true,
    };
    if usage_tx.try_send(event).is_err() {
        warn!("usage channel full, dropping key usage event");
    }
}
