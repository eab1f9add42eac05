use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use tower::{Layer, Service};

use tunetrail_core::{ApiError, ErrorKind};

use crate::error::envelope;

use super::{AuthService, Verified};

/// Tower layer that authenticates requests and injects the [`Verified`]
/// identity as a request extension.
#[derive(Clone)]
pub struct AuthLayer {
    auth: Arc<AuthService>,
}

impl AuthLayer {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            auth: Arc::clone(&self.auth),
        }
    }
}

/// Tower service that authenticates requests.
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    auth: Arc<AuthService>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = Arc::clone(&self.auth);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bearer = req
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(str::to_owned);

            let Some(bearer) = bearer else {
                return Ok(envelope(&ApiError::new(
                    ErrorKind::MalformedCredential,
                    "missing bearer credential",
                )));
            };

            let remote_ip = client_ip(&req);
            match auth.verify(&bearer, remote_ip.as_deref()).await {
                Ok(verified) => {
                    req.extensions_mut().insert::<Verified>(verified);
                    inner.call(req).await
                }
                Err(e) => Ok(envelope(&e)),
            }
        })
    }
}

/// Best-effort caller address: `X-Forwarded-For` (first hop) when present,
/// otherwise the socket peer address.
fn client_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
    {
        let first = forwarded.split(',').next().map(str::trim);
        if let Some(ip) = first
            && !ip.is_empty()
        {
            return Some(ip.to_owned());
        }
    }

    req.extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}
