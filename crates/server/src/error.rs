use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use tunetrail_core::{ApiError, ErrorKind};
use tunetrail_gateway::GatewayError;

/// Errors that can occur when running the TuneTrail server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A gateway-level error surfaced through the API.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// A client-visible error with a stable kind.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ServerError {
    /// Shorthand for a client-visible error.
    #[must_use]
    pub fn api(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Api(ApiError::new(kind, message))
    }
}

/// Build the wire error envelope: `{error, message, details?, retry_after?,
/// upgrade_url?}` with the status mapped from the kind.
#[must_use]
pub fn envelope(err: &ApiError) -> Response {
    let status =
        StatusCode::from_u16(err.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut body = serde_json::json!({
        "error": err.kind.as_str(),
        "message": err.message,
    });
    if let Some(ref details) = err.details {
        body["details"] = details.clone();
    }
    if let Some(retry_after) = err.retry_after {
        body["retry_after"] = retry_after.into();
    }
    if let Some(ref upgrade_url) = err.upgrade_url {
        body["upgrade_url"] = upgrade_url.clone().into();
    }

    let mut response = (status, Json(body)).into_response();
    if let Some(retry_after) = err.retry_after {
        response
            .headers_mut()
            .insert(axum::http::header::RETRY_AFTER, retry_after.into());
    }
    response
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::Api(api) => envelope(&api),
            Self::Gateway(GatewayError::Api(api)) => envelope(&api),
            Self::Gateway(e) => {
                // Infrastructure failures surface as an opaque INTERNAL;
                // the cause stays in the logs with the request span.
                error!(error = %e, "request failed on an internal error");
                envelope(&ApiError::new(
                    ErrorKind::Internal,
                    "an internal error occurred",
                ))
            }
            Self::Config(msg) => {
                error!(error = %msg, "request failed on a configuration error");
                envelope(&ApiError::new(
                    ErrorKind::Internal,
                    "an internal error occurred",
                ))
            }
            Self::Io(e) => {
                error!(error = %e, "request failed on an io error");
                envelope(&ApiError::new(
                    ErrorKind::Internal,
                    "an internal error occurred",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_and_retry_after() {
        let err = ApiError::new(ErrorKind::QuotaExceeded, "slow down").with_retry_after(30);
        let response = envelope(&err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(axum::http::header::RETRY_AFTER)
                .unwrap(),
            "30"
        );
    }

    #[test]
    fn internal_errors_are_opaque() {
        let err = ServerError::Config("secret path leaked".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
