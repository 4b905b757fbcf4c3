use std::time::Duration;

use shot_guard::AcquireError;
use shot_guard::Reason;

/// Errors produced by the tower-guard middleware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// The request waited for admission longer than the configured timeout,
    /// or the inner service did not answer within what was left of it.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for admission")]
    Timeout,

    /// The request was rejected because the limiter is out of capacity for now.
    ///
    /// The duration indicates when the client should retry.
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// The limiter has no capacity and none will return with time alone.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Overloaded,

    /// The request costs more than the limiter could ever admit.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Request cost {requested} exceeds limiter capacity {limit}")]
    Oversized { requested: u64, limit: u64 },

    /// The circuit breaker rejected the request without calling the inner service.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The limiter was closed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Limiter closed")]
    Closed,
}

impl From<Reason> for GuardError {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::Overloaded { retry_after } => Self::RateLimited { retry_after },
            Reason::Exhausted => Self::Overloaded,
            Reason::Oversized { requested, limit } => Self::Oversized { requested, limit },
        }
    }
}

impl From<AcquireError> for GuardError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Closed => Self::Closed,
            AcquireError::Oversized { requested, limit } => Self::Oversized { requested, limit },
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GuardError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match self {
            Self::Overloaded | Self::CircuitOpen | Self::Closed => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), None)
            }
            Self::Timeout => (StatusCode::REQUEST_TIMEOUT, self.to_string(), None),
            Self::RateLimited { retry_after } => {
                // Round up so clients never retry early
                let mut secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 || secs == 0 {
                    secs += 1;
                }
                let val = axum::http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    self.to_string(),
                    Some((axum::http::header::RETRY_AFTER, val)),
                )
            }
            Self::Oversized { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), None),
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
