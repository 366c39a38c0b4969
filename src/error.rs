// =============================================================================
// Error taxonomy for exchange calls and order processing
// =============================================================================
//
// Classification drives recovery: network errors retry with backoff, business
// rejections become durable FailedOrder rows, auth errors flag the account.
// =============================================================================

use axum::http::StatusCode;

/// Substrings that mark an exchange error message as a permanent rejection.
/// Retrying these wastes the rate budget and can never succeed.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "must be greater than minimum",
    "insufficient balance",
    "invalid api key",
    "permission denied",
    "amount too small",
    "precision",
    "invalid symbol",
    "notional must be no smaller",
    "Order would immediately trigger",
];

/// Error raised anywhere along the order path.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Bad credentials, expired token, missing hashkey.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller is authenticated but does not own the resource.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Request rejected before hitting the wire (unknown symbol, missing
    /// price on LIMIT, non-positive quantity, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Quantity below the exchange minimum; carries what an auto-adjust
    /// would have produced so callers can surface it.
    #[error("order below minimum: {0}")]
    MinNotional(String),

    /// Local rate budget exhausted even after waiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport failure or per-call timeout. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The exchange accepted the request and said no (insufficient balance,
    /// immediate-trigger stop, ...). Never retried.
    #[error("exchange rejected order: {0}")]
    Rejected(String),

    /// Cancel/fetch referenced an order the exchange no longer knows.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// The bound exchange has no such capability (e.g. user-data stream on
    /// an exchange without one).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Malformed or unexpected response body.
    #[error("failed to parse exchange response: {0}")]
    Parse(String),

    /// Database or other infrastructure failure; the request fails but the
    /// supervising loop keeps running.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Whether the retry loop may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(msg) | Self::RateLimited(msg) => {
                !message_is_non_retryable(msg)
            }
            _ => false,
        }
    }

    /// Classify a raw exchange error message. Rejections carrying one of the
    /// known permanent markers become `Rejected`; the rest stay `Network` so
    /// the retry/reconcile machinery picks them up.
    pub fn from_exchange_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if message_is_non_retryable(&msg) {
            Self::Rejected(msg)
        } else {
            Self::Network(msg)
        }
    }

    /// HTTP status for API responses surfacing this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Permission(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) | Self::MinNotional(_) => StatusCode::BAD_REQUEST,
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::Rejected(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unsupported(_) => StatusCode::BAD_REQUEST,
            Self::Network(_) | Self::Parse(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn message_is_non_retryable(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    NON_RETRYABLE_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Self::Network(format!("connection failed: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for ExchangeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        assert!(ExchangeError::Network("connection reset".into()).is_retryable());
        assert!(ExchangeError::RateLimited("window full".into()).is_retryable());
    }

    #[test]
    fn permanent_markers_are_not_retryable() {
        for marker in NON_RETRYABLE_MARKERS {
            let err = ExchangeError::from_exchange_message(format!("error: {marker}"));
            assert!(matches!(err, ExchangeError::Rejected(_)), "{marker}");
            assert!(!err.is_retryable(), "{marker}");
        }
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        let err = ExchangeError::from_exchange_message("INSUFFICIENT BALANCE for order");
        assert!(matches!(err, ExchangeError::Rejected(_)));
    }

    #[test]
    fn status_codes_align_with_failure_class() {
        assert_eq!(
            ExchangeError::Auth("bad key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ExchangeError::Validation("no price".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ExchangeError::OrderNotFound("42".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ExchangeError::Rejected("filled".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
