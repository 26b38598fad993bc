//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quotabot_billing::{BillingError, VerificationError};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("monthly quota exhausted")]
    QuotaExceeded,

    #[error("billing is not configured")]
    ServiceUnavailable,

    /// Stripe or another upstream failed; the request may be retried later
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::StorageUnavailable(e) => ApiError::Database(e.to_string()),
            BillingError::StripeApi(msg) => ApiError::Upstream(msg),
            BillingError::SubscriptionNotFound(id) => {
                ApiError::NotFound(format!("subscription {}", id))
            }
            BillingError::InvalidSubscriptionId(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookVerification(e) => ApiError::from(e),
            BillingError::MissingUserReference(event_id) => {
                ApiError::BadRequest(format!("event {} names no user", event_id))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<VerificationError> for ApiError {
    fn from(err: VerificationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Storage and internal details stay in the logs
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                "internal server error".to_string()
            }
            ApiError::Upstream(detail) => {
                tracing::warn!(error = %detail, "Upstream request failed");
                "payment provider unavailable".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
