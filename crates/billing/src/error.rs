//! Billing error types

use crate::webhooks::VerificationError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Storage could not be reached or rejected the operation.
    /// Never folded into "no data" so outages do not read as exhausted quota.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid subscription ID: {0}")]
    InvalidSubscriptionId(String),

    #[error("Checkout session was created without a redirect URL")]
    MissingCheckoutUrl,

    #[error("Webhook verification failed: {0}")]
    WebhookVerification(#[from] VerificationError),

    #[error("Webhook event {0} does not reference a user")]
    MissingUserReference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// True when the failure is a backend outage rather than a business outcome
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BillingError::StorageUnavailable(_) | BillingError::StripeApi(_)
        )
    }
}

impl From<quotabot_shared::ConfigError> for BillingError {
    fn from(err: quotabot_shared::ConfigError) -> Self {
        BillingError::Config(err.to_string())
    }
}
