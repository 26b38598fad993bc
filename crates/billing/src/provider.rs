//! Payment provider seam
//!
//! Everything the billing crate needs from Stripe goes through
//! [`PaymentProvider`], so quota and webhook logic can be exercised without
//! network access.

#[cfg(any(test, feature = "test-support"))]
mod fake_provider;
mod stripe_provider;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;

#[cfg(any(test, feature = "test-support"))]
pub use fake_provider::*;
pub use stripe_provider::*;

/// Metadata key carrying the user id on sessions and subscriptions
pub const USER_ID_METADATA_KEY: &str = "user_id";

#[derive(Debug, Clone, Copy)]
pub struct CheckoutRequest<'a> {
    pub user_id: &'a str,
    pub price_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
}

/// A hosted checkout page the user is redirected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedCheckout {
    pub session_id: String,
    pub url: String,
}

/// Provider-side subscription state, collapsed to what premium depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    /// Incomplete, unpaid, paused and anything newer
    Inactive,
}

impl SubscriptionStatus {
    pub fn grants_premium(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub status: SubscriptionStatus,
    pub current_period_end: OffsetDateTime,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a subscription-mode checkout session correlated with `user_id`
    async fn create_subscription_checkout(
        &self,
        request: CheckoutRequest<'_>,
    ) -> BillingResult<HostedCheckout>;

    /// Status and end of the current billing period.
    /// Fails with `SubscriptionNotFound` when the provider has no such subscription.
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot>;

    /// Cancel the subscription immediately on the provider side
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}
