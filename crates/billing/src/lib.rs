// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotabot Billing Module
//!
//! Account storage, monthly quota enforcement and Stripe subscriptions.
//!
//! ## Features
//!
//! - **Accounts**: Lazily created users with a premium flag and expiry
//! - **Quota**: Free monthly allowance, unlimited while premium is active
//! - **Atomic consumption**: Check-and-record in one transaction
//! - **Subscriptions**: Hosted checkout, payment links, renewal lookup, cancellation
//! - **Webhooks**: Signature verification and premium lifecycle updates
//! - **Invariants**: Read-only consistency checks over account state

pub mod accounts;
pub mod client;
pub mod clock;
pub mod error;
pub mod invariants;
pub mod provider;
pub mod quota;
pub mod subscriptions;
pub mod webhooks;


use std::sync::Arc;

use quotabot_shared::QuotaConfig;
use sqlx::SqlitePool;

// Accounts
pub use accounts::{month_bucket, AccountStore, UserRecord};

// Client
pub use client::{StripeClient, StripeConfig};

// Clock
#[cfg(any(test, feature = "test-support"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Provider
#[cfg(any(test, feature = "test-support"))]
pub use provider::FakePaymentProvider;
pub use provider::{
    CheckoutRequest, HostedCheckout, PaymentProvider, StripeProvider, SubscriptionSnapshot,
    SubscriptionStatus,
};

// Quota
pub use quota::{Consumption, Quota};

// Subscriptions
pub use subscriptions::SubscriptionGateway;

// Webhooks
pub use webhooks::{
    SubscriptionEvent, VerificationError, WebhookEvent, WebhookHandler, WebhookOutcome,
    WebhookVerifier, SIGNATURE_HEADER,
};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub accounts: AccountStore,
    pub gateway: SubscriptionGateway,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: SqlitePool, quota: QuotaConfig) -> BillingResult<Self> {
        Ok(Self::new(pool, quota, StripeConfig::from_env()?))
    }

    /// Create a new billing service with explicit config
    pub fn new(pool: SqlitePool, quota: QuotaConfig, config: StripeConfig) -> Self {
        let provider = Arc::new(StripeProvider::new(StripeClient::new(config.clone())));
        Self::with_provider(pool, quota, config, provider, Arc::new(SystemClock))
    }

    /// Wire the service around any provider and clock
    pub fn with_provider(
        pool: SqlitePool,
        quota: QuotaConfig,
        config: StripeConfig,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let accounts = AccountStore::with_clock(pool, quota, clock.clone());
        let gateway = SubscriptionGateway::with_clock(provider.clone(), config, clock);
        let webhooks = WebhookHandler::new(accounts.clone(), provider);
        Self {
            accounts,
            gateway,
            webhooks,
        }
    }

    /// Cancel on the provider, then revoke premium locally.
    ///
    /// If the provider refuses, the account keeps its premium state.
    pub async fn cancel_user_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        self.gateway.cancel_subscription(subscription_id).await?;
        self.accounts.cancel_premium(user_id).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription cancelled and premium revoked"
        );
        Ok(())
    }
}
