//! Stripe client and configuration

use std::sync::Arc;

use quotabot_shared::config::{optional, parse_or, required};

use crate::error::BillingResult;

/// Default host for pre-provisioned payment links
pub const PAYMENT_LINK_BASE_URL: &str = "https://buy.stripe.com";

/// Signature timestamps older than this are rejected (seconds)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Price of the monthly premium subscription
    pub price_id: String,
    /// Pre-provisioned payment link, if one was created in the dashboard
    pub payment_link_id: Option<String>,
    pub payment_link_base_url: String,
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret_key = required(&lookup, "STRIPE_SECRET_KEY")?;
        let webhook_secret = optional(&lookup, "STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        let price_id = optional(&lookup, "STRIPE_PRICE_ID").unwrap_or_default();

        if webhook_secret.is_empty() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET is not set - every webhook will be rejected");
        }
        if price_id.is_empty() {
            tracing::warn!("STRIPE_PRICE_ID is not set - checkout sessions will fail");
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            price_id,
            payment_link_id: optional(&lookup, "STRIPE_PAYMENT_LINK_ID"),
            payment_link_base_url: PAYMENT_LINK_BASE_URL.to_string(),
            webhook_tolerance_secs: parse_or(
                &lookup,
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?,
        })
    }
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("price_id", &self.price_id)
            .field("payment_link_id", &self.payment_link_id)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish_non_exhaustive()
    }
}

/// Wrapper around the Stripe client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
