//! Subscription gateway
//!
//! Stateless facade over the payment provider. Nothing here writes to the
//! account store; callers apply the results explicitly.

use std::sync::Arc;

use time::OffsetDateTime;
use url::Url;

use crate::client::StripeConfig;
use crate::clock::{Clock, SystemClock};
use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutRequest, PaymentProvider};
use crate::webhooks::{VerificationError, WebhookEvent, WebhookVerifier};

/// Query parameter Stripe payment links use to correlate the buyer
const CLIENT_REFERENCE_PARAM: &str = "client_reference_id";

#[derive(Clone)]
pub struct SubscriptionGateway {
    provider: Arc<dyn PaymentProvider>,
    config: Arc<StripeConfig>,
    verifier: WebhookVerifier,
}

impl SubscriptionGateway {
    pub fn new(provider: Arc<dyn PaymentProvider>, config: StripeConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Arc<dyn PaymentProvider>,
        config: StripeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let verifier = WebhookVerifier::with_clock(
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
            clock,
        );
        Self {
            provider,
            config: Arc::new(config),
            verifier,
        }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Create a subscription checkout for `user_id` and return its redirect URL
    pub async fn start_checkout(
        &self,
        user_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<String> {
        if self.config.price_id.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_PRICE_ID is not configured".to_string(),
            ));
        }

        let checkout = self
            .provider
            .create_subscription_checkout(CheckoutRequest {
                user_id,
                price_id: &self.config.price_id,
                success_url,
                cancel_url,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %checkout.session_id,
            "Checkout started"
        );
        Ok(checkout.url)
    }

    /// Pre-provisioned payment link tagged with the user, if one is configured
    pub fn payment_link(&self, user_id: &str) -> Option<String> {
        let link_id = self.config.payment_link_id.as_deref()?;
        let base = format!(
            "{}/{}",
            self.config.payment_link_base_url.trim_end_matches('/'),
            link_id
        );

        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "Configured payment link is not a valid URL");
                return None;
            }
        };
        url.query_pairs_mut()
            .append_pair(CLIENT_REFERENCE_PARAM, user_id);
        Some(url.into())
    }

    /// Verify a webhook delivery. Never mutates state.
    pub fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, VerificationError> {
        self.verifier.verify(payload, signature_header)
    }

    /// Current billing-period end, `None` when the subscription does not exist
    pub async fn subscription_renewal_date(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<OffsetDateTime>> {
        match self.provider.retrieve_subscription(subscription_id).await {
            Ok(snapshot) => Ok(Some(snapshot.current_period_end)),
            Err(BillingError::SubscriptionNotFound(_)) => Ok(None),
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Error retrieving subscription"
                );
                Err(e)
            }
        }
    }

    /// Ask the provider to cancel. Success means the provider accepted it;
    /// revoking premium locally is a separate step.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        self.provider
            .cancel_subscription(subscription_id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Error canceling subscription"
                );
            })
    }
}
