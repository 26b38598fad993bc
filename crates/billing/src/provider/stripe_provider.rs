use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionPaymentMethodTypes,
    CreateCheckoutSessionSubscriptionData, StripeError, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubscriptionStatus,
};
use time::OffsetDateTime;

use super::{
    CheckoutRequest, HostedCheckout, PaymentProvider, SubscriptionSnapshot, SubscriptionStatus,
    USER_ID_METADATA_KEY,
};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// [`PaymentProvider`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidSubscriptionId(format!("{}: {}", subscription_id, e)))
    }
}

/// Stripe answers 404 for unknown resources; everything else is an API fault
fn map_subscription_error(subscription_id: &str, err: StripeError) -> BillingError {
    match err {
        StripeError::Stripe(request_error) if request_error.http_status == 404 => {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        }
        other => BillingError::StripeApi(other.to_string()),
    }
}

fn map_status(status: StripeSubscriptionStatus) -> SubscriptionStatus {
    match status {
        StripeSubscriptionStatus::Active => SubscriptionStatus::Active,
        StripeSubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Inactive,
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_subscription_checkout(
        &self,
        request: CheckoutRequest<'_>,
    ) -> BillingResult<HostedCheckout> {
        let mut metadata = HashMap::new();
        metadata.insert(
            USER_ID_METADATA_KEY.to_string(),
            request.user_id.to_string(),
        );

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Subscription),
            payment_method_types: Some(vec![CreateCheckoutSessionPaymentMethodTypes::Card]),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(request.price_id.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(request.success_url),
            cancel_url: Some(request.cancel_url),
            client_reference_id: Some(request.user_id),
            metadata: Some(metadata.clone()),
            // Copied onto the subscription so renewal and deletion events carry the user
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = match CheckoutSession::create(self.stripe.inner(), params).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    user_id = %request.user_id,
                    error = %e,
                    "Stripe Checkout Session creation failed"
                );
                return Err(BillingError::StripeApi(e.to_string()));
            }
        };

        let url = session.url.ok_or(BillingError::MissingCheckoutUrl)?;

        tracing::info!(
            user_id = %request.user_id,
            session_id = %session.id,
            "Created subscription checkout session"
        );

        Ok(HostedCheckout {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[])
            .await
            .map_err(|e| map_subscription_error(subscription_id, e))?;

        let current_period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .map_err(|e| {
                BillingError::Internal(format!(
                    "Invalid current_period_end {} for {}: {}",
                    subscription.current_period_end, subscription_id, e
                ))
            })?;

        Ok(SubscriptionSnapshot {
            status: map_status(subscription.status),
            current_period_end,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = Subscription::cancel(self.stripe.inner(), &sub_id, params)
            .await
            .map_err(|e| map_subscription_error(subscription_id, e))?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Cancelled subscription"
        );

        Ok(())
    }
}
