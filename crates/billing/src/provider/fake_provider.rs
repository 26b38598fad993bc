use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::{
    CheckoutRequest, HostedCheckout, PaymentProvider, SubscriptionSnapshot, SubscriptionStatus,
};
use crate::error::{BillingError, BillingResult};

/// Checkout session recorded by [`FakePaymentProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCheckout {
    pub session_id: String,
    pub user_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// In-memory provider for tests
#[derive(Debug, Default)]
pub struct FakePaymentProvider {
    checkouts: Mutex<Vec<FakeCheckout>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    cancelled: Mutex<Vec<String>>,
    unavailable: AtomicBool,
}

impl FakePaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active subscription with its current period end
    pub fn insert_subscription(&self, subscription_id: &str, period_end: OffsetDateTime) {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).insert(
            subscription_id.to_string(),
            SubscriptionSnapshot {
                status: SubscriptionStatus::Active,
                current_period_end: period_end,
            },
        );
    }

    /// Change the status of a registered subscription; unknown ids are ignored
    pub fn set_subscription_status(&self, subscription_id: &str, status: SubscriptionStatus) {
        if let Some(snapshot) = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(subscription_id)
        {
            snapshot.status = status;
        }
    }

    /// Make every call fail as if the provider were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn checkouts(&self) -> Vec<FakeCheckout> {
        self.checkouts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancelled_subscriptions(&self) -> Vec<String> {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi(
                "provider unreachable (fake)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn create_subscription_checkout(
        &self,
        request: CheckoutRequest<'_>,
    ) -> BillingResult<HostedCheckout> {
        self.check_available()?;

        let mut checkouts = self.checkouts.lock().unwrap_or_else(|e| e.into_inner());
        let session_id = format!("cs_test_{}", checkouts.len() + 1);
        checkouts.push(FakeCheckout {
            session_id: session_id.clone(),
            user_id: request.user_id.to_string(),
            price_id: request.price_id.to_string(),
            success_url: request.success_url.to_string(),
            cancel_url: request.cancel_url.to_string(),
        });

        Ok(HostedCheckout {
            url: format!("https://checkout.stripe.test/pay/{}", session_id),
            session_id,
        })
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        self.check_available()?;

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subscription_id)
            .copied()
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// Cancelled subscriptions stay retrievable with status `Canceled`
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        self.check_available()?;

        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            let snapshot = subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
            snapshot.status = SubscriptionStatus::Canceled;
        }

        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription_id.to_string());
        Ok(())
    }
}
