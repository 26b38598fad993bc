//! Stripe webhook handling
//!
//! Verification and mutation are separate steps: [`WebhookVerifier`] turns a
//! raw body and signature header into a [`WebhookEvent`] or a
//! [`VerificationError`], and only a verified event ever reaches
//! [`WebhookHandler::handle_event`].

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};

use crate::accounts::AccountStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{BillingError, BillingResult};
use crate::provider::{PaymentProvider, SubscriptionStatus, USER_ID_METADATA_KEY};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the Stripe signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Premium period granted when a completed checkout carries no subscription
pub const FALLBACK_PREMIUM_PERIOD: Duration = Duration::days(30);

/// Why a webhook delivery was not trusted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// Signature checked out but the body is not a well-formed event
    #[error("invalid payload: {0}")]
    BadPayload(String),

    /// Header missing or garbled, timestamp outside tolerance, or digest mismatch
    #[error("invalid signature: {0}")]
    BadSignature(String),
}

/// Verified Stripe event envelope.
///
/// Only the envelope is typed; `data.object` is kept as the provider sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

/// Subscription lifecycle change carried by an event.
///
/// Renewal and deletion events only name the user when the subscription was
/// created through our own checkout; otherwise `user_id` is `None` and the
/// handler resolves it through the stored subscription link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    CheckoutCompleted {
        user_id: String,
        subscription_id: Option<String>,
    },
    Renewed {
        user_id: Option<String>,
        subscription_id: String,
    },
    Cancelled {
        user_id: Option<String>,
        subscription_id: String,
    },
    Ignored {
        event_type: String,
    },
}

/// What the handler did with an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    PremiumGranted {
        user_id: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    PremiumRevoked {
        user_id: String,
    },
    /// The provider reports the subscription as not paying; nothing changed
    SubscriptionInactive {
        user_id: String,
        subscription_id: String,
        status: SubscriptionStatus,
    },
    Ignored {
        event_type: String,
    },
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Subscription references arrive either as an id or an expanded object
fn id_at(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

impl WebhookEvent {
    /// Interpret the event as a subscription lifecycle change
    pub fn subscription_event(&self) -> BillingResult<SubscriptionEvent> {
        let object = &self.data.object;
        let missing_user = || BillingError::MissingUserReference(self.id.clone());

        match self.event_type.as_str() {
            "checkout.session.completed" => {
                let user_id = str_at(object, &["client_reference_id"])
                    .or_else(|| str_at(object, &["metadata", USER_ID_METADATA_KEY]))
                    .ok_or_else(missing_user)?;
                Ok(SubscriptionEvent::CheckoutCompleted {
                    user_id: user_id.to_string(),
                    subscription_id: id_at(object, "subscription"),
                })
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                let subscription_id = id_at(object, "subscription").or_else(|| {
                    object
                        .get("parent")
                        .and_then(|p| p.get("subscription_details"))
                        .and_then(|d| id_at(d, "subscription"))
                });
                // One-off invoices have no subscription to renew
                let Some(subscription_id) = subscription_id else {
                    return Ok(SubscriptionEvent::Ignored {
                        event_type: self.event_type.clone(),
                    });
                };
                let user_id = str_at(object, &["subscription_details", "metadata", USER_ID_METADATA_KEY])
                    .or_else(|| {
                        str_at(
                            object,
                            &["parent", "subscription_details", "metadata", USER_ID_METADATA_KEY],
                        )
                    });
                Ok(SubscriptionEvent::Renewed {
                    user_id: user_id.map(str::to_string),
                    subscription_id,
                })
            }
            "customer.subscription.deleted" => {
                let subscription_id = str_at(object, &["id"]).ok_or_else(missing_user)?;
                Ok(SubscriptionEvent::Cancelled {
                    user_id: str_at(object, &["metadata", USER_ID_METADATA_KEY]).map(str::to_string),
                    subscription_id: subscription_id.to_string(),
                })
            }
            other => Ok(SubscriptionEvent::Ignored {
                event_type: other.to_string(),
            }),
        }
    }
}

/// Verifies the `stripe-signature` header scheme
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
    clock: Arc<dyn Clock>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self::with_clock(secret, tolerance_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: impl Into<String>, tolerance_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            clock,
        }
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, VerificationError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| VerificationError::BadSignature("unusable webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Check the signature over the raw body, then parse it.
    ///
    /// Header format: `t=<unix seconds>,v1=<hex digest>[,v1=<hex digest>...]`.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent, VerificationError> {
        if self.secret.is_empty() {
            return Err(VerificationError::BadSignature(
                "webhook secret not configured".to_string(),
            ));
        }

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| VerificationError::BadSignature("missing timestamp".to_string()))?;
        if candidates.is_empty() {
            return Err(VerificationError::BadSignature(
                "missing v1 signature".to_string(),
            ));
        }

        let now = self.clock.now_utc().unix_timestamp();
        // `t` is unauthenticated here, so the distance must not overflow
        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(VerificationError::BadSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let expected = self.mac_for(timestamp, payload)?.finalize().into_bytes();
        let matched = candidates
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if !matched {
            tracing::warn!(payload_len = payload.len(), "Webhook signature mismatch");
            return Err(VerificationError::BadSignature(
                "signature mismatch".to_string(),
            ));
        }

        serde_json::from_slice::<WebhookEvent>(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Signed webhook body is not a valid event");
            VerificationError::BadPayload(e.to_string())
        })
    }

    /// Produce a signature header for `payload`, as Stripe would send it
    #[cfg(any(test, feature = "test-support"))]
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        let digest = match self.mac_for(timestamp, payload) {
            Ok(mac) => hex::encode(mac.finalize().into_bytes()),
            Err(_) => String::new(),
        };
        format!("t={},v1={}", timestamp, digest)
    }
}

/// Applies verified subscription events to the account store
#[derive(Clone)]
pub struct WebhookHandler {
    accounts: AccountStore,
    provider: Arc<dyn PaymentProvider>,
}

impl WebhookHandler {
    pub fn new(accounts: AccountStore, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { accounts, provider }
    }

    /// Handle a verified Stripe event.
    ///
    /// Provider lookups happen before any write, so a provider fault leaves
    /// the account untouched and the error lets Stripe redeliver. Premium is
    /// only granted while the provider reports the subscription as paying, so
    /// a late or replayed event cannot revive a cancelled subscription.
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let outcome = match event.subscription_event()? {
            SubscriptionEvent::CheckoutCompleted {
                user_id,
                subscription_id: Some(subscription_id),
            } => self.grant_for_subscription(user_id, subscription_id).await?,
            SubscriptionEvent::CheckoutCompleted {
                user_id,
                subscription_id: None,
            } => {
                tracing::warn!(
                    event_id = %event.id,
                    user_id = %user_id,
                    "Checkout completed without a subscription, using fallback period"
                );
                let expires_at = self.accounts.now() + FALLBACK_PREMIUM_PERIOD;
                self.accounts.set_premium(&user_id, expires_at).await?;
                WebhookOutcome::PremiumGranted {
                    user_id,
                    expires_at,
                }
            }
            SubscriptionEvent::Renewed {
                user_id,
                subscription_id,
            } => {
                let user_id = self.resolve_user(event, user_id, &subscription_id).await?;
                self.grant_for_subscription(user_id, subscription_id).await?
            }
            SubscriptionEvent::Cancelled {
                user_id,
                subscription_id,
            } => {
                let user_id = self.resolve_user(event, user_id, &subscription_id).await?;
                self.accounts.cancel_premium(&user_id).await?;
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Subscription deleted, premium revoked"
                );
                WebhookOutcome::PremiumRevoked { user_id }
            }
            SubscriptionEvent::Ignored { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type"
                );
                WebhookOutcome::Ignored { event_type }
            }
        };

        tracing::info!(event_id = %event.id, event_type = %event.event_type, outcome = ?outcome, "Webhook event processed");
        Ok(outcome)
    }

    /// Metadata wins; otherwise the owner recorded when the checkout completed
    async fn resolve_user(
        &self,
        event: &WebhookEvent,
        user_id: Option<String>,
        subscription_id: &str,
    ) -> BillingResult<String> {
        if let Some(user_id) = user_id {
            return Ok(user_id);
        }
        self.accounts
            .subscription_owner(subscription_id)
            .await?
            .ok_or_else(|| BillingError::MissingUserReference(event.id.clone()))
    }

    async fn grant_for_subscription(
        &self,
        user_id: String,
        subscription_id: String,
    ) -> BillingResult<WebhookOutcome> {
        let snapshot = self.provider.retrieve_subscription(&subscription_id).await?;

        if !snapshot.status.grants_premium() {
            tracing::warn!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                status = ?snapshot.status,
                "Subscription is not active, premium not granted"
            );
            return Ok(WebhookOutcome::SubscriptionInactive {
                user_id,
                subscription_id,
                status: snapshot.status,
            });
        }

        self.accounts
            .grant_subscription(&user_id, &subscription_id, snapshot.current_period_end)
            .await?;
        Ok(WebhookOutcome::PremiumGranted {
            user_id,
            expires_at: snapshot.current_period_end,
        })
    }
}
