//! Billing routes for Stripe integration

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use quotabot_billing::{BillingError, WebhookOutcome, SIGNATURE_HEADER};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub user_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentLinkResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct RenewalResponse {
    pub subscription_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub renews_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
    pub subscription_id: String,
}

/// Create a checkout session for the premium subscription
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    if req.user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }

    let url = billing
        .gateway
        .start_checkout(&req.user_id, &req.success_url, &req.cancel_url)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %req.user_id, error = %e, "create_checkout failed");
            ApiError::from(e)
        })?;

    Ok(Json(CheckoutResponse { url }))
}

/// Pre-provisioned payment link tagged with the user
pub async fn payment_link(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<PaymentLinkResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let url = billing
        .gateway
        .payment_link(&user_id)
        .ok_or_else(|| ApiError::NotFound("no payment link configured".to_string()))?;

    Ok(Json(PaymentLinkResponse { url }))
}

pub async fn renewal_date(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<RenewalResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let renews_at = billing
        .gateway
        .subscription_renewal_date(&subscription_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subscription {}", subscription_id)))?;

    Ok(Json(RenewalResponse {
        subscription_id,
        renews_at,
    }))
}

/// Cancel with Stripe, then revoke premium locally
pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<StatusCode> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    billing
        .cancel_user_subscription(&req.user_id, &req.subscription_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing.gateway.verify_webhook(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook verification failed");
        ApiError::from(e)
    })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    match billing.webhooks.handle_event(&event).await {
        Ok(outcome) => Ok(Json(outcome)),
        // Redelivery cannot fix an event without a user, acknowledge it
        Err(BillingError::MissingUserReference(event_id)) => {
            tracing::warn!(event_id = %event_id, event_type = %event.event_type, "Webhook event names no user, skipped");
            Ok(Json(WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            }))
        }
        Err(e) => {
            tracing::error!(event_id = %event.id, error = %e, "Webhook handling error");
            Err(ApiError::from(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use quotabot_billing::WebhookVerifier;
    use serde_json::{json, Value};
    use time::macros::datetime;
    use tower::ServiceExt;

    use crate::routes::create_router;
    use crate::test_helpers::{test_state, without_billing, NOW, WEBHOOK_SECRET};

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn webhook_request(payload: &[u8], secret: &str) -> Request<Body> {
        let header = WebhookVerifier::new(secret, 300).sign(NOW.unix_timestamp(), payload);
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("stripe-signature", header)
            .body(Body::from(payload.to_vec()))
            .unwrap()
    }

    fn checkout_completed(user_id: &str, subscription: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": NOW.unix_timestamp(),
            "data": { "object": {
                "id": "cs_1",
                "client_reference_id": user_id,
                "subscription": subscription
            } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_checkout_returns_url() {
        let (state, provider, _) = test_state().await;
        let app = create_router(state);

        let (status, body) = send(
            app,
            post_json(
                "/billing/checkout",
                json!({
                    "user_id": "U1",
                    "success_url": "https://bot.example/ok",
                    "cancel_url": "https://bot.example/cancel"
                }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().starts_with("https://"));
        assert_eq!(provider.checkouts()[0].user_id, "U1");
    }

    #[tokio::test]
    async fn test_checkout_provider_fault_is_bad_gateway() {
        let (state, provider, _) = test_state().await;
        provider.set_unavailable(true);
        let app = create_router(state);

        let (status, _) = send(
            app,
            post_json(
                "/billing/checkout",
                json!({ "user_id": "U1", "success_url": "a", "cancel_url": "b" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_billing_routes_unavailable_without_billing() {
        let app = create_router(without_billing().await);

        let (status, _) = send(app.clone(), get("/billing/payment-link/U1")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = send(app, webhook_request(&checkout_completed("U1", None), WEBHOOK_SECRET)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_payment_link() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);

        let (status, body) = send(app, get("/billing/payment-link/U1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["url"],
            "https://buy.stripe.com/test_link?client_reference_id=U1"
        );
    }

    #[tokio::test]
    async fn test_renewal_date_known_and_unknown() {
        let (state, provider, _) = test_state().await;
        provider.insert_subscription("sub_1", datetime!(2025-02-15 10:00 UTC));
        let app = create_router(state);

        let (status, body) = send(app.clone(), get("/billing/subscriptions/sub_1/renewal")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["renews_at"], "2025-02-15T10:00:00Z");

        let (status, _) = send(app, get("/billing/subscriptions/sub_missing/renewal")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_revokes_premium() {
        let (state, provider, _) = test_state().await;
        provider.insert_subscription("sub_1", datetime!(2025-02-15 10:00 UTC));
        state
            .accounts
            .set_premium("U1", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();
        let accounts = state.accounts.clone();
        let app = create_router(state);

        let (status, _) = send(
            app,
            post_json(
                "/billing/cancel",
                json!({ "user_id": "U1", "subscription_id": "sub_1" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!accounts.get_user("U1").await.unwrap().unwrap().is_premium);
    }

    #[tokio::test]
    async fn test_signed_checkout_webhook_grants_premium() {
        let (state, provider, _) = test_state().await;
        provider.insert_subscription("sub_1", datetime!(2025-02-15 10:00 UTC));
        let accounts = state.accounts.clone();
        let app = create_router(state);

        let (status, body) = send(
            app,
            webhook_request(&checkout_completed("U1", Some("sub_1")), WEBHOOK_SECRET),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "premium_granted");
        let user = accounts.get_user("U1").await.unwrap().unwrap();
        assert_eq!(
            user.premium_expires_at,
            Some(datetime!(2025-02-15 10:00 UTC))
        );
    }

    #[tokio::test]
    async fn test_forged_webhook_rejected_without_mutation() {
        let (state, _, _) = test_state().await;
        let accounts = state.accounts.clone();
        let app = create_router(state);

        let (status, _) = send(
            app,
            webhook_request(&checkout_completed("U1", None), "whsec_attacker"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(accounts.get_user("U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_webhook_without_signature_header() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .body(Body::from(checkout_completed("U1", None)))
            .unwrap();
        let (status, _) = send(app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unhandled_event_acknowledged() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);
        let payload = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "customer.created",
            "created": NOW.unix_timestamp(),
            "data": { "object": {} }
        }))
        .unwrap();

        let (status, body) = send(app, webhook_request(&payload, WEBHOOK_SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_one_off_invoice_acknowledged() {
        let (state, _, _) = test_state().await;
        let app = create_router(state);
        let payload = serde_json::to_vec(&json!({
            "id": "evt_3",
            "type": "invoice.paid",
            "created": NOW.unix_timestamp(),
            "data": { "object": { "id": "in_1", "customer": "cus_1" } }
        }))
        .unwrap();

        let (status, body) = send(app, webhook_request(&payload, WEBHOOK_SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_deletion_revokes_payment_link_buyer() {
        let (state, provider, _) = test_state().await;
        provider.insert_subscription("sub_1", datetime!(2025-02-15 10:00 UTC));
        let accounts = state.accounts.clone();
        let app = create_router(state);

        let (status, _) = send(
            app.clone(),
            webhook_request(&checkout_completed("U1", Some("sub_1")), WEBHOOK_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let deletion = serde_json::to_vec(&json!({
            "id": "evt_4",
            "type": "customer.subscription.deleted",
            "created": NOW.unix_timestamp(),
            "data": { "object": { "id": "sub_1", "metadata": {} } }
        }))
        .unwrap();
        let (status, body) = send(app, webhook_request(&deletion, WEBHOOK_SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "premium_revoked");
        assert!(!accounts.get_user("U1").await.unwrap().unwrap().is_premium);
    }

    #[tokio::test]
    async fn test_webhook_provider_fault_asks_for_redelivery() {
        let (state, provider, _) = test_state().await;
        provider.insert_subscription("sub_1", datetime!(2025-02-15 10:00 UTC));
        provider.set_unavailable(true);
        let accounts = state.accounts.clone();
        let app = create_router(state);

        let (status, _) = send(
            app,
            webhook_request(&checkout_completed("U1", Some("sub_1")), WEBHOOK_SECRET),
        )
        .await;

        assert!(status.is_server_error());
        assert!(accounts.get_user("U1").await.unwrap().is_none());
    }
}
