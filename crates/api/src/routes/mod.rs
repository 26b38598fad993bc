//! HTTP routes

pub mod billing;
pub mod quota;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/quota/{user_id}", get(quota::get_quota))
        .route("/quota/{user_id}/consume", post(quota::consume))
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/payment-link/{user_id}", get(billing::payment_link))
        .route(
            "/billing/subscriptions/{subscription_id}/renewal",
            get(billing::renewal_date),
        )
        .route("/billing/cancel", post(billing::cancel))
        .route("/webhooks/stripe", post(billing::webhook))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
