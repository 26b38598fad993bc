//! Shared fixtures for route tests

use std::sync::Arc;

use quotabot_billing::{
    client::PAYMENT_LINK_BASE_URL, BillingService, FakePaymentProvider, ManualClock, StripeConfig,
};
use quotabot_shared::{create_memory_pool, run_migrations, Config};
use time::macros::datetime;
use time::OffsetDateTime;

use crate::state::AppState;

pub const NOW: OffsetDateTime = datetime!(2025-01-15 10:00 UTC);
pub const WEBHOOK_SECRET: &str = "whsec_routes";

fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "DATABASE_URL" => Some("sqlite::memory:".to_string()),
        _ => None,
    })
    .unwrap()
}

/// State with billing backed by the fake provider and a clock fixed at [`NOW`]
pub async fn test_state() -> (AppState, Arc<FakePaymentProvider>, Arc<ManualClock>) {
    let pool = create_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    let config = test_config();

    let provider = Arc::new(FakePaymentProvider::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let stripe = StripeConfig {
        secret_key: "sk_test_routes".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        price_id: "price_monthly".to_string(),
        payment_link_id: Some("test_link".to_string()),
        payment_link_base_url: PAYMENT_LINK_BASE_URL.to_string(),
        webhook_tolerance_secs: 300,
    };
    let billing = BillingService::with_provider(
        pool.clone(),
        config.quota,
        stripe,
        provider.clone(),
        clock.clone(),
    );

    let state = AppState::with_billing(pool, config, Some(Arc::new(billing)));
    (state, provider, clock)
}

/// State with billing switched off
pub async fn without_billing() -> AppState {
    let pool = create_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    AppState::with_billing(pool, test_config(), None)
}
