//! Application state

use std::sync::Arc;

use quotabot_billing::{AccountStore, BillingService};
use quotabot_shared::Config;
use sqlx::SqlitePool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Config,
    pub accounts: AccountStore,
    /// Stripe billing, `None` when disabled or not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        // Try to initialize billing if Stripe env vars are set
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone(), config.quota) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(pool, config, billing)
    }

    /// Build state around an already constructed billing service
    pub fn with_billing(
        pool: SqlitePool,
        config: Config,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        if !config.channel.is_configured() {
            tracing::warn!("Messaging channel credentials not configured (missing LINE_CHANNEL_SECRET or LINE_CHANNEL_ACCESS_TOKEN)");
        }

        // Share the billing store so quota and webhooks see the same clock
        let accounts = match &billing {
            Some(svc) => svc.accounts.clone(),
            None => AccountStore::new(pool.clone(), config.quota),
        };
        tracing::info!(
            free_monthly_limit = config.quota.free_monthly_limit,
            utc_offset = %config.quota.utc_offset,
            "Account store initialized"
        );

        Self {
            pool,
            config,
            accounts,
            billing,
        }
    }

    /// Get billing service reference
    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
