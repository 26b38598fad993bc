//! Account store
//!
//! Persistent per-user state: identity, premium flag, premium expiry and the
//! append-only usage log. Quota rules built on top of it live in
//! [`crate::quota`].
//!
//! Premium expiry is lazy: `is_premium` stays set after `premium_expires_at`
//! passes and every read compares the expiry against the clock.

use std::sync::Arc;

use quotabot_shared::QuotaConfig;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool};
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::error::BillingResult;

/// Stored account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_premium: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub premium_expires_at: Option<OffsetDateTime>,
}

impl UserRecord {
    /// Premium counts only while the expiry is strictly in the future
    pub fn has_active_premium(&self, now: OffsetDateTime) -> bool {
        self.is_premium
            && self
                .premium_expires_at
                .map(|expires_at| expires_at > now)
                .unwrap_or(false)
    }
}

/// Format a timestamp as its `YYYY-MM` month bucket in the given offset
pub fn month_bucket(at: OffsetDateTime, quota: &QuotaConfig) -> String {
    let local = at.to_offset(quota.utc_offset);
    format!("{:04}-{:02}", local.year(), u8::from(local.month()))
}

#[derive(Clone)]
pub struct AccountStore {
    pub(crate) pool: SqlitePool,
    pub(crate) quota: QuotaConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AccountStore {
    pub fn new(pool: SqlitePool, quota: QuotaConfig) -> Self {
        Self::with_clock(pool, quota, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, quota: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self { pool, quota, clock }
    }

    pub fn quota_config(&self) -> &QuotaConfig {
        &self.quota
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now_utc()
    }

    /// Month bucket for the current clock reading
    pub fn current_month(&self) -> String {
        month_bucket(self.now(), &self.quota)
    }

    /// Create the account if it does not exist yet
    pub async fn ensure_user(&self, user_id: &str) -> BillingResult<()> {
        let created = insert_user_if_absent(&self.pool, user_id, self.now()).await?;
        if created {
            tracing::info!(user_id = %user_id, "Created user account");
        }
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> BillingResult<Option<UserRecord>> {
        Ok(fetch_user(&self.pool, user_id).await?)
    }

    /// Count usage records in `month`, or in the current month when `None`
    pub async fn monthly_usage_count(&self, user_id: &str, month: Option<&str>) -> BillingResult<u32> {
        let month = match month {
            Some(m) => m.to_string(),
            None => self.current_month(),
        };
        Ok(count_usage(&self.pool, user_id, &month).await?)
    }

    /// Append one usage record stamped with the current time.
    ///
    /// Does not consult the quota. Callers using this two-step path must check
    /// `remaining_quota` first, and two concurrent callers can both pass that
    /// check. [`AccountStore::try_consume`] does both in one transaction.
    pub async fn record_usage(&self, user_id: &str) -> BillingResult<()> {
        let now = self.now();
        let month = month_bucket(now, &self.quota);

        let mut tx = self.pool.begin().await?;
        insert_user_if_absent(&mut *tx, user_id, now).await?;
        sqlx::query("INSERT INTO usage (user_id, used_at, month) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(now)
            .bind(&month)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(user_id = %user_id, month = %month, "Recorded usage");
        Ok(())
    }

    /// Grant premium until `expires_at`, replacing any previous premium state
    pub async fn set_premium(&self, user_id: &str, expires_at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, created_at, is_premium, premium_expires_at)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                is_premium = TRUE,
                premium_expires_at = excluded.premium_expires_at
            "#,
        )
        .bind(user_id)
        .bind(self.now())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, expires_at = %expires_at, "Premium granted");
        Ok(())
    }

    /// Revoke premium. Succeeds for free and unknown users alike.
    pub async fn cancel_premium(&self, user_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE users SET is_premium = FALSE, premium_expires_at = NULL WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            rows_affected = result.rows_affected(),
            "Premium cancelled"
        );
        Ok(())
    }

    /// Grant premium until `expires_at` and record `subscription_id` as owned
    /// by the user, in one transaction. Relinks a subscription that changed hands.
    pub async fn grant_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (user_id, created_at, is_premium, premium_expires_at)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                is_premium = TRUE,
                premium_expires_at = excluded.premium_expires_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, linked_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id) DO UPDATE SET user_id = excluded.user_id
            "#,
        )
        .bind(subscription_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            expires_at = %expires_at,
            "Premium granted for subscription"
        );
        Ok(())
    }

    /// User a subscription was linked to, if any
    pub async fn subscription_owner(&self, subscription_id: &str) -> BillingResult<Option<String>> {
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM subscriptions WHERE subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(owner.map(|(user_id,)| user_id))
    }
}

/// Returns true when a new row was inserted
pub(crate) async fn insert_user_if_absent<'e, E>(
    executor: E,
    user_id: &str,
    now: OffsetDateTime,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO users (user_id, created_at, is_premium)
        VALUES ($1, $2, FALSE)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn fetch_user<'e, E>(
    executor: E,
    user_id: &str,
) -> Result<Option<UserRecord>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, UserRecord>(
        "SELECT user_id, created_at, is_premium, premium_expires_at FROM users WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn count_usage<'e, E>(
    executor: E,
    user_id: &str,
    month: &str,
) -> Result<u32, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM usage WHERE user_id = $1 AND month = $2")
            .bind(user_id)
            .bind(month)
            .fetch_one(executor)
            .await?;

    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::BillingError;
    use quotabot_shared::{create_memory_pool, run_migrations};
    use time::macros::datetime;
    use time::{Duration, UtcOffset};

    async fn setup_store(start: OffsetDateTime) -> (AccountStore, Arc<ManualClock>) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = AccountStore::with_clock(pool, QuotaConfig::default(), clock.clone());
        (store, clock)
    }

    #[test]
    fn test_month_bucket_uses_configured_offset() {
        let at = datetime!(2025-01-31 16:00 UTC);

        let utc = QuotaConfig::default();
        assert_eq!(month_bucket(at, &utc), "2025-01");

        let tokyo = QuotaConfig {
            utc_offset: UtcOffset::from_hms(9, 0, 0).unwrap(),
            ..QuotaConfig::default()
        };
        assert_eq!(month_bucket(at, &tokyo), "2025-02");
    }

    #[test]
    fn test_month_bucket_pads_single_digit_months() {
        let at = datetime!(2025-03-01 00:00 UTC);
        assert_eq!(month_bucket(at, &QuotaConfig::default()), "2025-03");
    }

    #[tokio::test]
    async fn test_get_user_returns_none_for_unknown_user() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        assert!(store.get_user("U-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let (store, clock) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;

        store.ensure_user("U1").await.unwrap();
        clock.advance(Duration::days(3));
        store.ensure_user("U1").await.unwrap();

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert_eq!(user.user_id, "U1");
        assert_eq!(user.created_at, datetime!(2025-01-15 10:00 UTC));
        assert!(!user.is_premium);
        assert!(user.premium_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_record_usage_counts_in_current_month() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;

        store.record_usage("U1").await.unwrap();
        store.record_usage("U1").await.unwrap();
        store.record_usage("U2").await.unwrap();

        assert_eq!(store.monthly_usage_count("U1", None).await.unwrap(), 2);
        assert_eq!(store.monthly_usage_count("U1", Some("2025-01")).await.unwrap(), 2);
        assert_eq!(store.monthly_usage_count("U1", Some("2024-12")).await.unwrap(), 0);
        assert_eq!(store.monthly_usage_count("U2", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_usage_creates_missing_user() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;

        store.record_usage("U-new").await.unwrap();

        assert!(store.get_user("U-new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_premium_overwrites_previous_expiry() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store.ensure_user("U1").await.unwrap();

        store
            .set_premium("U1", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();
        store
            .set_premium("U1", datetime!(2025-01-20 00:00 UTC))
            .await
            .unwrap();

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert!(user.is_premium);
        assert_eq!(user.premium_expires_at, Some(datetime!(2025-01-20 00:00 UTC)));
    }

    #[tokio::test]
    async fn test_set_premium_creates_unknown_user() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;

        store
            .set_premium("U-paid-first", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();

        let user = store.get_user("U-paid-first").await.unwrap().unwrap();
        assert!(user.is_premium);
        assert_eq!(user.created_at, datetime!(2025-01-15 10:00 UTC));
    }

    #[tokio::test]
    async fn test_cancel_premium_clears_flag_and_expiry() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store
            .set_premium("U1", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();

        store.cancel_premium("U1").await.unwrap();

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert!(!user.is_premium);
        assert!(user.premium_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_premium_is_idempotent() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store.ensure_user("U1").await.unwrap();
        let before = store.get_user("U1").await.unwrap().unwrap();

        store.cancel_premium("U1").await.unwrap();
        store.cancel_premium("U1").await.unwrap();
        store.cancel_premium("U-never-seen").await.unwrap();

        assert_eq!(store.get_user("U1").await.unwrap().unwrap(), before);
        assert!(store.get_user("U-never-seen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grant_subscription_links_owner() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        assert_eq!(store.subscription_owner("sub_1").await.unwrap(), None);

        store
            .grant_subscription("U1", "sub_1", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();

        assert_eq!(
            store.subscription_owner("sub_1").await.unwrap(),
            Some("U1".to_string())
        );
        let user = store.get_user("U1").await.unwrap().unwrap();
        assert!(user.has_active_premium(store.now()));
        assert_eq!(user.premium_expires_at, Some(datetime!(2025-02-15 10:00 UTC)));
    }

    #[tokio::test]
    async fn test_grant_subscription_relinks_and_extends() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store
            .grant_subscription("U1", "sub_1", datetime!(2025-02-15 10:00 UTC))
            .await
            .unwrap();
        store
            .grant_subscription("U2", "sub_1", datetime!(2025-03-15 10:00 UTC))
            .await
            .unwrap();

        assert_eq!(
            store.subscription_owner("sub_1").await.unwrap(),
            Some("U2".to_string())
        );
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_premium_is_inactive_once_expiry_passes() {
        let (store, clock) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store
            .set_premium("U1", datetime!(2025-01-16 10:00 UTC))
            .await
            .unwrap();

        let user = store.get_user("U1").await.unwrap().unwrap();
        assert!(user.has_active_premium(store.now()));

        clock.set(datetime!(2025-01-16 10:00 UTC));
        let user = store.get_user("U1").await.unwrap().unwrap();
        // Flag is untouched; only the read-time comparison changes
        assert!(user.is_premium);
        assert!(!user.has_active_premium(store.now()));
    }

    #[test]
    fn test_premium_without_expiry_is_inactive() {
        let user = UserRecord {
            user_id: "U1".to_string(),
            created_at: datetime!(2025-01-01 00:00 UTC),
            is_premium: true,
            premium_expires_at: None,
        };
        assert!(!user.has_active_premium(datetime!(2025-01-02 00:00 UTC)));
    }

    #[tokio::test]
    async fn test_reads_surface_storage_faults() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store.pool.close().await;

        let err = store.get_user("U1").await.unwrap_err();
        assert!(matches!(err, BillingError::StorageUnavailable(_)));
        assert!(err.is_unavailable());

        let err = store.monthly_usage_count("U1", None).await.unwrap_err();
        assert!(matches!(err, BillingError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_mutations_surface_storage_faults() {
        let (store, _) = setup_store(datetime!(2025-01-15 10:00 UTC)).await;
        store.pool.close().await;

        assert!(store.record_usage("U1").await.is_err());
        assert!(store.cancel_premium("U1").await.is_err());
        assert!(store
            .set_premium("U1", datetime!(2025-02-01 00:00 UTC))
            .await
            .is_err());
        assert!(store
            .grant_subscription("U1", "sub_1", datetime!(2025-02-01 00:00 UTC))
            .await
            .is_err());
        assert!(store.subscription_owner("sub_1").await.is_err());
    }
}
