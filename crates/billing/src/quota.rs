//! Monthly quota rules
//!
//! Free accounts get `free_monthly_limit` usages per month bucket. Accounts
//! with active premium are unlimited, represented as [`Quota::Unlimited`]
//! rather than a large number.

use serde::Serialize;

use crate::accounts::{count_usage, fetch_user, insert_user_if_absent, month_bucket, AccountStore};
use crate::error::{BillingError, BillingResult};

/// Usage still available to a user this month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "remaining", rename_all = "snake_case")]
pub enum Quota {
    Unlimited,
    Limited(u32),
}

impl Quota {
    pub fn allows_usage(&self) -> bool {
        match self {
            Quota::Unlimited => true,
            Quota::Limited(remaining) => *remaining > 0,
        }
    }

    /// Remaining count, `None` when unlimited
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Quota::Unlimited => None,
            Quota::Limited(remaining) => Some(*remaining),
        }
    }
}

/// Outcome of an atomic check-and-record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Consumption {
    /// A usage was recorded; `remaining` is what is left afterwards
    Consumed { remaining: u32 },
    /// The monthly limit was already reached, nothing was recorded
    Denied,
    /// Active premium, usage recorded without limit
    Unlimited,
}

impl AccountStore {
    /// Remaining quota for the current month.
    ///
    /// Creates the account on first query, so this is not a pure read.
    pub async fn remaining_quota(&self, user_id: &str) -> BillingResult<Quota> {
        self.ensure_user(user_id).await?;

        let now = self.now();
        let user = self
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("user {} vanished after insert", user_id)))?;

        if user.has_active_premium(now) {
            return Ok(Quota::Unlimited);
        }

        let month = month_bucket(now, &self.quota);
        let used = self.monthly_usage_count(user_id, Some(month.as_str())).await?;
        Ok(Quota::Limited(
            self.quota.free_monthly_limit.saturating_sub(used),
        ))
    }

    /// Check the quota and record one usage in a single transaction.
    ///
    /// The usage row is inserted by one conditional statement guarded by the
    /// month count, so concurrent callers can never push a free account past
    /// its limit.
    pub async fn try_consume(&self, user_id: &str) -> BillingResult<Consumption> {
        let now = self.now();
        let month = month_bucket(now, &self.quota);
        let limit = self.quota.free_monthly_limit;

        let mut tx = self.pool.begin().await?;

        // First statement is a write so SQLite takes the write lock up front
        insert_user_if_absent(&mut *tx, user_id, now).await?;

        let user = fetch_user(&mut *tx, user_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("user {} vanished after insert", user_id)))?;

        if user.has_active_premium(now) {
            sqlx::query("INSERT INTO usage (user_id, used_at, month) VALUES ($1, $2, $3)")
                .bind(user_id)
                .bind(now)
                .bind(&month)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Consumption::Unlimited);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO usage (user_id, used_at, month)
            SELECT $1, $2, $3
            WHERE (SELECT COUNT(*) FROM usage WHERE user_id = $1 AND month = $3) < $4
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(&month)
        .bind(i64::from(limit))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Commit anyway: the account row created above must persist
            tx.commit().await?;
            tracing::info!(user_id = %user_id, month = %month, limit = limit, "Monthly quota exhausted");
            return Ok(Consumption::Denied);
        }

        let used = count_usage(&mut *tx, user_id, &month).await?;
        tx.commit().await?;

        let remaining = limit.saturating_sub(used);
        tracing::debug!(user_id = %user_id, month = %month, remaining = remaining, "Usage consumed");
        Ok(Consumption::Consumed { remaining })
    }
}
