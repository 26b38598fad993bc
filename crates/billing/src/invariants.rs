//! Account invariants
//!
//! Runnable consistency checks over the account tables. Checks only read,
//! never write, so they are safe to run at startup or after a webhook replay.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Accounts affected
    pub user_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Premium state contradicts itself; quota answers may be wrong
    High,
    /// Data inconsistency that needs attention
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when nothing above `Low` severity was found
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PremiumRow {
    user_id: String,
    premium_expires_at: Option<OffsetDateTime>,
}

const CHECKS: [&str; 3] = [
    "premium_has_expiry",
    "expiry_implies_premium",
    "expired_premium_flagged",
];

pub struct InvariantChecker {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = self.clock.now_utc();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations
                .iter()
                .all(|v| v.severity == ViolationSeverity::Low),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "premium_has_expiry" => self.check_premium_has_expiry().await,
            "expiry_implies_premium" => self.check_expiry_implies_premium().await,
            "expired_premium_flagged" => self.check_expired_premium_flagged().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Premium without an expiry never counts as active, so the flag is
    /// silently meaningless.
    async fn check_premium_has_expiry(&self) -> BillingResult<Vec<InvariantViolation>> {
        let user_ids: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM users WHERE is_premium = TRUE AND premium_expires_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(user_ids
            .into_iter()
            .map(|(user_id,)| InvariantViolation {
                invariant: "premium_has_expiry".to_string(),
                description: format!("User '{}' is premium with no expiry", user_id),
                context: serde_json::json!({}),
                user_ids: vec![user_id],
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Cancellation clears both columns together
    async fn check_expiry_implies_premium(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PremiumRow> = sqlx::query_as(
            r#"
            SELECT user_id, premium_expires_at
            FROM users
            WHERE is_premium = FALSE AND premium_expires_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expiry_implies_premium".to_string(),
                description: format!(
                    "User '{}' is not premium but has an expiry",
                    row.user_id
                ),
                context: serde_json::json!({
                    "premium_expires_at": row.premium_expires_at.map(|t| t.unix_timestamp()),
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Expected under lazy expiry; reported so lapsed subscribers are visible
    async fn check_expired_premium_flagged(&self) -> BillingResult<Vec<InvariantViolation>> {
        let now = self.clock.now_utc();
        let rows: Vec<PremiumRow> = sqlx::query_as(
            r#"
            SELECT user_id, premium_expires_at
            FROM users
            WHERE is_premium = TRUE AND premium_expires_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let lapsed: Vec<String> = rows
            .into_iter()
            .filter(|row| row.premium_expires_at.is_some_and(|t| t <= now))
            .map(|row| row.user_id)
            .collect();

        if lapsed.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "expired_premium_flagged".to_string(),
            description: format!("{} premium accounts have lapsed", lapsed.len()),
            context: serde_json::json!({ "count": lapsed.len() }),
            user_ids: lapsed,
            severity: ViolationSeverity::Low,
        }])
    }
}
