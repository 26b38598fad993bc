// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Quotabot API Library
//!
//! HTTP surface over the account store and Stripe billing.

pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod test_helpers;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
