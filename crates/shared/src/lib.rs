#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotabot shared infrastructure
//!
//! Configuration loading and database setup used by every other crate.

pub mod config;
pub mod db;

pub use config::{ChannelCredentials, Config, ConfigError, QuotaConfig, DEFAULT_FREE_MONTHLY_LIMIT};
pub use db::{create_memory_pool, create_pool, run_migrations, MIGRATOR};
