//! Environment-sourced configuration
//!
//! Every setting has a safe default except live credentials. Values that are
//! present but unparseable fail fast so a typo never silently falls back to a
//! default quota.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use time::UtcOffset;

/// Default free-tier allowance per calendar month
pub const DEFAULT_FREE_MONTHLY_LIMIT: u32 = 3;

/// Persistent volume used by hosted deployments when it is mounted
const PERSISTENT_DATA_DIR: &str = "/data";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Quota accounting rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Usages allowed per month for accounts without active premium
    pub free_monthly_limit: u32,
    /// Offset used to derive the `YYYY-MM` month bucket from a UTC timestamp
    pub utc_offset: UtcOffset,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_monthly_limit: DEFAULT_FREE_MONTHLY_LIMIT,
            utc_offset: UtcOffset::UTC,
        }
    }
}

/// Messaging channel credentials
#[derive(Clone, Default)]
pub struct ChannelCredentials {
    pub channel_secret: String,
    pub channel_access_token: String,
}

impl ChannelCredentials {
    pub fn is_configured(&self) -> bool {
        !self.channel_secret.is_empty() && !self.channel_access_token.is_empty()
    }
}

impl std::fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCredentials")
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// Process-wide configuration, built once in `main` and passed to constructors
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub quota: QuotaConfig,
    pub channel: ChannelCredentials,
    /// Stripe routes are disabled when false, even with credentials present
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = non_empty(&lookup, "DATABASE_URL").unwrap_or_else(default_database_url);

        let free_monthly_limit = parse_or(
            &lookup,
            "FREE_MONTHLY_LIMIT",
            DEFAULT_FREE_MONTHLY_LIMIT,
        )?;

        let offset_hours: i8 = parse_or(&lookup, "QUOTA_UTC_OFFSET_HOURS", 0)?;
        if !(-23..=23).contains(&offset_hours) {
            return Err(ConfigError::Invalid {
                key: "QUOTA_UTC_OFFSET_HOURS",
                value: offset_hours.to_string(),
                reason: "must be between -23 and 23".to_string(),
            });
        }
        let utc_offset =
            UtcOffset::from_hms(offset_hours, 0, 0).map_err(|e| ConfigError::Invalid {
                key: "QUOTA_UTC_OFFSET_HOURS",
                value: offset_hours.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            database_url,
            host: non_empty(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "PORT", 8000)?,
            quota: QuotaConfig {
                free_monthly_limit,
                utc_offset,
            },
            channel: ChannelCredentials {
                channel_secret: non_empty(&lookup, "LINE_CHANNEL_SECRET").unwrap_or_default(),
                channel_access_token: non_empty(&lookup, "LINE_CHANNEL_ACCESS_TOKEN")
                    .unwrap_or_default(),
            },
            enable_billing: parse_bool_or(&lookup, "ENABLE_BILLING", true)?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Prefer the persistent volume when mounted, else a file in the working directory
fn default_database_url() -> String {
    if Path::new(PERSISTENT_DATA_DIR).is_dir() {
        format!("sqlite://{}/users.db", PERSISTENT_DATA_DIR)
    } else {
        "sqlite://users.db".to_string()
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a required, non-empty value
pub fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key).ok_or(ConfigError::Missing(key))
}

/// Read an optional value, treating blank as absent
pub fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key)
}

/// Parse a value, falling back to `default` only when the key is absent or blank
pub fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
