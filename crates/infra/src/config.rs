//! Configuration loading and representation.
//!
//! Everything is read from environment variables. Unset variables fall back to the
//! defaults below; set-but-invalid variables are an error.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | none |
//! | `ROLLCALL_DB_MAX_CONNECTIONS` | 5 |
//! | `ROLLCALL_POLL_INTERVAL_MS` | 5000 |
//! | `ROLLCALL_BATCH_SIZE` | 10 |
//! | `ROLLCALL_CONCURRENCY` | 3 |
//! | `ROLLCALL_BACKOFF_BASE_MS` | 1000 |
//! | `ROLLCALL_HANDLER_TIMEOUT_MS` | none (no timeout) |
//! | `ROLLCALL_OFFER_TTL_HOURS` | 24 |
//! | `ROLLCALL_CLEANUP_INTERVAL_SECS` | 900 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::types::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid value: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
}

/// Job processor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Used in log lines.
    pub name: String,
    pub poll_interval: Duration,
    /// Jobs fetched per tick.
    pub batch_size: usize,
    /// Jobs run at the same time within a tick.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub handler_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "rollcall-processor".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            concurrency: 3,
            backoff: BackoffPolicy::default(),
            handler_timeout: None,
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }
}

/// Waitlist promotion settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionConfig {
    /// How long a student has to answer an offer.
    pub offer_ttl: Duration,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PromotionConfig {
    pub fn with_offer_ttl(mut self, ttl: Duration) -> Self {
        self.offer_ttl = ttl;
        self
    }

    /// Whole hours of the offer TTL, as told to the student.
    pub fn response_deadline_hours(&self) -> u64 {
        self.offer_ttl.as_secs() / 3600
    }
}

/// Full worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollcallConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub processor: ProcessorConfig,
    pub promotion: PromotionConfig,
    pub cleanup_interval: Duration,
}

impl Default for RollcallConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            processor: ProcessorConfig::default(),
            promotion: PromotionConfig::default(),
            cleanup_interval: Duration::from_secs(15 * 60),
        }
    }
}

impl RollcallConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let backoff_default = defaults.processor.backoff;

        let processor = ProcessorConfig {
            name: defaults.processor.name.clone(),
            poll_interval: parse_or(&lookup, "ROLLCALL_POLL_INTERVAL_MS", 5000)
                .and_then(|ms| positive("ROLLCALL_POLL_INTERVAL_MS", ms))
                .map(Duration::from_millis)?,
            batch_size: parse_or(&lookup, "ROLLCALL_BATCH_SIZE", defaults.processor.batch_size)
                .and_then(|n| positive("ROLLCALL_BATCH_SIZE", n))?,
            concurrency: parse_or(&lookup, "ROLLCALL_CONCURRENCY", defaults.processor.concurrency)
                .and_then(|n| positive("ROLLCALL_CONCURRENCY", n))?,
            backoff: BackoffPolicy::new(
                Duration::from_millis(parse_or(&lookup, "ROLLCALL_BACKOFF_BASE_MS", 1000)?),
                backoff_default.max_delay,
            ),
            handler_timeout: parse_opt::<u64, _>(&lookup, "ROLLCALL_HANDLER_TIMEOUT_MS")?
                .map(|ms| positive("ROLLCALL_HANDLER_TIMEOUT_MS", ms))
                .transpose()?
                .map(Duration::from_millis),
        };

        let offer_ttl = parse_or(&lookup, "ROLLCALL_OFFER_TTL_HOURS", 24u64)
            .and_then(|h| positive("ROLLCALL_OFFER_TTL_HOURS", h))
            .and_then(offer_ttl_from_hours)?;
        let cleanup_secs = parse_or(&lookup, "ROLLCALL_CLEANUP_INTERVAL_SECS", 900u64)
            .and_then(|s| positive("ROLLCALL_CLEANUP_INTERVAL_SECS", s))?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections: parse_or(&lookup, "ROLLCALL_DB_MAX_CONNECTIONS", defaults.max_connections)
                .and_then(|n| positive("ROLLCALL_DB_MAX_CONNECTIONS", n))?,
            processor,
            promotion: PromotionConfig::default()
                .with_offer_ttl(offer_ttl),
            cleanup_interval: Duration::from_secs(cleanup_secs),
        })
    }
}

/// Offers longer than a year are rejected.
const MAX_OFFER_TTL_HOURS: u64 = 24 * 366;

fn offer_ttl_from_hours(hours: u64) -> Result<Duration, ConfigError> {
    hours
        .checked_mul(60 * 60)
        .filter(|_| hours <= MAX_OFFER_TTL_HOURS)
        .map(Duration::from_secs)
        .ok_or(ConfigError::Invalid {
            name: "ROLLCALL_OFFER_TTL_HOURS",
            value: hours.to_string(),
        })
}

fn parse_opt<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, name)?.unwrap_or(default))
}

fn positive<T>(name: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialEq + Default,
{
    if value == T::default() {
        return Err(ConfigError::Zero { name });
    }
    Ok(value)
}
