//! Coordinator configuration loaded from environment variables.

use std::time::Duration;

/// Tunables for the coordinator.
///
/// Reads from environment variables:
/// - `COORDINATOR_DEFAULT_TIMEOUT_MS`: transaction timeout when none is given (default: `30000`)
/// - `COORDINATOR_LOCK_TTL_MS`: lock lease when none is given (default: `30000`)
/// - `COORDINATOR_OUTBOX_BATCH_SIZE`: messages per drain (default: `100`)
/// - `COORDINATOR_OUTBOX_MAX_ATTEMPTS`: failures before dead-lettering (default: `5`)
/// - `COORDINATOR_OUTBOX_BACKOFF_BASE_MS`: first retry delay (default: `1000`)
/// - `COORDINATOR_OUTBOX_RETENTION_LIMIT`: outbox size that triggers trimming (default: `100000`)
/// - `COORDINATOR_OUTBOX_RETENTION_TRIM`: oldest entries dropped per trim (default: `10000`)
/// - `COORDINATOR_OUTBOX_CLAIM_LEASE_MS`: in-flight lease for async relays (default: `30000`)
/// - `COORDINATOR_PARTICIPANT_MAX_RETRIES`: failures before a participant is failed (default: `3`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub default_timeout: Duration,
    pub default_lock_ttl: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
    pub outbox_backoff_base: Duration,
    pub outbox_retention_limit: usize,
    pub outbox_retention_trim: usize,
    pub outbox_claim_lease: Duration,
    pub participant_max_retries: u32,
}

impl CoordinatorConfig {
    /// Loads configuration from environment variables, falling back to defaults
    /// for anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout: env_millis("COORDINATOR_DEFAULT_TIMEOUT_MS")
                .unwrap_or(defaults.default_timeout),
            default_lock_ttl: env_millis("COORDINATOR_LOCK_TTL_MS")
                .unwrap_or(defaults.default_lock_ttl),
            outbox_batch_size: env_parse("COORDINATOR_OUTBOX_BATCH_SIZE")
                .unwrap_or(defaults.outbox_batch_size),
            outbox_max_attempts: env_parse("COORDINATOR_OUTBOX_MAX_ATTEMPTS")
                .unwrap_or(defaults.outbox_max_attempts),
            outbox_backoff_base: env_millis("COORDINATOR_OUTBOX_BACKOFF_BASE_MS")
                .unwrap_or(defaults.outbox_backoff_base),
            outbox_retention_limit: env_parse("COORDINATOR_OUTBOX_RETENTION_LIMIT")
                .unwrap_or(defaults.outbox_retention_limit),
            outbox_retention_trim: env_parse("COORDINATOR_OUTBOX_RETENTION_TRIM")
                .unwrap_or(defaults.outbox_retention_trim),
            outbox_claim_lease: env_millis("COORDINATOR_OUTBOX_CLAIM_LEASE_MS")
                .unwrap_or(defaults.outbox_claim_lease),
            participant_max_retries: env_parse("COORDINATOR_PARTICIPANT_MAX_RETRIES")
                .unwrap_or(defaults.participant_max_retries),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            default_lock_ttl: Duration::from_millis(30_000),
            outbox_batch_size: 100,
            outbox_max_attempts: 5,
            outbox_backoff_base: Duration::from_secs(1),
            outbox_retention_limit: 100_000,
            outbox_retention_trim: 10_000,
            outbox_claim_lease: Duration::from_millis(30_000),
            participant_max_retries: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
