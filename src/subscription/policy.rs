use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::config;

/// Source of "now" for the engine; swapped for a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lifecycle tunables, built once at startup and injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub max_billing_attempts: u32,
    pub grace_period_days: i64,
    pub reminder_offsets: Vec<i64>,
    pub provider_timeout: Duration,
    pub user_lock_timeout: Duration,
    pub intent_ttl: chrono::Duration,
    pub sweep_concurrency: usize,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_billing_attempts: 3,
            grace_period_days: 2,
            reminder_offsets: vec![7, 3, 1],
            provider_timeout: Duration::from_secs(30),
            user_lock_timeout: Duration::from_secs(35),
            intent_ttl: chrono::Duration::hours(24),
            sweep_concurrency: 4,
        }
    }
}

impl LifecyclePolicy {
    pub fn from_config() -> Self {
        Self {
            max_billing_attempts: *config::subscription::MAX_BILLING_ATTEMPTS,
            grace_period_days: *config::subscription::GRACE_PERIOD_DAYS,
            reminder_offsets: config::subscription::REMINDER_OFFSETS.clone(),
            provider_timeout: config::payments::provider_timeout(),
            user_lock_timeout: config::sweeper::user_lock_timeout(),
            intent_ttl: chrono::Duration::hours(*config::payments::INTENT_TTL_HOURS),
            sweep_concurrency: (*config::sweeper::CONCURRENCY).max(1),
        }
    }
}
