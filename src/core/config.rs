use once_cell::sync::Lazy;
use secrecy::SecretString;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{AppError, AppResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring unparsable {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

/// Telegram bot token
/// Read from BOT_TOKEN, falling back to TELOXIDE_TOKEN
pub static BOT_TOKEN: Lazy<Option<SecretString>> = Lazy::new(|| env_secret("BOT_TOKEN").or_else(|| env_secret("TELOXIDE_TOKEN")));

/// Bot username without '@', used for deep links (demo provider)
pub static BOT_USERNAME: Lazy<String> =
    Lazy::new(|| env::var("BOT_USERNAME").unwrap_or_else(|_| "subgate_bot".to_string()));

/// Group or channel the subscription grants access to
pub static GROUP_CHAT_ID: Lazy<Option<i64>> = Lazy::new(|| env::var("GROUP_CHAT_ID").ok().and_then(|v| v.trim().parse().ok()));

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: subgate.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "subgate.sqlite".to_string()));

/// Log file path
/// Default: subgate.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "subgate.log".to_string()));

/// SQLite busy timeout; a write waiting longer than this fails instead of hanging
pub static DB_BUSY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| env_or("DB_BUSY_TIMEOUT_SECS", 10));

pub fn db_busy_timeout() -> Duration {
    Duration::from_secs(*DB_BUSY_TIMEOUT_SECS)
}

/// Subscription lifecycle settings
pub mod subscription {
    use super::*;

    /// Tariff used when the user does not name one
    pub static DEFAULT_TARIFF: Lazy<String> =
        Lazy::new(|| env::var("DEFAULT_TARIFF").unwrap_or_else(|_| "basic".to_string()));

    /// ISO currency for all tariffs
    pub static CURRENCY: Lazy<String> = Lazy::new(|| env::var("CURRENCY").unwrap_or_else(|_| "RUB".to_string()));

    /// Prices in minor units (kopecks, cents)
    pub static BASIC_PRICE: Lazy<i64> = Lazy::new(|| env_or("TARIFF_BASIC_PRICE", 40_000));
    pub static STANDARD_PRICE: Lazy<i64> = Lazy::new(|| env_or("TARIFF_STANDARD_PRICE", 55_000));
    pub static PREMIUM_PRICE: Lazy<i64> = Lazy::new(|| env_or("TARIFF_PREMIUM_PRICE", 75_000));

    /// Length of one paid period
    pub static PERIOD_DAYS: Lazy<i64> = Lazy::new(|| env_or("SUBSCRIPTION_PERIOD_DAYS", 30));

    /// Days after expiry before the user is removed from the group
    pub static GRACE_PERIOD_DAYS: Lazy<i64> = Lazy::new(|| env_or("GRACE_PERIOD_DAYS", 2));

    /// Consecutive renewal failures after which auto-renewal is switched off
    pub static MAX_BILLING_ATTEMPTS: Lazy<u32> = Lazy::new(|| env_or("MAX_BILLING_ATTEMPTS", 3));

    /// Days before expiry at which reminders go out, e.g. "7,3,1"
    pub static REMINDER_OFFSETS: Lazy<Vec<i64>> = Lazy::new(|| {
        env::var("REMINDER_OFFSETS")
            .ok()
            .map(|raw| parse_offsets(&raw))
            .filter(|offsets| !offsets.is_empty())
            .unwrap_or_else(|| vec![7, 3, 1])
    });

    pub fn parse_offsets(raw: &str) -> Vec<i64> {
        let mut offsets: Vec<i64> = raw
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .filter(|days| *days >= 0)
            .collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));
        offsets.dedup();
        offsets
    }
}

/// Payment provider settings
pub mod payments {
    use super::*;

    /// demo | redirect | telegram | recurring_api
    pub static PROVIDER: Lazy<String> =
        Lazy::new(|| env::var("PAYMENT_PROVIDER").unwrap_or_else(|_| "demo".to_string()));

    pub static SHOP_ID: Lazy<Option<String>> = Lazy::new(|| env::var("PAYMENT_SHOP_ID").ok());

    pub static SECRET_KEY: Lazy<Option<SecretString>> = Lazy::new(|| env_secret("PAYMENT_SECRET_KEY"));

    /// REST endpoint of the recurring-charge API
    pub static API_URL: Lazy<String> =
        Lazy::new(|| env::var("PAYMENT_API_URL").unwrap_or_else(|_| "https://api.yookassa.ru/v3".to_string()));

    /// Hosted payment form of the redirect-link gateway
    pub static FORM_URL: Lazy<Option<String>> = Lazy::new(|| env::var("PAYMENT_FORM_URL").ok());

    /// Where the provider sends the user after paying
    pub static RETURN_URL: Lazy<String> = Lazy::new(|| {
        env::var("PAYMENT_RETURN_URL").unwrap_or_else(|_| format!("https://t.me/{}", *super::BOT_USERNAME))
    });

    /// Live mode; test mode providers do not keep reusable methods
    pub static LIVE_MODE: Lazy<bool> = Lazy::new(|| env_or("PAYMENT_LIVE_MODE", false));

    /// Demo provider confirms subscription intents immediately
    pub static DEMO_AUTO_COMPLETE: Lazy<bool> = Lazy::new(|| env_or("DEMO_AUTO_COMPLETE", true));

    pub static PROVIDER_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| env_or("PROVIDER_TIMEOUT_SECS", 30));

    pub fn provider_timeout() -> Duration {
        Duration::from_secs(*PROVIDER_TIMEOUT_SECS)
    }

    /// Pending intents older than this are marked expired by the sweeper
    pub static INTENT_TTL_HOURS: Lazy<i64> = Lazy::new(|| env_or("INTENT_TTL_HOURS", 24));
}

/// Inbound webhook server settings
pub mod webhook {
    use super::*;

    pub static BIND_ADDR: Lazy<String> =
        Lazy::new(|| env::var("WEBHOOK_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()));

    /// HMAC key for inbound webhooks; falls back to PAYMENT_SECRET_KEY
    pub static SECRET: Lazy<Option<SecretString>> = Lazy::new(|| env_secret("WEBHOOK_SECRET"));
}

/// Background sweeper settings
pub mod sweeper {
    use super::*;

    pub static INTERVAL_SECS: Lazy<u64> = Lazy::new(|| env_or("SWEEP_INTERVAL_SECS", 86_400));

    pub fn interval() -> Duration {
        Duration::from_secs(*INTERVAL_SECS)
    }

    /// Users processed in parallel within one pass
    pub static CONCURRENCY: Lazy<usize> = Lazy::new(|| env_or("SWEEP_CONCURRENCY", 4));

    /// Upper bound on waiting for another operation on the same user
    pub static USER_LOCK_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| env_or("USER_LOCK_TIMEOUT_SECS", 35));

    pub fn user_lock_timeout() -> Duration {
        Duration::from_secs(*USER_LOCK_TIMEOUT_SECS)
    }
}

/// Administrator settings
pub mod admin {
    use super::*;

    pub fn parse_admin_ids(raw: &str) -> Vec<i64> {
        raw.split([',', ' ', '\n', '\t'])
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect()
    }

    /// Telegram user ids allowed to change prices (comma-separated)
    /// Read from ADMIN_IDS, falling back to TELEGRAM_ADMIN_IDS
    pub static ADMIN_IDS: Lazy<Vec<i64>> = Lazy::new(|| {
        env::var("ADMIN_IDS")
            .or_else(|_| env::var("TELEGRAM_ADMIN_IDS"))
            .ok()
            .map(|raw| parse_admin_ids(&raw))
            .unwrap_or_default()
    });
}

/// Checks that the configuration is usable for `subgate run`.
pub fn validate() -> AppResult<()> {
    if BOT_TOKEN.is_none() {
        return Err(AppError::Validation("BOT_TOKEN (or TELOXIDE_TOKEN) is not set".into()));
    }
    if GROUP_CHAT_ID.is_none() {
        return Err(AppError::Validation("GROUP_CHAT_ID is not set".into()));
    }
    match PROVIDER_KINDS.iter().find(|kind| **kind == payments::PROVIDER.as_str()) {
        None => {
            return Err(AppError::Validation(format!(
                "Unknown PAYMENT_PROVIDER '{}', expected one of {:?}",
                *payments::PROVIDER,
                PROVIDER_KINDS
            )))
        }
        Some(&"redirect") | Some(&"recurring_api") if payments::SECRET_KEY.is_none() => {
            return Err(AppError::Validation(format!(
                "PAYMENT_SECRET_KEY is required for provider '{}'",
                *payments::PROVIDER
            )))
        }
        Some(&"redirect") if payments::FORM_URL.is_none() => {
            return Err(AppError::Validation("PAYMENT_FORM_URL is required for provider 'redirect'".into()))
        }
        Some(_) => {}
    }
    if *subscription::PERIOD_DAYS <= 0 {
        return Err(AppError::Validation("SUBSCRIPTION_PERIOD_DAYS must be positive".into()));
    }
    if *subscription::MAX_BILLING_ATTEMPTS == 0 {
        return Err(AppError::Validation("MAX_BILLING_ATTEMPTS must be at least 1".into()));
    }
    Ok(())
}

pub const PROVIDER_KINDS: [&str; 4] = ["demo", "redirect", "telegram", "recurring_api"];
