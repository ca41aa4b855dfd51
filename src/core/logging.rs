//! Logging initialization and startup diagnostics

use anyhow::Result;
use simplelog::*;
use std::fs::OpenOptions;

use crate::core::config;

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file (appended to, created if missing)
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to open the file or a logger is already set
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs the effective lifecycle configuration at startup. Secrets are never printed.
pub fn log_startup_configuration() {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("Subscription engine configuration");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("Database: {}", *config::DATABASE_PATH);
    log::info!("Payment provider: {}", *config::payments::PROVIDER);
    log::info!(
        "Default tariff: {} ({})",
        *config::subscription::DEFAULT_TARIFF,
        *config::subscription::CURRENCY
    );
    log::info!(
        "Period: {} days, grace: {} days, reminders: {:?}",
        *config::subscription::PERIOD_DAYS,
        *config::subscription::GRACE_PERIOD_DAYS,
        *config::subscription::REMINDER_OFFSETS
    );
    log::info!(
        "Renewal: max {} attempts, provider timeout {:?}",
        *config::subscription::MAX_BILLING_ATTEMPTS,
        config::payments::provider_timeout()
    );
    match *config::GROUP_CHAT_ID {
        Some(id) => log::info!("Managed group: {}", id),
        None => log::warn!("GROUP_CHAT_ID is not set, access revocation will fail"),
    }
    if config::admin::ADMIN_IDS.is_empty() {
        log::warn!("ADMIN_IDS is not set, prices can only be changed through the environment");
    } else {
        log::info!("Administrators: {:?}", *config::admin::ADMIN_IDS);
    }
    if config::webhook::SECRET.is_none() && config::payments::SECRET_KEY.is_none() {
        log::warn!("No webhook secret configured, every inbound payment webhook will be rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_logger_with_valid_path() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        // May fail if another test already installed the global logger
        let _ = init_logger(path);
        assert!(temp_file.path().exists());
    }

    #[test]
    fn test_init_logger_with_invalid_path() {
        let result = init_logger("/nonexistent/directory/that/should/not/exist/log.txt");
        assert!(result.is_err());
    }
}
