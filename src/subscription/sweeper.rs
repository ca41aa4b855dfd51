//! Periodic sweep: renewals, expiries, revocations and stale intents.
//!
//! Users are processed concurrently up to the policy's sweep concurrency,
//! each with its own lock and provider timeout, so one slow user never holds
//! up the others. A failure for one user is logged and counted; the batch
//! always runs to the end.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::subscription::error::ServiceResult;
use crate::subscription::reminders::ReminderScheduler;
use crate::subscription::service::{RenewalResult, SubscriptionService};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub renewed: usize,
    pub renewal_failed: usize,
    pub renewals_disabled: usize,
    pub expired: usize,
    pub revoked: usize,
    pub revoke_failed: usize,
    pub intents_expired: usize,
    pub errors: usize,
}

pub struct RenewalSweeper {
    service: Arc<SubscriptionService>,
}

impl RenewalSweeper {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    pub async fn run_once(&self) -> ServiceResult<SweepReport> {
        let mut report = SweepReport::default();
        let concurrency = self.service.policy().sweep_concurrency.max(1);

        // Pass 1: renewals
        let due = candidates(self.service.renewal_candidates(), "renewal", &mut report);
        let results: Vec<_> = stream::iter(due)
            .map(|user_id| {
                let service = Arc::clone(&self.service);
                async move { (user_id, service.renew(user_id).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for (user_id, result) in results {
            match result {
                Ok(RenewalResult::Renewed { .. }) => report.renewed += 1,
                Ok(RenewalResult::Failed { .. }) => report.renewal_failed += 1,
                Ok(RenewalResult::Disabled) => report.renewals_disabled += 1,
                Ok(RenewalResult::Skipped) => {}
                Err(e) => {
                    report.errors += 1;
                    log::error!("Renewal for user {} aborted: {}", user_id, e);
                }
            }
        }

        // Pass 2: end dates passed with nothing to renew them
        for user_id in candidates(self.service.expiry_candidates(), "expiry", &mut report) {
            match self.service.expire(user_id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    log::error!("Failed to expire subscription of user {}: {}", user_id, e);
                }
            }
        }

        // Pass 3: lapsed beyond the grace period
        let lapsed = candidates(self.service.revocation_candidates(), "revocation", &mut report);
        let results: Vec<_> = stream::iter(lapsed)
            .map(|user_id| {
                let service = Arc::clone(&self.service);
                async move { (user_id, service.revoke_access(user_id).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for (user_id, result) in results {
            match result {
                Ok(true) => report.revoked += 1,
                Ok(false) => {}
                Err(e) => {
                    report.revoke_failed += 1;
                    log::warn!("Could not revoke group access for user {}: {}", user_id, e);
                }
            }
        }

        match self.service.expire_stale_intents() {
            Ok(count) => report.intents_expired = count,
            Err(e) => {
                report.errors += 1;
                log::error!("Failed to expire stale payment intents: {}", e);
            }
        }

        log::info!(
            "Sweep done: {} renewed, {} renewal failures, {} disabled, {} expired, {} revoked, {} revoke failures, {} intents expired, {} errors",
            report.renewed,
            report.renewal_failed,
            report.renewals_disabled,
            report.expired,
            report.revoked,
            report.revoke_failed,
            report.intents_expired,
            report.errors
        );
        Ok(report)
    }
}

/// A failed candidate query skips only its own pass.
fn candidates(result: ServiceResult<Vec<i64>>, pass: &str, report: &mut SweepReport) -> Vec<i64> {
    result.unwrap_or_else(|e| {
        report.errors += 1;
        log::error!("Could not load {} candidates: {}", pass, e);
        Vec::new()
    })
}

/// Starts the background task running a sweep and a reminder pass every `every`.
/// The first tick fires immediately.
pub fn start_scheduler(service: Arc<SubscriptionService>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sweeper = RenewalSweeper::new(Arc::clone(&service));
        let reminders = ReminderScheduler::new(service);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Subscription scheduler started (interval: {}s)", every.as_secs());

        loop {
            ticker.tick().await;

            if let Err(e) = sweeper.run_once().await {
                log::error!("Sweep failed: {}", e);
            }
            if let Err(e) = reminders.run_once().await {
                log::error!("Reminder pass failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_memory_pool, get_connection};
    use crate::subscription::testing::{FixedClock, RecordingMembership, RecordingNotifier, ScriptedProvider};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_failed_query_skips_only_its_pass() {
        let pool = create_memory_pool().unwrap();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()));
        let service = Arc::new(
            SubscriptionService::new(
                pool.clone(),
                Arc::new(ScriptedProvider::new()),
                Arc::new(RecordingNotifier::default()),
                Arc::new(RecordingMembership::default()),
            )
            .with_clock(clock.clone()),
        );
        service.purchase(42, None).await.unwrap();
        clock.advance(chrono::Duration::hours(25));

        get_connection(&pool).unwrap().execute_batch("DROP TABLE users").unwrap();

        let report = RenewalSweeper::new(service).run_once().await.unwrap();
        assert_eq!(report.errors, 3);
        assert_eq!(report.intents_expired, 1);
    }

    #[test]
    fn test_candidates_counts_the_error() {
        let mut report = SweepReport::default();
        let loaded = candidates(Ok(vec![1, 2]), "renewal", &mut report);
        assert_eq!(loaded, vec![1, 2]);
        assert_eq!(report.errors, 0);

        let failed = candidates(
            Err(crate::subscription::error::ServiceError::ManualCompletionUnsupported),
            "renewal",
            &mut report,
        );
        assert!(failed.is_empty());
        assert_eq!(report.errors, 1);
    }
}
