//! Expiry reminders a fixed number of days before the end date.
//!
//! Offsets map to distinct calendar days, so each offset reaches a user at
//! most once per period. Within a day, `last_reminder_sent` makes reruns
//! harmless; it is written only after the message went out.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::storage::{SubscriptionPatch, UserSubscriptionRecord};
use crate::subscription::effects::{send_notification, Notification};
use crate::subscription::error::ServiceResult;
use crate::subscription::service::SubscriptionService;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReminderReport {
    pub sent: usize,
    pub already_sent: usize,
    pub failed: usize,
}

/// Reminders due `today` for the given expiring records.
pub fn plan_reminders(records: &[UserSubscriptionRecord], today: NaiveDate) -> Vec<(i64, Notification)> {
    records
        .iter()
        .filter(|record| record.last_reminder_sent != Some(today))
        .filter_map(|record| {
            let end_date = record.subscription_end_date?;
            let days_left = (end_date.date_naive() - today).num_days();
            Some((record.user_id, Notification::SubscriptionExpiring { days_left, end_date }))
        })
        .collect()
}

pub struct ReminderScheduler {
    service: Arc<SubscriptionService>,
}

impl ReminderScheduler {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    pub async fn run_once(&self) -> ServiceResult<ReminderReport> {
        let now = self.service.now();
        let today = now.date_naive();
        let offsets = &self.service.policy().reminder_offsets;

        let expiring = self.service.users().find_expiring_on(today, offsets)?;
        let planned = plan_reminders(&expiring, today);
        let mut report = ReminderReport {
            already_sent: expiring.len() - planned.len(),
            ..Default::default()
        };

        for (user_id, notification) in planned {
            if !send_notification(self.service.notifier(), user_id, &notification).await {
                report.failed += 1;
                continue;
            }
            let patch = SubscriptionPatch {
                last_reminder_sent: Some(Some(today)),
                ..Default::default()
            };
            match self.service.users().upsert(user_id, &patch, now) {
                Ok(_) => report.sent += 1,
                Err(e) => {
                    // Sent but not recorded: a rerun today may repeat it
                    log::error!("Failed to record reminder for user {}: {}", user_id, e);
                    report.sent += 1;
                }
            }
        }

        log::info!(
            "Reminders for {}: {} sent, {} already sent, {} failed",
            today,
            report.sent,
            report.already_sent,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn expiring(user_id: i64, end: chrono::DateTime<Utc>, last: Option<NaiveDate>) -> UserSubscriptionRecord {
        let mut record = UserSubscriptionRecord::new(user_id, end - Duration::days(30));
        record.subscription_active = true;
        record.subscription_end_date = Some(end);
        record.last_reminder_sent = last;
        record
    }

    #[test]
    fn test_days_left_is_calendar_distance() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 13, 23, 59, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 1).unwrap();

        let planned = plan_reminders(&[expiring(1, late, None), expiring(2, early, None)], today);
        assert_eq!(
            planned,
            vec![
                (
                    1,
                    Notification::SubscriptionExpiring {
                        days_left: 3,
                        end_date: late
                    }
                ),
                (
                    2,
                    Notification::SubscriptionExpiring {
                        days_left: 1,
                        end_date: early
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_already_reminded_today_is_skipped() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 17, 9, 0, 0).unwrap();
        let yesterday = today.pred_opt();

        assert!(plan_reminders(&[expiring(1, end, Some(today))], today).is_empty());
        assert_eq!(plan_reminders(&[expiring(1, end, yesterday)], today).len(), 1);
    }
}
