//! Side effects requested by state transitions and the collaborators that perform them.
//!
//! Effects run after the record is committed. Their failures are logged and
//! counted, never propagated back into the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::metrics;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("collaborator not configured: {0}")]
    NotConfigured(&'static str),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    UserRequested,
    RepeatedFailures,
}

/// User-facing messages. `kind()` is the stable identifier used in logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Notification {
    PaymentSuccessful {
        tariff: String,
        end_date: DateTime<Utc>,
        auto_renewal: bool,
    },
    PaymentFailed {
        reason: String,
    },
    SubscriptionExpiring {
        days_left: i64,
        end_date: DateTime<Utc>,
    },
    SubscriptionExpired,
    AutoRenewalSucceeded {
        end_date: DateTime<Utc>,
    },
    AutoRenewalFailed {
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },
    AutoRenewalDisabled {
        reason: DisableReason,
        end_date: Option<DateTime<Utc>>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn render(&self) -> String {
        let date = |d: &DateTime<Utc>| d.format("%Y-%m-%d").to_string();
        match self {
            Notification::PaymentSuccessful {
                tariff,
                end_date,
                auto_renewal,
            } => {
                let renewal = if *auto_renewal {
                    "Auto-renewal is on."
                } else {
                    "Auto-renewal is off, renew manually before it ends."
                };
                format!(
                    "Payment received. Your {} subscription is active until {}. {}",
                    tariff,
                    date(end_date),
                    renewal
                )
            }
            Notification::PaymentFailed { reason } => {
                format!("The payment did not go through ({}). You can try again with /subscribe.", reason)
            }
            Notification::SubscriptionExpiring { days_left, end_date } => format!(
                "Your subscription ends in {} day(s), on {}.",
                days_left,
                date(end_date)
            ),
            Notification::SubscriptionExpired => {
                "Your subscription has ended. Use /subscribe to keep access to the group.".to_string()
            }
            Notification::AutoRenewalSucceeded { end_date } => {
                format!("Subscription renewed. Next payment on {}.", date(end_date))
            }
            Notification::AutoRenewalFailed {
                attempt,
                max_attempts,
                reason,
            } => format!(
                "Automatic renewal failed ({}), attempt {} of {}. We will try again tomorrow.",
                reason, attempt, max_attempts
            ),
            Notification::AutoRenewalDisabled { reason, end_date } => {
                let until = end_date
                    .map(|d| format!(" Access stays until {}.", date(&d)))
                    .unwrap_or_default();
                match reason {
                    DisableReason::UserRequested => format!("Auto-renewal is off.{}", until),
                    DisableReason::RepeatedFailures => format!(
                        "Auto-renewal was disabled after repeated payment failures. Please subscribe again with /subscribe.{}",
                        until
                    ),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Notify { user_id: i64, notification: Notification },
    RestoreGroupAccess { user_id: i64 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// Membership of the externally managed group or channel.
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn revoke(&self, user_id: i64) -> Result<(), CollaboratorError>;

    /// Lifts a previous removal so the user can join again.
    async fn restore(&self, user_id: i64) -> Result<(), CollaboratorError>;
}

/// Sends a notification, logging instead of failing.
pub async fn send_notification(notifier: &dyn Notifier, user_id: i64, notification: &Notification) -> bool {
    match notifier.notify(user_id, notification).await {
        Ok(()) => {
            metrics::record_notification(notification.kind(), true);
            true
        }
        Err(e) => {
            metrics::record_notification(notification.kind(), false);
            log::warn!("Failed to send {} to user {}: {}", notification.kind(), user_id, e);
            false
        }
    }
}

/// Runs effects in order; each failure is logged and the rest still run.
///
/// Removal from the group is not an effect: it has to succeed before the
/// record says so, see `SubscriptionService::revoke_access`.
pub async fn execute_effects(notifier: &dyn Notifier, membership: &dyn GroupMembership, effects: Vec<SideEffect>) {
    for effect in effects {
        match effect {
            SideEffect::Notify { user_id, notification } => {
                send_notification(notifier, user_id, &notification).await;
            }
            SideEffect::RestoreGroupAccess { user_id } => {
                if let Err(e) = membership.restore(user_id).await {
                    log::warn!("Failed to restore group access for user {}: {}", user_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_kinds_are_snake_case() {
        let end = Utc.with_ymd_and_hms(2024, 2, 9, 12, 0, 0).unwrap();
        assert_eq!(
            Notification::SubscriptionExpiring {
                days_left: 3,
                end_date: end
            }
            .kind(),
            "subscription_expiring"
        );
        assert_eq!(Notification::SubscriptionExpired.kind(), "subscription_expired");
        assert_eq!(
            Notification::AutoRenewalDisabled {
                reason: DisableReason::RepeatedFailures,
                end_date: None
            }
            .kind(),
            "auto_renewal_disabled"
        );
    }

    #[tokio::test]
    async fn test_failed_notification_does_not_stop_later_effects() {
        use crate::subscription::testing::{RecordingMembership, RecordingNotifier};

        let notifier = RecordingNotifier::default();
        let membership = RecordingMembership::default();
        notifier.fail_for(7);

        execute_effects(
            &notifier,
            &membership,
            vec![
                SideEffect::Notify {
                    user_id: 7,
                    notification: Notification::SubscriptionExpired,
                },
                SideEffect::RestoreGroupAccess { user_id: 7 },
            ],
        )
        .await;

        assert!(notifier.sent().is_empty());
        assert_eq!(membership.restored(), vec![7]);
        assert!(membership.revoked().is_empty());
    }

    #[test]
    fn test_render_mentions_dates_and_counts() {
        let end = Utc.with_ymd_and_hms(2024, 2, 9, 12, 0, 0).unwrap();
        let text = Notification::AutoRenewalFailed {
            attempt: 2,
            max_attempts: 3,
            reason: "insufficient_funds".into(),
        }
        .render();
        assert!(text.contains("2 of 3"));

        let text = Notification::PaymentSuccessful {
            tariff: "basic".into(),
            end_date: end,
            auto_renewal: true,
        }
        .render();
        assert!(text.contains("2024-02-09"));
    }
}
