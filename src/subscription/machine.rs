//! Subscription lifecycle as a pure function of (record, event, now).
//!
//! Nothing here touches storage or the network. [`transition`] returns a
//! [`Decision`]: the patch to commit, the payment event to append and the
//! side effects to run once the commit succeeded.

use chrono::{DateTime, Duration, Utc};

use crate::storage::{PaymentEvent, PaymentKind, PaymentStatus, SubscriptionPatch, UserSubscriptionRecord};
use crate::subscription::effects::{DisableReason, Notification, SideEffect};
use crate::subscription::policy::LifecyclePolicy;

/// Derived state of a record. Pending payments live in intents, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoSubscription,
    Active { auto_renewal: bool },
    /// Inactive, still in the group
    Lapsed,
    /// Inactive and removed from the group
    Revoked,
}

pub fn lifecycle_state(record: &UserSubscriptionRecord) -> LifecycleState {
    if record.subscription_active {
        LifecycleState::Active {
            auto_renewal: record.auto_renewal,
        }
    } else if record.left_group {
        LifecycleState::Revoked
    } else if record.subscription_end_date.is_some() {
        LifecycleState::Lapsed
    } else {
        LifecycleState::NoSubscription
    }
}

/// A payment the provider confirmed as captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedPayment {
    pub order_ref: Option<String>,
    pub charge_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub tariff: String,
    pub period: Duration,
    pub kind: PaymentKind,
    /// Present only when the provider saved the method for reuse
    pub payment_method_ref: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPayment {
    pub order_ref: Option<String>,
    pub charge_id: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub tariff: Option<String>,
    pub kind: PaymentKind,
    pub reason: String,
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Charged { charge_id: String },
    Failed { reason: String, charge_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalAttempt {
    pub outcome: RenewalOutcome,
    /// Order reference of the renewal intent; provider notices resolve to it
    pub order_ref: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub tariff: String,
    pub period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    PaymentConfirmed(ConfirmedPayment),
    PaymentFailed(FailedPayment),
    AutoRenewalCancelled,
    RenewalAttempted(RenewalAttempt),
    /// End date passed with nothing to renew it
    Expired,
    /// The user was removed from the group
    AccessRevoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Same payment seen before; nothing to write, no effects
    Duplicate,
    /// Event does not apply in the current state
    Skipped(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub patch: SubscriptionPatch,
    pub append: Option<PaymentEvent>,
    pub effects: Vec<SideEffect>,
    pub outcome: Outcome,
}

impl Decision {
    fn applied(patch: SubscriptionPatch, append: Option<PaymentEvent>, effects: Vec<SideEffect>) -> Self {
        Self {
            patch,
            append,
            effects,
            outcome: Outcome::Applied,
        }
    }

    fn duplicate() -> Self {
        Self {
            patch: SubscriptionPatch::default(),
            append: None,
            effects: Vec::new(),
            outcome: Outcome::Duplicate,
        }
    }

    fn skipped(reason: &'static str) -> Self {
        Self {
            patch: SubscriptionPatch::default(),
            append: None,
            effects: Vec::new(),
            outcome: Outcome::Skipped(reason),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.outcome == Outcome::Applied
    }
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Renewal is attempted from the end date's calendar day on, while attempts remain.
pub fn renewal_due(record: &UserSubscriptionRecord, policy: &LifecyclePolicy, now: DateTime<Utc>) -> bool {
    record.subscription_active
        && record.auto_renewal
        && record.payment_method_ref.is_some()
        && record.billing_attempts < policy.max_billing_attempts
        && record
            .subscription_end_date
            .is_some_and(|end| end.date_naive() <= now.date_naive())
}

pub fn expiry_due(record: &UserSubscriptionRecord, now: DateTime<Utc>) -> bool {
    record.subscription_active && !record.auto_renewal && record.subscription_end_date.is_some_and(|end| end < now)
}

pub fn revocation_due(record: &UserSubscriptionRecord, policy: &LifecyclePolicy, now: DateTime<Utc>) -> bool {
    !record.subscription_active
        && !record.left_group
        && record
            .subscription_end_date
            .is_some_and(|end| end < now - Duration::days(policy.grace_period_days))
}

pub fn transition(
    record: &UserSubscriptionRecord,
    event: LifecycleEvent,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> Decision {
    match event {
        LifecycleEvent::PaymentConfirmed(payment) => on_payment_confirmed(record, payment, now),
        LifecycleEvent::PaymentFailed(payment) => on_payment_failed(record, payment),
        LifecycleEvent::AutoRenewalCancelled => on_auto_renewal_cancelled(record),
        LifecycleEvent::RenewalAttempted(attempt) => on_renewal_attempted(record, attempt, policy, now),
        LifecycleEvent::Expired => {
            if !expiry_due(record, now) {
                return Decision::skipped("subscription is not past its end date");
            }
            let patch = SubscriptionPatch {
                subscription_active: Some(false),
                ..Default::default()
            };
            Decision::applied(
                patch,
                None,
                vec![SideEffect::Notify {
                    user_id: record.user_id,
                    notification: Notification::SubscriptionExpired,
                }],
            )
        }
        LifecycleEvent::AccessRevoked => {
            if !revocation_due(record, policy, now) {
                return Decision::skipped("user is not past the grace period");
            }
            let patch = SubscriptionPatch {
                left_group: Some(true),
                ..Default::default()
            };
            Decision::applied(patch, None, Vec::new())
        }
    }
}

fn on_payment_confirmed(record: &UserSubscriptionRecord, payment: ConfirmedPayment, now: DateTime<Utc>) -> Decision {
    let event = PaymentEvent {
        amount_minor: payment.amount_minor,
        currency: payment.currency.clone(),
        charge_id: Some(payment.charge_id.clone()),
        order_ref: payment.order_ref.clone(),
        tariff: Some(payment.tariff.clone()),
        timestamp: payment.timestamp,
        status: PaymentStatus::Completed,
        kind: payment.kind,
        reason: None,
    };
    if record.has_payment(&event) {
        return Decision::duplicate();
    }

    // A late-confirmed renewal extends the current period; anything else starts a fresh one.
    let end = match (payment.kind, record.subscription_end_date) {
        (PaymentKind::Renewal, Some(current)) => current + payment.period,
        _ => now + payment.period,
    };

    let mut patch = SubscriptionPatch {
        subscription_active: Some(true),
        subscription_end_date: Some(Some(end)),
        left_group: Some(false),
        tariff: Some(Some(payment.tariff.clone())),
        billing_attempts: Some(0),
        last_reminder_sent: Some(None),
        ..Default::default()
    };

    let auto_renewal = match (payment.kind, payment.payment_method_ref) {
        (PaymentKind::Subscription | PaymentKind::Renewal, Some(method)) => {
            patch = patch.enable_auto_renewal(method);
            if payment.provider_subscription_id.is_some() {
                patch.provider_subscription_id = Some(payment.provider_subscription_id);
            }
            true
        }
        (PaymentKind::Renewal, None) => record.auto_renewal,
        _ => {
            patch = patch.disable_auto_renewal();
            false
        }
    };

    let mut effects = vec![SideEffect::Notify {
        user_id: record.user_id,
        notification: Notification::PaymentSuccessful {
            tariff: payment.tariff,
            end_date: end,
            auto_renewal,
        },
    }];
    if record.left_group {
        effects.push(SideEffect::RestoreGroupAccess {
            user_id: record.user_id,
        });
    }

    Decision::applied(patch, Some(event), effects)
}

fn on_payment_failed(record: &UserSubscriptionRecord, payment: FailedPayment) -> Decision {
    let event = PaymentEvent {
        amount_minor: payment.amount_minor,
        currency: payment.currency,
        charge_id: payment.charge_id,
        order_ref: payment.order_ref,
        tariff: payment.tariff,
        timestamp: payment.timestamp,
        status: if payment.cancelled {
            PaymentStatus::Cancelled
        } else {
            PaymentStatus::Failed
        },
        kind: payment.kind,
        reason: Some(payment.reason.clone()),
    };
    if record.has_payment(&event) {
        return Decision::duplicate();
    }

    Decision::applied(
        SubscriptionPatch::default(),
        Some(event),
        vec![SideEffect::Notify {
            user_id: record.user_id,
            notification: Notification::PaymentFailed { reason: payment.reason },
        }],
    )
}

fn on_auto_renewal_cancelled(record: &UserSubscriptionRecord) -> Decision {
    if !record.auto_renewal && record.payment_method_ref.is_none() && record.provider_subscription_id.is_none() {
        return Decision::skipped("auto-renewal is not active");
    }
    let end_date = record.subscription_end_date.filter(|_| record.subscription_active);
    Decision::applied(
        SubscriptionPatch::default().disable_auto_renewal(),
        None,
        vec![SideEffect::Notify {
            user_id: record.user_id,
            notification: Notification::AutoRenewalDisabled {
                reason: DisableReason::UserRequested,
                end_date,
            },
        }],
    )
}

fn on_renewal_attempted(
    record: &UserSubscriptionRecord,
    attempt: RenewalAttempt,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> Decision {
    if !renewal_due(record, policy, now) {
        return Decision::skipped("renewal is not due");
    }
    let user_id = record.user_id;

    match attempt.outcome {
        RenewalOutcome::Charged { charge_id } => {
            let event = PaymentEvent {
                amount_minor: attempt.amount_minor,
                currency: attempt.currency,
                charge_id: Some(charge_id),
                order_ref: attempt.order_ref,
                tariff: Some(attempt.tariff),
                timestamp: now,
                status: PaymentStatus::Completed,
                kind: PaymentKind::Renewal,
                reason: None,
            };
            if record.has_payment(&event) {
                return Decision::duplicate();
            }
            let end = record.subscription_end_date.unwrap_or(now) + attempt.period;
            let patch = SubscriptionPatch {
                subscription_active: Some(true),
                subscription_end_date: Some(Some(end)),
                billing_attempts: Some(0),
                last_reminder_sent: Some(None),
                ..Default::default()
            };
            Decision::applied(
                patch,
                Some(event),
                vec![SideEffect::Notify {
                    user_id,
                    notification: Notification::AutoRenewalSucceeded { end_date: end },
                }],
            )
        }
        RenewalOutcome::Failed { reason, charge_id } => {
            let attempts = record.billing_attempts + 1;
            let event = PaymentEvent {
                amount_minor: attempt.amount_minor,
                currency: attempt.currency,
                charge_id,
                order_ref: attempt.order_ref,
                tariff: Some(attempt.tariff),
                timestamp: now,
                status: PaymentStatus::Failed,
                kind: PaymentKind::Renewal,
                reason: Some(reason.clone()),
            };
            if record.has_payment(&event) {
                return Decision::duplicate();
            }

            let mut patch = SubscriptionPatch {
                billing_attempts: Some(attempts),
                ..Default::default()
            };
            let notification = if attempts >= policy.max_billing_attempts {
                patch = patch.disable_auto_renewal();
                Notification::AutoRenewalDisabled {
                    reason: DisableReason::RepeatedFailures,
                    end_date: record.subscription_end_date,
                }
            } else {
                Notification::AutoRenewalFailed {
                    attempt: attempts,
                    max_attempts: policy.max_billing_attempts,
                    reason,
                }
            };
            Decision::applied(patch, Some(event), vec![SideEffect::Notify { user_id, notification }])
        }
    }
}
