//! Persisted subscription record and its payment audit log.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout in SQLite TEXT columns; SQLite's `DATE()` understands it
/// and lexical order equals chronological order.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DB_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(DB_TIME_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DB_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc)))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DB_DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, DB_DATE_FORMAT).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// Failed and cancelled are the same outcome for one attempt; providers
    /// report a declined charge with either.
    fn same_outcome(self, other: PaymentStatus) -> bool {
        self == other || (self.is_unsuccessful() && other.is_unsuccessful())
    }

    pub fn is_unsuccessful(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    OneTime,
    Subscription,
    Renewal,
}

/// One entry of `payment_history`. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tariff: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: PaymentStatus,
    pub kind: PaymentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PaymentEvent {
    /// Same attempt seen before: same outcome and same provider charge id,
    /// or, when either side lacks a charge id, the same order reference.
    pub fn is_duplicate_of(&self, other: &PaymentEvent) -> bool {
        if !self.status.same_outcome(other.status) {
            return false;
        }
        match (&self.charge_id, &other.charge_id) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((&self.order_ref, &other.order_ref), (Some(a), Some(b)) if a == b),
        }
    }
}

/// Subscription state of one Telegram user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSubscriptionRecord {
    pub user_id: i64,
    pub subscription_active: bool,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub auto_renewal: bool,
    pub payment_method_ref: Option<String>,
    /// Provider-side subscription id, needed to cancel at the provider
    pub provider_subscription_id: Option<String>,
    pub left_group: bool,
    pub tariff: Option<String>,
    pub billing_attempts: u32,
    pub payment_history: Vec<PaymentEvent>,
    pub last_reminder_sent: Option<NaiveDate>,
    /// Bumped on every write; used for compare-and-set commits
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSubscriptionRecord {
    /// All-inactive defaults for a user seen for the first time.
    pub fn new(user_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            subscription_active: false,
            subscription_end_date: None,
            auto_renewal: false,
            payment_method_ref: None,
            provider_subscription_id: None,
            left_group: false,
            tariff: None,
            billing_attempts: 0,
            payment_history: Vec::new(),
            last_reminder_sent: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_payment(&self, event: &PaymentEvent) -> bool {
        self.payment_history.iter().any(|seen| event.is_duplicate_of(seen))
    }

    /// Whole days until `subscription_end_date`, never negative.
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        match self.subscription_end_date {
            Some(end) if end > now => {
                let secs = (end - now).num_seconds();
                (secs + 86_399) / 86_400
            }
            _ => 0,
        }
    }

    /// Structural invariants every committed record must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.auto_renewal && self.payment_method_ref.is_none() {
            return Err(format!("user {}: auto_renewal without payment_method_ref", self.user_id));
        }
        if self.subscription_active && self.subscription_end_date.is_none() {
            return Err(format!("user {}: active subscription without end date", self.user_id));
        }
        Ok(())
    }
}

/// Partial update merged into a record. `None` leaves the column untouched;
/// for nullable columns `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub subscription_active: Option<bool>,
    pub subscription_end_date: Option<Option<DateTime<Utc>>>,
    pub auto_renewal: Option<bool>,
    pub payment_method_ref: Option<Option<String>>,
    pub provider_subscription_id: Option<Option<String>>,
    pub left_group: Option<bool>,
    pub tariff: Option<Option<String>>,
    pub billing_attempts: Option<u32>,
    pub last_reminder_sent: Option<Option<NaiveDate>>,
}

impl SubscriptionPatch {
    pub fn is_empty(&self) -> bool {
        *self == SubscriptionPatch::default()
    }

    /// Turns auto-renewal on together with the method that makes it possible.
    pub fn enable_auto_renewal(mut self, payment_method_ref: String) -> Self {
        self.auto_renewal = Some(true);
        self.payment_method_ref = Some(Some(payment_method_ref));
        self
    }

    /// Turns auto-renewal off and forgets the stored method and provider subscription.
    pub fn disable_auto_renewal(mut self) -> Self {
        self.auto_renewal = Some(false);
        self.payment_method_ref = Some(None);
        self.provider_subscription_id = Some(None);
        self
    }

    /// Applies the patch to an in-memory copy of the record.
    pub fn apply_to(&self, record: &mut UserSubscriptionRecord) {
        if let Some(v) = self.subscription_active {
            record.subscription_active = v;
        }
        if let Some(v) = self.subscription_end_date {
            record.subscription_end_date = v;
        }
        if let Some(v) = self.auto_renewal {
            record.auto_renewal = v;
        }
        if let Some(v) = &self.payment_method_ref {
            record.payment_method_ref = v.clone();
        }
        if let Some(v) = &self.provider_subscription_id {
            record.provider_subscription_id = v.clone();
        }
        if let Some(v) = self.left_group {
            record.left_group = v;
        }
        if let Some(v) = &self.tariff {
            record.tariff = v.clone();
        }
        if let Some(v) = self.billing_attempts {
            record.billing_attempts = v;
        }
        if let Some(v) = self.last_reminder_sent {
            record.last_reminder_sent = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn event(charge: Option<&str>, order: Option<&str>, status: PaymentStatus) -> PaymentEvent {
        PaymentEvent {
            amount_minor: 40_000,
            currency: "RUB".into(),
            charge_id: charge.map(String::from),
            order_ref: order.map(String::from),
            tariff: Some("basic".into()),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap(),
            status,
            kind: PaymentKind::Subscription,
            reason: None,
        }
    }

    #[test]
    fn test_duplicate_by_charge_id() {
        let a = event(Some("ch_1"), Some("ord_1"), PaymentStatus::Completed);
        let b = event(Some("ch_1"), Some("ord_2"), PaymentStatus::Completed);
        assert!(a.is_duplicate_of(&b));
    }

    #[test]
    fn test_failed_and_completed_with_same_charge_are_distinct() {
        let a = event(Some("ch_1"), None, PaymentStatus::Failed);
        let b = event(Some("ch_1"), None, PaymentStatus::Completed);
        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn test_declined_attempt_matches_later_provider_notice() {
        let recorded = event(None, Some("ren_1"), PaymentStatus::Failed);
        let notice = event(Some("pay_3"), Some("ren_1"), PaymentStatus::Cancelled);
        assert!(notice.is_duplicate_of(&recorded));

        let other_order = event(Some("pay_4"), Some("ren_2"), PaymentStatus::Cancelled);
        assert!(!other_order.is_duplicate_of(&recorded));
    }

    #[test]
    fn test_distinct_charges_on_one_order_are_distinct() {
        let a = event(Some("ch_1"), Some("ord_1"), PaymentStatus::Failed);
        let b = event(Some("ch_2"), Some("ord_1"), PaymentStatus::Failed);
        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn test_anonymous_failures_never_dedupe() {
        let a = event(None, None, PaymentStatus::Failed);
        let b = event(None, None, PaymentStatus::Failed);
        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn test_history_json_is_lossless() {
        let mut failed = event(None, Some("ord_9"), PaymentStatus::Cancelled);
        failed.reason = Some("user closed the form".into());
        let history = vec![event(Some("ch_1"), Some("ord_1"), PaymentStatus::Completed), failed];

        let json = serde_json::to_string(&history).unwrap();
        let back: Vec<PaymentEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
        assert!(json.contains("\"status\":\"cancelled\""));
    }

    #[test]
    fn test_patch_helpers_keep_method_and_flag_together() {
        let now = Utc::now();
        let mut record = UserSubscriptionRecord::new(7, now);
        SubscriptionPatch::default()
            .enable_auto_renewal("pm_1".into())
            .apply_to(&mut record);
        assert!(record.auto_renewal);
        assert_eq!(record.payment_method_ref.as_deref(), Some("pm_1"));

        SubscriptionPatch::default().disable_auto_renewal().apply_to(&mut record);
        assert!(!record.auto_renewal);
        assert_eq!(record.payment_method_ref, None);
        assert!(record.check_invariants().is_ok());
    }

    #[test]
    fn test_days_left_rounds_up_partial_days() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let mut record = UserSubscriptionRecord::new(1, now);
        record.subscription_end_date = Some(now + Duration::days(30));
        assert_eq!(record.days_left(now), 30);
        assert_eq!(record.days_left(now + Duration::hours(1)), 30);
        record.subscription_end_date = Some(now - Duration::days(1));
        assert_eq!(record.days_left(now), 0);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 13, 23, 59, 0).unwrap();
        assert_eq!(format_ts(ts), "2024-01-13 23:59:00");
        assert_eq!(parse_ts("2024-01-13 23:59:00"), Some(ts));
        assert_eq!(parse_ts("2024-01-13T23:59:00Z"), Some(ts));
    }
}
