//! Durable per-user subscription records.
//!
//! All writes go through [`UserRecordStore::commit`], which re-reads the row
//! inside an `IMMEDIATE` transaction and merges the patch into it, so two
//! writers touching different fields never lose each other's changes and
//! `payment_history` appends are never dropped.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::storage::db::{get_connection, DbPool, StoreError, StoreResult};
use crate::storage::records::{
    format_date, format_ts, parse_date, parse_ts, PaymentEvent, SubscriptionPatch, UserSubscriptionRecord,
};

const USER_COLUMNS: &str = "user_id, subscription_active, subscription_end_date, auto_renewal, payment_method_ref, \
     provider_subscription_id, left_group, tariff, billing_attempts, payment_history, last_reminder_sent, revision, \
     created_at, updated_at";

/// Result of a transactional commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Patch and event were written; holds the record as committed
    Applied(UserSubscriptionRecord),
    /// The event was already in `payment_history`; nothing was written
    Duplicate(UserSubscriptionRecord),
}

impl CommitOutcome {
    pub fn record(&self) -> &UserSubscriptionRecord {
        match self {
            CommitOutcome::Applied(r) | CommitOutcome::Duplicate(r) => r,
        }
    }

    pub fn into_record(self) -> UserSubscriptionRecord {
        match self {
            CommitOutcome::Applied(r) | CommitOutcome::Duplicate(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CommitOutcome::Duplicate(_))
    }
}

#[derive(Clone)]
pub struct UserRecordStore {
    pool: DbPool,
}

impl UserRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn get(&self, user_id: i64) -> StoreResult<Option<UserSubscriptionRecord>> {
        let conn = get_connection(&self.pool)?;
        select_user(&conn, user_id)
    }

    /// Returns the record, creating it with inactive defaults if absent.
    pub fn ensure(&self, user_id: i64, now: DateTime<Utc>) -> StoreResult<UserSubscriptionRecord> {
        let conn = get_connection(&self.pool)?;
        insert_default(&conn, user_id, now)?;
        select_user(&conn, user_id)?.ok_or_else(|| missing_after_insert(user_id))
    }

    /// Insert-or-merge of the given fields; `updated_at` is always refreshed.
    pub fn upsert(
        &self,
        user_id: i64,
        patch: &SubscriptionPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<UserSubscriptionRecord> {
        self.commit(user_id, patch, None, None, now).map(CommitOutcome::into_record)
    }

    /// Atomically merges `patch` and appends `event` (if any).
    ///
    /// The row is created if absent and re-read under the write lock before
    /// modification. If `event` duplicates an entry already in the history the
    /// whole commit is skipped. With `expected_revision` set, the commit fails
    /// with [`StoreError::Conflict`] when another writer got there first.
    pub fn commit(
        &self,
        user_id: i64,
        patch: &SubscriptionPatch,
        event: Option<&PaymentEvent>,
        expected_revision: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome> {
        let mut conn = get_connection(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        insert_default(&tx, user_id, now)?;
        let mut record = select_user(&tx, user_id)?.ok_or_else(|| missing_after_insert(user_id))?;

        if let Some(expected) = expected_revision {
            if record.revision != expected {
                log::warn!(
                    "Commit for user {} rejected: revision {} != expected {}",
                    user_id,
                    record.revision,
                    expected
                );
                return Err(StoreError::Conflict(user_id));
            }
        }

        if let Some(event) = event {
            if record.has_payment(event) {
                log::info!(
                    "Payment event {:?}/{:?} already recorded for user {}, skipping",
                    event.charge_id,
                    event.order_ref,
                    user_id
                );
                return Ok(CommitOutcome::Duplicate(record));
            }
            record.payment_history.push(event.clone());
        }

        patch.apply_to(&mut record);
        record
            .check_invariants()
            .map_err(|reason| StoreError::InvariantViolation { user_id, reason })?;
        record.revision += 1;
        record.updated_at = now;

        write_user(&tx, &record)?;
        tx.commit()?;

        Ok(CommitOutcome::Applied(record))
    }

    /// Active subscribers whose end date falls on `today + offset` for any offset.
    /// Compares calendar dates, not timestamps.
    pub fn find_expiring_on(&self, today: NaiveDate, offsets: &[i64]) -> StoreResult<Vec<UserSubscriptionRecord>> {
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        let dates: Vec<String> = offsets
            .iter()
            .map(|offset| format_date(today + Duration::days(*offset)))
            .collect();
        let sql = format!(
            "SELECT {} FROM users
             WHERE subscription_active = 1
               AND subscription_end_date IS NOT NULL
               AND DATE(subscription_end_date) IN ({})
             ORDER BY user_id",
            USER_COLUMNS,
            placeholders(dates.len())
        );

        let conn = get_connection(&self.pool)?;
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_from_iter(dates.iter()), read_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawUser::decode).collect()
    }

    /// Inactive users still in the group whose end date is older than the grace window.
    pub fn find_lapsed_beyond(&self, now: DateTime<Utc>, grace_period_days: i64) -> StoreResult<Vec<i64>> {
        let threshold = format_ts(now - Duration::days(grace_period_days));
        self.query_ids(
            "SELECT user_id FROM users
             WHERE subscription_active = 0
               AND left_group = 0
               AND subscription_end_date IS NOT NULL
               AND subscription_end_date < ?1
             ORDER BY user_id",
            params![threshold],
        )
    }

    /// Active auto-renewing users whose end date is today or already past.
    pub fn find_due_for_renewal(&self, today: NaiveDate, max_attempts: u32) -> StoreResult<Vec<i64>> {
        self.query_ids(
            "SELECT user_id FROM users
             WHERE subscription_active = 1
               AND auto_renewal = 1
               AND payment_method_ref IS NOT NULL
               AND billing_attempts < ?2
               AND subscription_end_date IS NOT NULL
               AND DATE(subscription_end_date) <= ?1
             ORDER BY user_id",
            params![format_date(today), max_attempts],
        )
    }

    /// Active users past their end date with nothing left to renew them.
    pub fn find_expired_unrenewed(&self, now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        self.query_ids(
            "SELECT user_id FROM users
             WHERE subscription_active = 1
               AND auto_renewal = 0
               AND subscription_end_date IS NOT NULL
               AND subscription_end_date < ?1
             ORDER BY user_id",
            params![format_ts(now)],
        )
    }

    fn query_ids(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<i64>> {
        let conn = get_connection(&self.pool)?;
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn missing_after_insert(user_id: i64) -> StoreError {
    StoreError::Corrupt {
        user_id,
        reason: "row missing right after insert".to_string(),
    }
}

fn insert_default(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
    let ts = format_ts(now);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO users (user_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![user_id, ts],
    )?;
    if inserted > 0 {
        log::info!("Created subscription record for user {}", user_id);
    }
    Ok(())
}

fn select_user(conn: &Connection, user_id: i64) -> StoreResult<Option<UserSubscriptionRecord>> {
    let sql = format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS);
    let raw = conn.query_row(&sql, params![user_id], read_raw).optional()?;
    raw.map(RawUser::decode).transpose()
}

fn write_user(conn: &Connection, record: &UserSubscriptionRecord) -> StoreResult<()> {
    let history = serde_json::to_string(&record.payment_history).map_err(|e| StoreError::Corrupt {
        user_id: record.user_id,
        reason: format!("cannot encode payment_history: {}", e),
    })?;
    conn.execute(
        "UPDATE users SET
            subscription_active = ?2,
            subscription_end_date = ?3,
            auto_renewal = ?4,
            payment_method_ref = ?5,
            provider_subscription_id = ?6,
            left_group = ?7,
            tariff = ?8,
            billing_attempts = ?9,
            payment_history = ?10,
            last_reminder_sent = ?11,
            revision = ?12,
            updated_at = ?13
         WHERE user_id = ?1",
        params![
            record.user_id,
            record.subscription_active,
            record.subscription_end_date.map(format_ts),
            record.auto_renewal,
            record.payment_method_ref,
            record.provider_subscription_id,
            record.left_group,
            record.tariff,
            record.billing_attempts,
            history,
            record.last_reminder_sent.map(format_date),
            record.revision,
            format_ts(record.updated_at),
        ],
    )?;
    Ok(())
}

/// Column values as stored, before parsing dates and JSON.
struct RawUser {
    user_id: i64,
    subscription_active: bool,
    subscription_end_date: Option<String>,
    auto_renewal: bool,
    payment_method_ref: Option<String>,
    provider_subscription_id: Option<String>,
    left_group: bool,
    tariff: Option<String>,
    billing_attempts: u32,
    payment_history: String,
    last_reminder_sent: Option<String>,
    revision: i64,
    created_at: String,
    updated_at: String,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawUser> {
    Ok(RawUser {
        user_id: row.get(0)?,
        subscription_active: row.get(1)?,
        subscription_end_date: row.get(2)?,
        auto_renewal: row.get(3)?,
        payment_method_ref: row.get(4)?,
        provider_subscription_id: row.get(5)?,
        left_group: row.get(6)?,
        tariff: row.get(7)?,
        billing_attempts: row.get(8)?,
        payment_history: row.get(9)?,
        last_reminder_sent: row.get(10)?,
        revision: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl RawUser {
    fn decode(self) -> StoreResult<UserSubscriptionRecord> {
        let user_id = self.user_id;
        let corrupt = |reason: String| StoreError::Corrupt { user_id, reason };

        let timestamp = |raw: &str, column: &str| parse_ts(raw).ok_or_else(|| corrupt(format!("bad {}: {:?}", column, raw)));

        let subscription_end_date = match self.subscription_end_date.as_deref() {
            Some(raw) => Some(timestamp(raw, "subscription_end_date")?),
            None => None,
        };
        let last_reminder_sent = match self.last_reminder_sent.as_deref() {
            Some(raw) => Some(parse_date(raw).ok_or_else(|| corrupt(format!("bad last_reminder_sent: {:?}", raw)))?),
            None => None,
        };
        let payment_history: Vec<PaymentEvent> = serde_json::from_str(&self.payment_history)
            .map_err(|e| corrupt(format!("bad payment_history: {}", e)))?;

        Ok(UserSubscriptionRecord {
            user_id,
            subscription_active: self.subscription_active,
            subscription_end_date,
            auto_renewal: self.auto_renewal,
            payment_method_ref: self.payment_method_ref,
            provider_subscription_id: self.provider_subscription_id,
            left_group: self.left_group,
            tariff: self.tariff,
            billing_attempts: self.billing_attempts,
            payment_history,
            last_reminder_sent,
            revision: self.revision,
            created_at: timestamp(&self.created_at, "created_at")?,
            updated_at: timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::create_memory_pool;
    use crate::storage::records::{PaymentKind, PaymentStatus};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn store() -> UserRecordStore {
        UserRecordStore::new(create_memory_pool().unwrap())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn active_until(end: DateTime<Utc>) -> SubscriptionPatch {
        SubscriptionPatch {
            subscription_active: Some(true),
            subscription_end_date: Some(Some(end)),
            tariff: Some(Some("basic".into())),
            ..Default::default()
        }
    }

    fn completed(charge: &str, ts: DateTime<Utc>) -> PaymentEvent {
        PaymentEvent {
            amount_minor: 40_000,
            currency: "RUB".into(),
            charge_id: Some(charge.into()),
            order_ref: None,
            tariff: Some("basic".into()),
            timestamp: ts,
            status: PaymentStatus::Completed,
            kind: PaymentKind::Subscription,
            reason: None,
        }
    }

    #[test]
    fn test_get_unknown_user_is_absent() {
        assert_eq!(store().get(1).unwrap(), None);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let first = store.ensure(5, now).unwrap();
        let second = store.ensure(5, now + Duration::hours(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, UserSubscriptionRecord::new(5, now));
    }

    #[test]
    fn test_upsert_merges_fields() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        store.upsert(9, &active_until(now + Duration::days(30)), now).unwrap();

        let later = now + Duration::minutes(5);
        let patch = SubscriptionPatch {
            left_group: Some(false),
            billing_attempts: Some(1),
            ..Default::default()
        };
        let record = store.upsert(9, &patch, later).unwrap();

        assert!(record.subscription_active);
        assert_eq!(record.tariff.as_deref(), Some("basic"));
        assert_eq!(record.billing_attempts, 1);
        assert_eq!(record.updated_at, later);
        assert_eq!(record.created_at, now);
        assert_eq!(record.revision, 2);
    }

    #[test]
    fn test_commit_appends_and_dedupes_history() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let event = completed("ch_1", now);

        let first = store
            .commit(3, &active_until(now + Duration::days(30)), Some(&event), None, now)
            .unwrap();
        assert!(!first.is_duplicate());

        let again = store
            .commit(3, &active_until(now + Duration::days(60)), Some(&event), None, now)
            .unwrap();
        assert!(again.is_duplicate());

        let record = store.get(3).unwrap().unwrap();
        assert_eq!(record.payment_history, vec![event]);
        assert_eq!(record.subscription_end_date, Some(now + Duration::days(30)));
    }

    #[test]
    fn test_commit_with_stale_revision_conflicts() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let record = store.ensure(4, now).unwrap();
        store.upsert(4, &active_until(now + Duration::days(1)), now).unwrap();

        let result = store.commit(
            4,
            &active_until(now + Duration::days(31)),
            None,
            Some(record.revision),
            now,
        );
        assert!(matches!(result, Err(StoreError::Conflict(4))));
    }

    #[test]
    fn test_commit_refuses_invariant_violation() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let patch = SubscriptionPatch {
            auto_renewal: Some(true),
            ..Default::default()
        };
        let result = store.upsert(8, &patch, now);
        assert!(matches!(result, Err(StoreError::InvariantViolation { user_id: 8, .. })));
    }

    #[test]
    fn test_find_expiring_on_compares_calendar_dates() {
        let store = store();
        let now = at(2024, 1, 10, 9, 0, 0);
        store.upsert(1, &active_until(at(2024, 1, 13, 23, 59, 0)), now).unwrap();
        store.upsert(2, &active_until(at(2024, 1, 13, 0, 0, 1)), now).unwrap();
        store.upsert(3, &active_until(at(2024, 1, 14, 0, 0, 1)), now).unwrap();
        store.upsert(4, &active_until(at(2024, 1, 17, 8, 0, 0)), now).unwrap();
        // inactive users never get reminders
        store
            .upsert(
                5,
                &SubscriptionPatch {
                    subscription_end_date: Some(Some(at(2024, 1, 11, 10, 0, 0))),
                    ..Default::default()
                },
                now,
            )
            .unwrap();

        let ids: Vec<i64> = store
            .find_expiring_on(now.date_naive(), &[7, 3, 1])
            .unwrap()
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_find_lapsed_beyond_grace() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let lapsed = SubscriptionPatch {
            subscription_active: Some(false),
            subscription_end_date: Some(Some(now - Duration::days(3))),
            ..Default::default()
        };
        store.upsert(1, &lapsed, now).unwrap();
        store
            .upsert(
                2,
                &SubscriptionPatch {
                    left_group: Some(true),
                    ..lapsed.clone()
                },
                now,
            )
            .unwrap();
        store
            .upsert(
                3,
                &SubscriptionPatch {
                    subscription_end_date: Some(Some(now - Duration::days(1))),
                    ..lapsed.clone()
                },
                now,
            )
            .unwrap();
        // never subscribed
        store.ensure(4, now).unwrap();

        assert_eq!(store.find_lapsed_beyond(now, 2).unwrap(), vec![1]);
    }

    #[test]
    fn test_find_due_for_renewal() {
        let store = store();
        let now = at(2024, 1, 10, 12, 0, 0);
        let due = active_until(at(2024, 1, 10, 23, 0, 0)).enable_auto_renewal("pm_1".into());
        store.upsert(1, &due, now).unwrap();
        store
            .upsert(
                2,
                &SubscriptionPatch {
                    billing_attempts: Some(3),
                    ..due.clone()
                },
                now,
            )
            .unwrap();
        store
            .upsert(3, &active_until(at(2024, 1, 11, 1, 0, 0)).enable_auto_renewal("pm_3".into()), now)
            .unwrap();
        store.upsert(4, &active_until(at(2024, 1, 9, 1, 0, 0)), now).unwrap();

        assert_eq!(store.find_due_for_renewal(now.date_naive(), 3).unwrap(), vec![1]);
        assert_eq!(store.find_expired_unrenewed(now).unwrap(), vec![4]);
    }
}
