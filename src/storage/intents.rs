//! Payment intents: orders handed to a provider and awaiting its verdict.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::storage::db::{get_connection, DbPool, StoreError, StoreResult};
use crate::storage::records::{format_ts, parse_ts, PaymentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl IntentStatus {
    /// A provider may still report on the order.
    pub fn is_open(self) -> bool {
        matches!(self, IntentStatus::Pending | IntentStatus::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub order_ref: String,
    pub user_id: i64,
    pub tariff: String,
    pub amount_minor: i64,
    pub currency: String,
    pub kind: PaymentKind,
    pub provider_payment_id: Option<String>,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn kind_to_str(kind: PaymentKind) -> &'static str {
    match kind {
        PaymentKind::OneTime => "one_time",
        PaymentKind::Subscription => "subscription",
        PaymentKind::Renewal => "renewal",
    }
}

fn kind_from_str(raw: &str) -> Option<PaymentKind> {
    match raw {
        "one_time" => Some(PaymentKind::OneTime),
        "subscription" => Some(PaymentKind::Subscription),
        "renewal" => Some(PaymentKind::Renewal),
        _ => None,
    }
}

const INTENT_COLUMNS: &str =
    "order_ref, user_id, tariff, amount_minor, currency, kind, provider_payment_id, status, created_at, updated_at";

#[derive(Clone)]
pub struct IntentStore {
    pool: DbPool,
}

impl IntentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn create(&self, intent: &PaymentIntent) -> StoreResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO payment_intents (order_ref, user_id, tariff, amount_minor, currency, kind,
                                          provider_payment_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                intent.order_ref,
                intent.user_id,
                intent.tariff,
                intent.amount_minor,
                intent.currency,
                kind_to_str(intent.kind),
                intent.provider_payment_id,
                intent.status.to_string(),
                format_ts(intent.created_at),
                format_ts(intent.updated_at),
            ],
        )?;
        log::info!(
            "Created {} intent {} for user {} ({} {} {})",
            kind_to_str(intent.kind),
            intent.order_ref,
            intent.user_id,
            intent.tariff,
            intent.amount_minor,
            intent.currency
        );
        Ok(())
    }

    pub fn get(&self, order_ref: &str) -> StoreResult<Option<PaymentIntent>> {
        let conn = get_connection(&self.pool)?;
        select_one(&conn, "order_ref", order_ref)
    }

    pub fn find_by_provider_id(&self, provider_payment_id: &str) -> StoreResult<Option<PaymentIntent>> {
        let conn = get_connection(&self.pool)?;
        select_one(&conn, "provider_payment_id", provider_payment_id)
    }

    /// Records the provider's own id for the order once it is known.
    pub fn set_provider_payment_id(&self, order_ref: &str, provider_payment_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "UPDATE payment_intents SET provider_payment_id = ?2, updated_at = ?3 WHERE order_ref = ?1",
            params![order_ref, provider_payment_id, format_ts(now)],
        )?;
        Ok(())
    }

    /// Moves the intent to `status`. Returns false if the order is unknown.
    pub fn mark(&self, order_ref: &str, status: IntentStatus, now: DateTime<Utc>) -> StoreResult<bool> {
        let conn = get_connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE payment_intents SET status = ?2, updated_at = ?3 WHERE order_ref = ?1",
            params![order_ref, status.to_string(), format_ts(now)],
        )?;
        Ok(updated > 0)
    }

    /// Marks pending intents created before `cutoff` as expired.
    pub fn expire_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = get_connection(&self.pool)?;
        let expired = conn.execute(
            "UPDATE payment_intents SET status = 'expired', updated_at = ?2
             WHERE status = 'pending' AND created_at < ?1",
            params![format_ts(cutoff), format_ts(now)],
        )?;
        Ok(expired)
    }

    pub fn pending_for_user(&self, user_id: i64) -> StoreResult<Vec<PaymentIntent>> {
        let conn = get_connection(&self.pool)?;
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE user_id = ?1 AND status = 'pending' ORDER BY created_at DESC",
            INTENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode).collect()
    }
}

type RawIntent = (String, i64, String, i64, String, String, Option<String>, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawIntent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn select_one(conn: &Connection, column: &str, value: &str) -> StoreResult<Option<PaymentIntent>> {
    let sql = format!("SELECT {} FROM payment_intents WHERE {} = ?1", INTENT_COLUMNS, column);
    let raw = conn.query_row(&sql, params![value], read_row).optional()?;
    raw.map(decode).transpose()
}

fn decode(raw: RawIntent) -> StoreResult<PaymentIntent> {
    let (order_ref, user_id, tariff, amount_minor, currency, kind, provider_payment_id, status, created, updated) = raw;
    let corrupt = |reason: String| StoreError::Corrupt { user_id, reason };

    Ok(PaymentIntent {
        kind: kind_from_str(&kind).ok_or_else(|| corrupt(format!("intent {}: bad kind {:?}", order_ref, kind)))?,
        status: IntentStatus::from_str(&status)
            .map_err(|_| corrupt(format!("intent {}: bad status {:?}", order_ref, status)))?,
        created_at: parse_ts(&created).ok_or_else(|| corrupt(format!("intent {}: bad created_at", order_ref)))?,
        updated_at: parse_ts(&updated).ok_or_else(|| corrupt(format!("intent {}: bad updated_at", order_ref)))?,
        order_ref,
        user_id,
        tariff,
        amount_minor,
        currency,
        provider_payment_id,
    })
}
