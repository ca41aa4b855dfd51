//! Runtime price overrides set by administrators.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::storage::db::{get_connection, DbPool, StoreError, StoreResult};
use crate::storage::records::{format_ts, parse_ts};

/// Override of one tariff's price. `returning_minor` applies to users who
/// already paid at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TariffPrice {
    pub tariff: String,
    pub regular_minor: i64,
    pub returning_minor: i64,
    pub updated_by: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PriceStore {
    pool: DbPool,
}

impl PriceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn set_tariff_price(&self, price: &TariffPrice) -> StoreResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO tariff_prices (tariff, regular_minor, returning_minor, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tariff) DO UPDATE SET
                regular_minor = excluded.regular_minor,
                returning_minor = excluded.returning_minor,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at",
            params![
                price.tariff,
                price.regular_minor,
                price.returning_minor,
                price.updated_by,
                format_ts(price.updated_at),
            ],
        )?;
        log::info!(
            "Tariff {} priced at {} / {} (returning) by admin {}",
            price.tariff,
            price.regular_minor,
            price.returning_minor,
            price.updated_by
        );
        Ok(())
    }

    pub fn tariff_price(&self, tariff: &str) -> StoreResult<Option<TariffPrice>> {
        let conn = get_connection(&self.pool)?;
        let raw = conn
            .query_row(
                "SELECT tariff, regular_minor, returning_minor, updated_by, updated_at
                 FROM tariff_prices WHERE tariff = ?1",
                params![tariff],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(tariff, regular_minor, returning_minor, updated_by, updated_at)| {
            let updated_at = parse_ts(&updated_at).ok_or_else(|| StoreError::Corrupt {
                user_id: updated_by,
                reason: format!("tariff price {}: bad updated_at", tariff),
            })?;
            Ok(TariffPrice {
                tariff,
                regular_minor,
                returning_minor,
                updated_by,
                updated_at,
            })
        })
        .transpose()
    }

    /// `None` removes the personal price.
    pub fn set_user_price(&self, user_id: i64, price_minor: Option<i64>, admin_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        let conn = get_connection(&self.pool)?;
        match price_minor {
            Some(price_minor) => {
                conn.execute(
                    "INSERT INTO user_prices (user_id, price_minor, updated_by, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        price_minor = excluded.price_minor,
                        updated_by = excluded.updated_by,
                        updated_at = excluded.updated_at",
                    params![user_id, price_minor, admin_id, format_ts(now)],
                )?;
                log::info!("User {} priced at {} by admin {}", user_id, price_minor, admin_id);
            }
            None => {
                conn.execute("DELETE FROM user_prices WHERE user_id = ?1", params![user_id])?;
                log::info!("Personal price of user {} removed by admin {}", user_id, admin_id);
            }
        }
        Ok(())
    }

    pub fn user_price(&self, user_id: i64) -> StoreResult<Option<i64>> {
        let conn = get_connection(&self.pool)?;
        let price = conn
            .query_row(
                "SELECT price_minor FROM user_prices WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::create_memory_pool;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_tariff_price_upserts() {
        let store = PriceStore::new(create_memory_pool().unwrap());
        assert_eq!(store.tariff_price("basic").unwrap(), None);

        let mut price = TariffPrice {
            tariff: "basic".into(),
            regular_minor: 50_000,
            returning_minor: 45_000,
            updated_by: 1,
            updated_at: now(),
        };
        store.set_tariff_price(&price).unwrap();
        price.regular_minor = 60_000;
        store.set_tariff_price(&price).unwrap();

        assert_eq!(store.tariff_price("basic").unwrap(), Some(price));
        assert_eq!(store.tariff_price("premium").unwrap(), None);
    }

    #[test]
    fn test_user_price_set_and_reset() {
        let store = PriceStore::new(create_memory_pool().unwrap());
        store.set_user_price(42, Some(10_000), 1, now()).unwrap();
        assert_eq!(store.user_price(42).unwrap(), Some(10_000));
        assert_eq!(store.user_price(43).unwrap(), None);

        store.set_user_price(42, None, 1, now()).unwrap();
        assert_eq!(store.user_price(42).unwrap(), None);
    }

    #[test]
    fn test_schema_rejects_non_positive_prices() {
        let store = PriceStore::new(create_memory_pool().unwrap());
        assert!(store.set_user_price(42, Some(0), 1, now()).is_err());
    }
}
