//! Price of a checkout or renewal for one user.
//!
//! A personal price wins over everything. Otherwise an administrator's tariff
//! override applies, split into a regular and a returning price. The
//! configured tariff price is used when nothing was overridden.

use crate::payments::Tariff;
use crate::storage::{PaymentStatus, TariffPrice, UserSubscriptionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PriceSource {
    Configured,
    Regular,
    Returning,
    Personal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub amount_minor: i64,
    pub source: PriceSource,
}

/// A returning customer has at least one completed payment on record.
pub fn is_returning(record: Option<&UserSubscriptionRecord>) -> bool {
    record.is_some_and(|r| r.payment_history.iter().any(|e| e.status == PaymentStatus::Completed))
}

pub fn quote(tariff: &Tariff, tariff_price: Option<&TariffPrice>, personal: Option<i64>, returning: bool) -> Quote {
    if let Some(amount_minor) = personal {
        return Quote {
            amount_minor,
            source: PriceSource::Personal,
        };
    }
    match tariff_price {
        Some(price) if returning => Quote {
            amount_minor: price.returning_minor,
            source: PriceSource::Returning,
        },
        Some(price) => Quote {
            amount_minor: price.regular_minor,
            source: PriceSource::Regular,
        },
        None => Quote {
            amount_minor: tariff.price_minor,
            source: PriceSource::Configured,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PaymentEvent, PaymentKind};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn basic() -> Tariff {
        Tariff {
            id: "basic".into(),
            title: "Basic".into(),
            price_minor: 40_000,
            currency: "RUB".into(),
            period_days: 30,
        }
    }

    fn override_price() -> TariffPrice {
        TariffPrice {
            tariff: "basic".into(),
            regular_minor: 50_000,
            returning_minor: 35_000,
            updated_by: 1,
            updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_precedence() {
        let tariff = basic();
        let price = override_price();

        assert_eq!(quote(&tariff, None, None, true).amount_minor, 40_000);
        assert_eq!(quote(&tariff, Some(&price), None, false).amount_minor, 50_000);
        assert_eq!(
            quote(&tariff, Some(&price), None, true),
            Quote {
                amount_minor: 35_000,
                source: PriceSource::Returning
            }
        );
        assert_eq!(quote(&tariff, Some(&price), Some(9_900), true).source, PriceSource::Personal);
    }

    #[test]
    fn test_only_completed_payments_make_a_returning_customer() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let mut record = UserSubscriptionRecord::new(7, now);
        assert!(!is_returning(None));
        assert!(!is_returning(Some(&record)));

        let mut event = PaymentEvent {
            amount_minor: 40_000,
            currency: "RUB".into(),
            charge_id: None,
            order_ref: Some("ord_1".into()),
            tariff: Some("basic".into()),
            timestamp: now,
            status: PaymentStatus::Failed,
            kind: PaymentKind::OneTime,
            reason: Some("declined".into()),
        };
        record.payment_history.push(event.clone());
        assert!(!is_returning(Some(&record)));

        event.status = PaymentStatus::Completed;
        event.charge_id = Some("ch_1".into());
        record.payment_history.push(event);
        assert!(is_returning(Some(&record)));
    }
}
