use chrono::Duration;

use crate::core::config;

/// A named plan with its own price and billing period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tariff {
    pub id: String,
    pub title: String,
    pub price_minor: i64,
    pub currency: String,
    pub period_days: i64,
}

impl Tariff {
    pub fn period(&self) -> Duration {
        Duration::days(self.period_days)
    }

    pub fn description(&self) -> String {
        format!("{} subscription, {} days", self.title, self.period_days)
    }
}

#[derive(Debug, Clone)]
pub struct TariffCatalog {
    tariffs: Vec<Tariff>,
    default_id: String,
}

impl TariffCatalog {
    pub fn new(tariffs: Vec<Tariff>, default_id: impl Into<String>) -> Self {
        Self {
            tariffs,
            default_id: default_id.into(),
        }
    }

    /// basic / standard / premium with the given prices.
    pub fn standard(currency: &str, prices: [i64; 3], period_days: i64, default_id: &str) -> Self {
        let plan = |id: &str, title: &str, price_minor: i64| Tariff {
            id: id.to_string(),
            title: title.to_string(),
            price_minor,
            currency: currency.to_string(),
            period_days,
        };
        Self::new(
            vec![
                plan("basic", "Basic", prices[0]),
                plan("standard", "Standard", prices[1]),
                plan("premium", "Premium", prices[2]),
            ],
            default_id,
        )
    }

    pub fn from_config() -> Self {
        Self::standard(
            &config::subscription::CURRENCY,
            [
                *config::subscription::BASIC_PRICE,
                *config::subscription::STANDARD_PRICE,
                *config::subscription::PREMIUM_PRICE,
            ],
            *config::subscription::PERIOD_DAYS,
            &config::subscription::DEFAULT_TARIFF,
        )
    }

    pub fn get(&self, id: &str) -> Option<&Tariff> {
        let id = id.trim().to_ascii_lowercase();
        self.tariffs.iter().find(|t| t.id == id)
    }

    /// Named tariff, or the default one when no name is given.
    pub fn resolve(&self, id: Option<&str>) -> Option<&Tariff> {
        match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => self.get(id),
            None => self.get(&self.default_id),
        }
    }

    pub fn all(&self) -> &[Tariff] {
        &self.tariffs
    }
}

impl Default for TariffCatalog {
    fn default() -> Self {
        Self::standard("RUB", [40_000, 55_000, 75_000], 30, "basic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_prices() {
        let catalog = TariffCatalog::default();
        assert_eq!(catalog.get("basic").unwrap().price_minor, 40_000);
        assert_eq!(catalog.get("Standard").unwrap().price_minor, 55_000);
        assert_eq!(catalog.get("premium").unwrap().price_minor, 75_000);
        assert_eq!(catalog.get("premium").unwrap().period(), Duration::days(30));
    }

    #[test]
    fn test_resolve_falls_back_to_default_only_when_unnamed() {
        let catalog = TariffCatalog::default();
        assert_eq!(catalog.resolve(None).unwrap().id, "basic");
        assert_eq!(catalog.resolve(Some("  ")).unwrap().id, "basic");
        assert!(catalog.resolve(Some("gold")).is_none());
    }
}
