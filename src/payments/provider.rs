//! Provider-agnostic payment port.
//!
//! Every backend (demo, redirect-link gateway, in-chat invoice, recurring
//! charge API) implements [`PaymentProvider`]; the subscription engine only
//! ever talks to this trait.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    /// The provider answered but refused the request
    #[error("provider rejected request: {0}")]
    Api(String),

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ProviderError {
    /// Network-level failures worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Http(_) | ProviderError::Telegram(_))
    }
}

/// State of a payment as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderPaymentStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl ProviderPaymentStatus {
    /// Maps the status vocabularies seen across gateways.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "success" | "successful" | "paid" | "completed" | "payment.succeeded" => Self::Succeeded,
            "canceled" | "cancelled" | "order_canceled" | "payment.canceled" => Self::Cancelled,
            "failed" | "fail" | "declined" | "order_denied" | "rejected" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Outcome of a create/charge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentResult {
    pub success: bool,
    pub payment_url: Option<String>,
    pub payment_id: Option<String>,
    pub error: Option<String>,
    pub status: ProviderPaymentStatus,
    /// Set when the money was captured synchronously
    pub charge_id: Option<String>,
    /// Reusable method, only when the provider confirmed it is saved
    pub payment_method_ref: Option<String>,
}

impl PaymentResult {
    pub fn declined(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status: ProviderPaymentStatus::Failed,
            ..Default::default()
        }
    }

    pub fn is_captured(&self) -> bool {
        self.success && self.status == ProviderPaymentStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResult {
    pub success: bool,
    pub error: Option<String>,
}

impl SubscriptionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }
}

/// Structured metadata attached to every payment; inbound events are
/// matched back to users through it, never through free-text descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentMetadata {
    pub order_ref: String,
    pub user_id: i64,
    pub tariff: String,
}

impl PaymentMetadata {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("order_ref".to_string(), self.order_ref.clone()),
            ("user_id".to_string(), self.user_id.to_string()),
            ("tariff".to_string(), self.tariff.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub user_id: i64,
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
    pub metadata: PaymentMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingInterval {
    pub days: i64,
}

/// An inbound provider event after parsing, before it is matched to an intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundPayment {
    pub order_ref: Option<String>,
    pub provider_payment_id: Option<String>,
    pub status: ProviderPaymentStatus,
    pub charge_id: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub payment_method_ref: Option<String>,
    /// From structured metadata only
    pub user_id: Option<i64>,
    pub tariff: Option<String>,
    pub reason: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether [`PaymentProvider::complete_manual_payment`] is available.
    fn supports_manual_completion(&self) -> bool {
        false
    }

    async fn create_one_time_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError>;

    /// First charge of a recurring plan. May or may not capture a reusable method.
    async fn create_subscription_intent(
        &self,
        request: &PaymentRequest,
        interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError>;

    /// Unattended charge of a saved method.
    async fn charge_stored_method(
        &self,
        payment_method_ref: &str,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, ProviderError>;

    /// Authenticity and shape check of a raw webhook body.
    fn verify_inbound_event(&self, raw_payload: &[u8], signature: Option<&str>) -> bool;

    /// Parses a verified webhook body.
    fn parse_inbound_event(&self, raw_payload: &[u8]) -> Result<InboundPayment, ProviderError>;

    async fn complete_manual_payment(&self, _payment_id: &str) -> Result<InboundPayment, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name(),
            operation: "manual completion",
        })
    }
}

/// Decimal major-unit string ("400.00") to minor units.
pub fn parse_minor_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) || frac.len() > 2 {
        return None;
    }
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let value = whole.checked_mul(100)?.checked_add(frac)?;
    Some(if negative { -value } else { value })
}

/// Minor units to a two-decimal major-unit string.
pub fn format_major_units(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Short random hex suffix for provider-side ids.
pub fn random_hex16() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_vocabularies() {
        assert_eq!(ProviderPaymentStatus::parse("success"), ProviderPaymentStatus::Succeeded);
        assert_eq!(ProviderPaymentStatus::parse("Paid"), ProviderPaymentStatus::Succeeded);
        assert_eq!(ProviderPaymentStatus::parse("canceled"), ProviderPaymentStatus::Cancelled);
        assert_eq!(ProviderPaymentStatus::parse("order_denied"), ProviderPaymentStatus::Failed);
        assert_eq!(ProviderPaymentStatus::parse("waiting_for_capture"), ProviderPaymentStatus::Pending);
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(parse_minor_units("400.00"), Some(40_000));
        assert_eq!(parse_minor_units("400"), Some(40_000));
        assert_eq!(parse_minor_units("9.9"), Some(990));
        assert_eq!(parse_minor_units("1.234"), None);
        assert_eq!(parse_minor_units("abc"), None);
        assert_eq!(format_major_units(55_000), "550.00");
        assert_eq!(format_major_units(5), "0.05");
    }

    #[test]
    fn test_random_hex16() {
        let id = random_hex16();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_hex16());
    }
}
