//! Demo provider: no money moves. Payment links deep-link back into the bot
//! and payments are completed either immediately or by a manual command.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::payments::provider::{
    random_hex16, BillingInterval, InboundPayment, PaymentProvider, PaymentRequest, PaymentResult, ProviderError,
    ProviderPaymentStatus, SubscriptionResult,
};
use crate::payments::signature::{field_str, verify_hex};

#[derive(Debug, Clone)]
struct DemoPayment {
    order_ref: String,
    user_id: i64,
    tariff: String,
    amount_minor: i64,
    currency: String,
    recurring: bool,
    created_at: Instant,
}

/// Pending demo payments older than this are forgotten.
const PENDING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct DemoProvider {
    bot_username: String,
    webhook_secret: Option<SecretString>,
    auto_complete: bool,
    payments: DashMap<String, DemoPayment>,
}

impl DemoProvider {
    pub fn new(bot_username: impl Into<String>, webhook_secret: Option<SecretString>, auto_complete: bool) -> Self {
        Self {
            bot_username: bot_username.into(),
            webhook_secret,
            auto_complete,
            payments: DashMap::new(),
        }
    }

    fn payment_url(&self, payment_id: &str) -> String {
        format!("https://t.me/{}?start={}", self.bot_username, payment_id)
    }

    /// Remembers a payment awaiting manual completion.
    fn register(&self, payment_id: &str, request: &PaymentRequest, recurring: bool) {
        self.payments
            .retain(|_, payment| payment.created_at.elapsed() < PENDING_TTL);
        self.payments.insert(
            payment_id.to_string(),
            DemoPayment {
                order_ref: request.metadata.order_ref.clone(),
                user_id: request.user_id,
                tariff: request.metadata.tariff.clone(),
                amount_minor: request.amount_minor,
                currency: request.currency.clone(),
                recurring,
                created_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl PaymentProvider for DemoProvider {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn supports_manual_completion(&self) -> bool {
        true
    }

    async fn create_one_time_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        let payment_id = format!("demo_pay_{}", random_hex16());
        self.register(&payment_id, request, false);
        log::info!(
            "Demo payment {} created for user {}: {} {}",
            payment_id,
            request.user_id,
            request.amount_minor,
            request.currency
        );

        Ok(PaymentResult {
            success: true,
            payment_url: Some(self.payment_url(&payment_id)),
            payment_id: Some(payment_id),
            status: ProviderPaymentStatus::Pending,
            ..Default::default()
        })
    }

    async fn create_subscription_intent(
        &self,
        request: &PaymentRequest,
        interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError> {
        let payment_id = format!("demo_sub_{}", random_hex16());
        log::info!(
            "Demo subscription {} created for user {} every {} days (auto_complete={})",
            payment_id,
            request.user_id,
            interval.days,
            self.auto_complete
        );

        if self.auto_complete {
            return Ok(PaymentResult {
                success: true,
                payment_url: None,
                charge_id: Some(payment_id.clone()),
                payment_id: Some(payment_id),
                status: ProviderPaymentStatus::Succeeded,
                payment_method_ref: Some(format!("demo_pm_{}", random_hex16())),
                error: None,
            });
        }

        self.register(&payment_id, request, true);
        Ok(PaymentResult {
            success: true,
            payment_url: Some(self.payment_url(&payment_id)),
            payment_id: Some(payment_id),
            status: ProviderPaymentStatus::Pending,
            ..Default::default()
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError> {
        log::info!(
            "Demo subscription {} cancelled ({})",
            subscription_id,
            reason.unwrap_or("no reason")
        );
        Ok(SubscriptionResult::ok())
    }

    async fn charge_stored_method(
        &self,
        payment_method_ref: &str,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, ProviderError> {
        if !payment_method_ref.starts_with("demo_pm_") {
            return Ok(PaymentResult::declined(format!(
                "unknown payment method {}",
                payment_method_ref
            )));
        }
        let charge_id = format!("demo_chg_{}", random_hex16());
        log::debug!("Demo charge {} of {} {}", charge_id, request.amount_minor, request.currency);
        Ok(PaymentResult {
            success: true,
            payment_id: Some(charge_id.clone()),
            charge_id: Some(charge_id),
            status: ProviderPaymentStatus::Succeeded,
            payment_method_ref: Some(payment_method_ref.to_string()),
            ..Default::default()
        })
    }

    /// Body must be signed with the webhook secret (hex HMAC-SHA256 of the raw body).
    fn verify_inbound_event(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        let (Some(secret), Some(signature)) = (&self.webhook_secret, signature) else {
            return false;
        };
        if !verify_hex(secret.expose_secret().as_bytes(), raw_payload, signature) {
            return false;
        }
        match serde_json::from_slice::<Value>(raw_payload) {
            Ok(payload) => has_generic_shape(&payload),
            Err(_) => false,
        }
    }

    fn parse_inbound_event(&self, raw_payload: &[u8]) -> Result<InboundPayment, ProviderError> {
        let payload: Value =
            serde_json::from_slice(raw_payload).map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        parse_generic(&payload)
    }

    async fn complete_manual_payment(&self, payment_id: &str) -> Result<InboundPayment, ProviderError> {
        let (_, payment) = self
            .payments
            .remove(payment_id)
            .ok_or_else(|| ProviderError::Api(format!("unknown demo payment {}", payment_id)))?;

        Ok(InboundPayment {
            order_ref: Some(payment.order_ref.clone()),
            provider_payment_id: Some(payment_id.to_string()),
            status: ProviderPaymentStatus::Succeeded,
            charge_id: Some(payment_id.to_string()),
            amount_minor: Some(payment.amount_minor),
            currency: Some(payment.currency.clone()),
            payment_method_ref: payment.recurring.then(|| format!("demo_pm_{}", random_hex16())),
            user_id: Some(payment.user_id),
            tariff: Some(payment.tariff.clone()),
            reason: None,
        })
    }
}

/// `{order_id|payment_id, status}` at minimum.
pub(crate) fn has_generic_shape(payload: &Value) -> bool {
    let has_id = field_str(payload, "order_id").is_some() || field_str(payload, "payment_id").is_some();
    has_id && field_str(payload, "status").is_some()
}

/// Generic normalized webhook body:
/// `{order_id, payment_id, charge_id, status, amount, currency, reason,
///   payment_method: {id, saved}, metadata: {user_id, tariff}}`
pub(crate) fn parse_generic(payload: &Value) -> Result<InboundPayment, ProviderError> {
    if !has_generic_shape(payload) {
        return Err(ProviderError::InvalidPayload(
            "order_id/payment_id and status are required".into(),
        ));
    }
    let status = field_str(payload, "status").map(|s| ProviderPaymentStatus::parse(&s)).unwrap_or_default();
    let metadata = payload.get("metadata").cloned().unwrap_or(Value::Null);
    let method = payload.get("payment_method").cloned().unwrap_or(Value::Null);
    let method_saved = method.get("saved").and_then(Value::as_bool).unwrap_or(false);

    let user_id = match field_str(&metadata, "user_id") {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ProviderError::InvalidPayload(format!("metadata.user_id is not an id: {}", raw)))?,
        ),
        None => None,
    };

    Ok(InboundPayment {
        order_ref: field_str(payload, "order_id").or_else(|| field_str(&metadata, "order_ref")),
        provider_payment_id: field_str(payload, "payment_id"),
        status,
        charge_id: field_str(payload, "charge_id").or_else(|| field_str(payload, "payment_id")),
        amount_minor: payload.get("amount").and_then(Value::as_i64),
        currency: field_str(payload, "currency"),
        payment_method_ref: if method_saved { field_str(&method, "id") } else { None },
        user_id,
        tariff: field_str(&metadata, "tariff"),
        reason: field_str(payload, "reason"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::provider::PaymentMetadata;
    use crate::payments::signature::sign_hex;
    use serde_json::json;

    fn request() -> PaymentRequest {
        PaymentRequest {
            user_id: 42,
            amount_minor: 40_000,
            currency: "RUB".into(),
            description: "Basic subscription, 30 days".into(),
            metadata: PaymentMetadata {
                order_ref: "ord_abc".into(),
                user_id: 42,
                tariff: "basic".into(),
            },
        }
    }

    fn provider(auto_complete: bool) -> DemoProvider {
        DemoProvider::new("test_bot", Some(SecretString::from("whsec")), auto_complete)
    }

    #[tokio::test]
    async fn test_one_time_payment_ids_and_link() {
        let result = provider(true).create_one_time_payment(&request()).await.unwrap();
        let id = result.payment_id.clone().unwrap();
        assert!(id.starts_with("demo_pay_"));
        assert_eq!(id.len(), "demo_pay_".len() + 16);
        assert_eq!(result.payment_url.clone().unwrap(), format!("https://t.me/test_bot?start={}", id));
        assert!(!result.is_captured());
    }

    #[tokio::test]
    async fn test_auto_complete_subscription_captures_method() {
        let result = provider(true)
            .create_subscription_intent(&request(), BillingInterval { days: 30 })
            .await
            .unwrap();
        assert!(result.is_captured());
        assert!(result.payment_id.unwrap().starts_with("demo_sub_"));
        assert!(result.payment_method_ref.unwrap().starts_with("demo_pm_"));
    }

    #[tokio::test]
    async fn test_manual_completion_round() {
        let provider = provider(false);
        let result = provider
            .create_subscription_intent(&request(), BillingInterval { days: 30 })
            .await
            .unwrap();
        assert!(!result.is_captured());

        let payment_id = result.payment_id.unwrap();
        let inbound = provider.complete_manual_payment(&payment_id).await.unwrap();
        assert_eq!(inbound.order_ref.as_deref(), Some("ord_abc"));
        assert_eq!(inbound.user_id, Some(42));
        assert_eq!(inbound.status, ProviderPaymentStatus::Succeeded);
        assert!(inbound.payment_method_ref.is_some());
        assert!(provider.payments.is_empty());

        // Completed payments are forgotten
        assert!(provider.complete_manual_payment(&payment_id).await.is_err());
        assert!(provider.complete_manual_payment("demo_pay_missing").await.is_err());
    }

    #[tokio::test]
    async fn test_captured_payments_are_not_kept() {
        let provider = provider(true);
        provider
            .create_subscription_intent(&request(), BillingInterval { days: 30 })
            .await
            .unwrap();
        provider.charge_stored_method("demo_pm_1", &request()).await.unwrap();
        assert!(provider.payments.is_empty());

        provider.create_one_time_payment(&request()).await.unwrap();
        assert_eq!(provider.payments.len(), 1);
    }

    #[tokio::test]
    async fn test_charge_unknown_method_is_declined() {
        let result = provider(true).charge_stored_method("pm_foreign", &request()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn test_verify_requires_signature_and_shape() {
        let provider = provider(true);
        let body = serde_json::to_vec(&json!({"order_id": "ord_abc", "status": "success"})).unwrap();
        let sig = sign_hex(b"whsec", &body);
        assert!(provider.verify_inbound_event(&body, Some(&sig)));
        assert!(!provider.verify_inbound_event(&body, None));
        assert!(!provider.verify_inbound_event(&body, Some("00")));

        let shapeless = serde_json::to_vec(&json!({"order_id": "ord_abc"})).unwrap();
        let sig = sign_hex(b"whsec", &shapeless);
        assert!(!provider.verify_inbound_event(&shapeless, Some(&sig)));
    }

    #[test]
    fn test_parse_generic_only_trusts_saved_methods() {
        let payload = json!({
            "order_id": "ord_abc",
            "payment_id": "p_1",
            "status": "succeeded",
            "amount": 40000,
            "currency": "RUB",
            "payment_method": {"id": "pm_1", "saved": false},
            "metadata": {"user_id": "42", "tariff": "basic"}
        });
        let inbound = parse_generic(&payload).unwrap();
        assert_eq!(inbound.charge_id.as_deref(), Some("p_1"));
        assert_eq!(inbound.user_id, Some(42));
        assert_eq!(inbound.payment_method_ref, None);
        assert_eq!(inbound.amount_minor, Some(40_000));
    }

    #[test]
    fn test_parse_generic_rejects_free_text_user() {
        let payload = json!({
            "order_id": "ord_abc",
            "status": "success",
            "metadata": {"user_id": "user 42"}
        });
        assert!(parse_generic(&payload).is_err());
    }
}
