//! Redirect-link gateway: the user pays on a hosted form reached through a
//! signed URL, the gateway reports back with a signed webhook.
//!
//! The gateway keeps no reusable payment method for us, so subscriptions
//! created here never enable auto-renewal.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use url::Url;

use crate::payments::provider::{
    format_major_units, parse_minor_units, BillingInterval, InboundPayment, PaymentProvider, PaymentRequest,
    PaymentResult, ProviderError, ProviderPaymentStatus, SubscriptionResult,
};
use crate::payments::signature::{field_str, sign_canonical, verify_canonical};

pub struct RedirectLinkProvider {
    form_url: String,
    secret_key: SecretString,
    return_url: String,
    live_mode: bool,
}

impl RedirectLinkProvider {
    pub fn new(form_url: impl Into<String>, secret_key: SecretString, return_url: impl Into<String>, live_mode: bool) -> Self {
        Self {
            form_url: form_url.into(),
            secret_key,
            return_url: return_url.into(),
            live_mode,
        }
    }

    fn form_params(&self, request: &PaymentRequest, recurring: Option<BillingInterval>) -> Value {
        let mut params = json!({
            "do": "pay",
            "order_id": request.metadata.order_ref,
            "sum": format_major_units(request.amount_minor),
            "currency": request.currency,
            "customer_extra": request.description,
            "urlSuccess": self.return_url,
            "urlReturn": self.return_url,
            "metadata": request.metadata.to_map(),
        });
        if !self.live_mode {
            params["demo_mode"] = json!("1");
        }
        if let Some(interval) = recurring {
            params["subscription_period_days"] = json!(interval.days.to_string());
        }
        params
    }

    fn build_link(&self, request: &PaymentRequest, recurring: Option<BillingInterval>) -> Result<String, ProviderError> {
        let mut params = self.form_params(request, recurring);
        let signature = sign_canonical(self.secret_key.expose_secret().as_bytes(), &params);
        params["signature"] = json!(signature);

        let mut url = Url::parse(&self.form_url)
            .map_err(|e| ProviderError::Api(format!("bad form url {}: {}", self.form_url, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Value::Object(map) = &params {
                for (key, value) in map {
                    match value {
                        Value::Object(nested) => {
                            for (nested_key, nested_value) in nested {
                                query.append_pair(&format!("{}[{}]", key, nested_key), &scalar(nested_value));
                            }
                        }
                        other => {
                            query.append_pair(key, &scalar(other));
                        }
                    }
                }
            }
        }
        Ok(url.to_string())
    }

    async fn create_link(
        &self,
        request: &PaymentRequest,
        recurring: Option<BillingInterval>,
    ) -> Result<PaymentResult, ProviderError> {
        let url = self.build_link(request, recurring)?;
        log::info!(
            "Payment link for order {} (user {}, {} {})",
            request.metadata.order_ref,
            request.user_id,
            request.amount_minor,
            request.currency
        );
        Ok(PaymentResult {
            success: true,
            payment_url: Some(url),
            payment_id: Some(request.metadata.order_ref.clone()),
            status: ProviderPaymentStatus::Pending,
            ..Default::default()
        })
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl PaymentProvider for RedirectLinkProvider {
    fn name(&self) -> &'static str {
        "redirect"
    }

    async fn create_one_time_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        self.create_link(request, None).await
    }

    async fn create_subscription_intent(
        &self,
        request: &PaymentRequest,
        interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError> {
        self.create_link(request, Some(interval)).await
    }

    /// Nothing is held at the gateway, so there is nothing to cancel remotely.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError> {
        log::info!(
            "Gateway subscription {} dropped locally ({})",
            subscription_id,
            reason.unwrap_or("no reason")
        );
        Ok(SubscriptionResult::ok())
    }

    async fn charge_stored_method(
        &self,
        _payment_method_ref: &str,
        _request: &PaymentRequest,
    ) -> Result<PaymentResult, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name(),
            operation: "unattended charges",
        })
    }

    /// Signature is the hex HMAC of the canonical JSON of the payload.
    fn verify_inbound_event(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature else {
            return false;
        };
        let Ok(payload) = serde_json::from_slice::<Value>(raw_payload) else {
            return false;
        };
        if field_str(&payload, "order_id").is_none() || field_str(&payload, "status").is_none() {
            return false;
        }
        verify_canonical(self.secret_key.expose_secret().as_bytes(), &payload, signature)
    }

    fn parse_inbound_event(&self, raw_payload: &[u8]) -> Result<InboundPayment, ProviderError> {
        let payload: Value =
            serde_json::from_slice(raw_payload).map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        let order_ref = field_str(&payload, "order_id")
            .ok_or_else(|| ProviderError::InvalidPayload("order_id is required".into()))?;
        let status = field_str(&payload, "status")
            .map(|s| ProviderPaymentStatus::parse(&s))
            .ok_or_else(|| ProviderError::InvalidPayload("status is required".into()))?;
        let metadata = payload.get("metadata").cloned().unwrap_or(Value::Null);
        let user_id = match field_str(&metadata, "user_id") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ProviderError::InvalidPayload(format!("metadata.user_id is not an id: {}", raw)))?,
            ),
            None => None,
        };

        Ok(InboundPayment {
            charge_id: field_str(&payload, "payment_id").or_else(|| Some(order_ref.clone())),
            provider_payment_id: field_str(&payload, "payment_id"),
            order_ref: Some(order_ref),
            status,
            amount_minor: field_str(&payload, "sum").and_then(|s| parse_minor_units(&s)),
            currency: field_str(&payload, "currency"),
            payment_method_ref: None,
            user_id,
            tariff: field_str(&metadata, "tariff"),
            reason: field_str(&payload, "reason"),
        })
    }
}
