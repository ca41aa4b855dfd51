//! JSON-over-HTTP gateway with saved payment methods and unattended charges.
//!
//! Payments are created with `POST {api}/payments` under basic auth and an
//! `Idempotence-Key`. The first payment of a subscription asks the gateway to
//! save the method; the method id is only trusted when the gateway reports it
//! as `saved`.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::payments::provider::{
    format_major_units, parse_minor_units, BillingInterval, InboundPayment, PaymentProvider, PaymentRequest,
    PaymentResult, ProviderError, ProviderPaymentStatus, SubscriptionResult,
};
use crate::payments::signature::verify_hex;

#[derive(Debug, Deserialize)]
struct ApiAmount {
    value: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct ApiConfirmation {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPaymentMethod {
    id: String,
    #[serde(default)]
    saved: bool,
}

#[derive(Debug, Deserialize)]
struct ApiCancellation {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPayment {
    id: String,
    status: String,
    amount: Option<ApiAmount>,
    confirmation: Option<ApiConfirmation>,
    payment_method: Option<ApiPaymentMethod>,
    cancellation_details: Option<ApiCancellation>,
    #[serde(default)]
    metadata: Option<Value>,
}

impl ApiPayment {
    fn saved_method(&self) -> Option<String> {
        self.payment_method.as_ref().filter(|m| m.saved).map(|m| m.id.clone())
    }

    fn into_result(self) -> PaymentResult {
        let status = ProviderPaymentStatus::parse(&self.status);
        let method = self.saved_method();
        let error = match status {
            ProviderPaymentStatus::Failed | ProviderPaymentStatus::Cancelled => Some(
                self.cancellation_details
                    .and_then(|c| c.reason)
                    .unwrap_or_else(|| self.status.clone()),
            ),
            _ => None,
        };
        PaymentResult {
            success: error.is_none(),
            payment_url: self.confirmation.and_then(|c| c.confirmation_url),
            charge_id: (status == ProviderPaymentStatus::Succeeded).then(|| self.id.clone()),
            payment_id: Some(self.id),
            error,
            status,
            payment_method_ref: method,
        }
    }

    fn into_inbound(self) -> Result<InboundPayment, ProviderError> {
        let metadata = self.metadata.clone().unwrap_or(Value::Null);
        let meta_str = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);
        let user_id = match meta_str("user_id") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ProviderError::InvalidPayload(format!("metadata.user_id is not an id: {}", raw)))?,
            ),
            None => None,
        };
        let method = self.saved_method();
        Ok(InboundPayment {
            order_ref: meta_str("order_ref"),
            provider_payment_id: Some(self.id.clone()),
            status: ProviderPaymentStatus::parse(&self.status),
            charge_id: Some(self.id),
            amount_minor: self.amount.as_ref().and_then(|a| parse_minor_units(&a.value)),
            currency: self.amount.map(|a| a.currency),
            payment_method_ref: method,
            user_id,
            tariff: meta_str("tariff"),
            reason: self.cancellation_details.and_then(|c| c.reason),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiNotification {
    #[serde(default)]
    event: Option<String>,
    object: ApiPayment,
}

pub struct RecurringApiProvider {
    client: reqwest::Client,
    api_url: String,
    shop_id: String,
    secret_key: SecretString,
    webhook_secret: Option<SecretString>,
    return_url: String,
    live_mode: bool,
}

impl RecurringApiProvider {
    pub fn new(
        api_url: impl Into<String>,
        shop_id: impl Into<String>,
        secret_key: SecretString,
        webhook_secret: Option<SecretString>,
        return_url: impl Into<String>,
        live_mode: bool,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            shop_id: shop_id.into(),
            secret_key,
            webhook_secret,
            return_url: return_url.into(),
            live_mode,
        })
    }

    async fn post_payment(&self, body: Value) -> Result<ApiPayment, ProviderError> {
        let idempotence_key = uuid::Uuid::new_v4().to_string();
        let response = self
            .client
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(self.secret_key.expose_secret()))
            .header("Idempotence-Key", idempotence_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::warn!("Payment API returned {}: {}", status, text);
            return Err(ProviderError::Api(format!("HTTP {}: {}", status, text)));
        }
        Ok(response.json::<ApiPayment>().await?)
    }

    fn payment_body(&self, request: &PaymentRequest) -> Value {
        json!({
            "amount": {
                "value": format_major_units(request.amount_minor),
                "currency": request.currency,
            },
            "capture": true,
            "description": request.description,
            "metadata": request.metadata.to_map(),
        })
    }
}

#[async_trait]
impl PaymentProvider for RecurringApiProvider {
    fn name(&self) -> &'static str {
        "recurring_api"
    }

    async fn create_one_time_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        let mut body = self.payment_body(request);
        body["confirmation"] = json!({"type": "redirect", "return_url": self.return_url});
        let payment = self.post_payment(body).await?;
        log::info!("Created payment {} for user {}", payment.id, request.user_id);
        Ok(payment.into_result())
    }

    async fn create_subscription_intent(
        &self,
        request: &PaymentRequest,
        interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError> {
        let mut body = self.payment_body(request);
        body["confirmation"] = json!({"type": "redirect", "return_url": self.return_url});
        // Test shops do not keep methods; asking anyway gets the request refused.
        body["save_payment_method"] = json!(self.live_mode);
        body["metadata"]["interval_days"] = json!(interval.days.to_string());
        let payment = self.post_payment(body).await?;
        log::info!(
            "Created subscription payment {} for user {} (save_method={})",
            payment.id,
            request.user_id,
            self.live_mode
        );
        Ok(payment.into_result())
    }

    /// Saved methods live with us; forgetting the reference is the cancellation.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError> {
        log::info!(
            "Dropping saved method for {} ({})",
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
        let mut body = self.payment_body(request);
        body["payment_method_id"] = json!(payment_method_ref);
        let payment = self.post_payment(body).await?;
        log::info!(
            "Unattended charge {} for user {}: {}",
            payment.id,
            request.user_id,
            payment.status
        );
        let mut result = payment.into_result();
        // The charge must be captured right away; anything else is a failed attempt
        if result.success && result.status != ProviderPaymentStatus::Succeeded {
            result.success = false;
            result.error = Some(format!("charge not captured (status {:?})", result.status));
        }
        Ok(result)
    }

    fn verify_inbound_event(&self, raw_payload: &[u8], signature: Option<&str>) -> bool {
        let (Some(secret), Some(signature)) = (self.webhook_secret.as_ref(), signature) else {
            return false;
        };
        if !verify_hex(secret.expose_secret().as_bytes(), raw_payload, signature) {
            return false;
        }
        serde_json::from_slice::<ApiNotification>(raw_payload)
            .map(|n| !n.object.id.is_empty() && !n.object.status.is_empty())
            .unwrap_or(false)
    }

    fn parse_inbound_event(&self, raw_payload: &[u8]) -> Result<InboundPayment, ProviderError> {
        let notification: ApiNotification =
            serde_json::from_slice(raw_payload).map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        log::debug!(
            "Notification {} for payment {}",
            notification.event.as_deref().unwrap_or("-"),
            notification.object.id
        );
        notification.object.into_inbound()
    }
}
