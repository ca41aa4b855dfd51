//! In-chat invoices through the Bot API.
//!
//! Confirmation arrives as a `successful_payment` message rather than an
//! HTTP webhook, so this provider accepts no webhooks at all; the bot layer
//! turns the message into an [`InboundPayment`] itself.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use teloxide::prelude::*;
use teloxide::types::LabeledPrice;

use crate::payments::provider::{
    BillingInterval, InboundPayment, PaymentProvider, PaymentRequest, PaymentResult, ProviderError,
    ProviderPaymentStatus, SubscriptionResult,
};

pub struct TelegramInvoiceProvider {
    bot: Bot,
    provider_token: Option<SecretString>,
}

impl TelegramInvoiceProvider {
    /// `provider_token` is required for fiat currencies and must be absent for Stars (XTR).
    pub fn new(bot: Bot, provider_token: Option<SecretString>) -> Self {
        Self { bot, provider_token }
    }

    async fn invoice_link(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        let amount = u32::try_from(request.amount_minor)
            .map_err(|_| ProviderError::InvalidPayload(format!("amount {} out of range", request.amount_minor)))?;

        let mut invoice = self.bot.create_invoice_link(
            request.description.clone(),
            request.description.clone(),
            request.metadata.order_ref.clone(),
            request.currency.clone(),
            vec![LabeledPrice::new(request.metadata.tariff.clone(), amount)],
        );
        if let Some(token) = &self.provider_token {
            invoice = invoice.provider_token(token.expose_secret().to_string());
        }
        let link = invoice.await?;

        log::info!(
            "Invoice link for order {} (user {}): {}",
            request.metadata.order_ref,
            request.user_id,
            link
        );
        Ok(PaymentResult {
            success: true,
            payment_url: Some(link),
            payment_id: Some(request.metadata.order_ref.clone()),
            status: ProviderPaymentStatus::Pending,
            ..Default::default()
        })
    }
}

#[async_trait]
impl PaymentProvider for TelegramInvoiceProvider {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn create_one_time_payment(&self, request: &PaymentRequest) -> Result<PaymentResult, ProviderError> {
        self.invoice_link(request).await
    }

    /// Plain invoice for the first period; renewal happens by paying again.
    async fn create_subscription_intent(
        &self,
        request: &PaymentRequest,
        _interval: BillingInterval,
    ) -> Result<PaymentResult, ProviderError> {
        self.invoice_link(request).await
    }

    async fn cancel_subscription(
        &self,
        _subscription_id: &str,
        _reason: Option<&str>,
    ) -> Result<SubscriptionResult, ProviderError> {
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

    fn verify_inbound_event(&self, _raw_payload: &[u8], _signature: Option<&str>) -> bool {
        false
    }

    fn parse_inbound_event(&self, _raw_payload: &[u8]) -> Result<InboundPayment, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.name(),
            operation: "HTTP webhooks",
        })
    }
}

/// Normalizes a Bot API `successful_payment` message.
pub fn inbound_from_successful_payment(user_id: i64, payment: &teloxide::types::SuccessfulPayment) -> InboundPayment {
    InboundPayment {
        order_ref: Some(payment.invoice_payload.clone()),
        provider_payment_id: Some(payment.provider_payment_charge_id.clone()),
        status: ProviderPaymentStatus::Succeeded,
        charge_id: Some(payment.telegram_payment_charge_id.0.clone()),
        amount_minor: Some(i64::from(payment.total_amount)),
        currency: Some(payment.currency.clone()),
        payment_method_ref: None,
        user_id: Some(user_id),
        tariff: None,
        reason: None,
    }
}
