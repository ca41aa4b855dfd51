//! Payment providers behind one capability interface

pub mod demo;
pub mod provider;
pub mod recurring_api;
pub mod redirect;
pub mod signature;
pub mod tariffs;
pub mod telegram_invoice;

use std::sync::Arc;

use anyhow::{anyhow, Result};

pub use demo::DemoProvider;
pub use provider::{
    format_major_units, BillingInterval, InboundPayment, PaymentMetadata, PaymentProvider, PaymentRequest, PaymentResult, ProviderError,
    ProviderPaymentStatus, SubscriptionResult,
};
pub use recurring_api::RecurringApiProvider;
pub use redirect::RedirectLinkProvider;
pub use tariffs::{Tariff, TariffCatalog};
pub use telegram_invoice::TelegramInvoiceProvider;

use crate::core::config;

/// Builds the provider selected by `PAYMENT_PROVIDER`.
pub fn build_provider(bot: Option<teloxide::Bot>) -> Result<Arc<dyn PaymentProvider>> {
    let webhook_secret = config::webhook::SECRET.clone().or_else(|| config::payments::SECRET_KEY.clone());

    let provider: Arc<dyn PaymentProvider> = match config::payments::PROVIDER.as_str() {
        "demo" => Arc::new(DemoProvider::new(
            config::BOT_USERNAME.as_str(),
            webhook_secret,
            *config::payments::DEMO_AUTO_COMPLETE,
        )),
        "redirect" => {
            let form_url = config::payments::FORM_URL
                .clone()
                .ok_or_else(|| anyhow!("PAYMENT_FORM_URL is required for the redirect provider"))?;
            let secret = config::payments::SECRET_KEY
                .clone()
                .ok_or_else(|| anyhow!("PAYMENT_SECRET_KEY is required for the redirect provider"))?;
            Arc::new(RedirectLinkProvider::new(
                form_url,
                secret,
                config::payments::RETURN_URL.as_str(),
                *config::payments::LIVE_MODE,
            ))
        }
        "recurring_api" => {
            let shop_id = config::payments::SHOP_ID
                .clone()
                .ok_or_else(|| anyhow!("PAYMENT_SHOP_ID is required for the recurring_api provider"))?;
            let secret = config::payments::SECRET_KEY
                .clone()
                .ok_or_else(|| anyhow!("PAYMENT_SECRET_KEY is required for the recurring_api provider"))?;
            Arc::new(RecurringApiProvider::new(
                config::payments::API_URL.as_str(),
                shop_id,
                secret,
                config::webhook::SECRET.clone(),
                config::payments::RETURN_URL.as_str(),
                *config::payments::LIVE_MODE,
                config::payments::provider_timeout(),
            )?)
        }
        "telegram" => {
            let bot = bot.ok_or_else(|| anyhow!("the telegram provider needs a bot token"))?;
            Arc::new(TelegramInvoiceProvider::new(bot, config::payments::SECRET_KEY.clone()))
        }
        other => return Err(anyhow!("unknown PAYMENT_PROVIDER '{}'", other)),
    };

    log::info!("Payment provider: {}", provider.name());
    Ok(provider)
}
