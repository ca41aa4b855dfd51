//! Dispatcher schema and handler chain builders

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{Message, PreCheckoutQuery};

use super::commands::{
    handle_cancel_command, handle_checkout_command, handle_demo_complete_command, handle_history_command,
    handle_prices_command, handle_set_price_command, handle_set_user_price_command, handle_start_command,
    handle_status_command, help_text,
};
use super::types::{sender_id, HandlerDeps, HandlerError};
use crate::payments::telegram_invoice::inbound_from_successful_payment;
use crate::telegram::bot::Command;

/// Creates the dispatcher schema for the bot.
///
/// The same tree serves production and tests.
pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_payment = deps.clone();
    let deps_commands = deps.clone();
    let deps_precheckout = deps;

    dptree::entry()
        // Successful payment handler must be first
        .branch(successful_payment_handler(deps_payment))
        .branch(command_handler(deps_commands))
        .branch(pre_checkout_handler(deps_precheckout))
}

/// Handler for successful Telegram payments
fn successful_payment_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.successful_payment().is_some())
        .endpoint(move |msg: Message| {
            let deps = deps.clone();
            async move {
                let Some(payment) = msg.successful_payment() else {
                    return Ok(());
                };
                let user_id = sender_id(&msg);
                log::info!(
                    "Received successful_payment from user {} (payload {})",
                    user_id,
                    payment.invoice_payload
                );

                // Activation is confirmed to the user by the payment notification
                let inbound = inbound_from_successful_payment(user_id, payment);
                if let Err(e) = deps.service.apply_inbound(inbound).await {
                    log::error!("Failed to apply successful payment for user {}: {}", user_id, e);
                }
                Ok(())
            }
        })
}

/// Handler for bot commands
fn command_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message().branch(dptree::entry().filter_command::<Command>().endpoint(
        move |bot: Bot, msg: Message, cmd: Command| {
            let deps = deps.clone();
            async move {
                match cmd {
                    Command::Start(payload) => handle_start_command(&bot, &msg, &deps, &payload).await?,
                    Command::Help => {
                        bot.send_message(msg.chat.id, help_text(&deps, sender_id(&msg))).await?;
                    }
                    Command::Subscribe(tariff) => handle_checkout_command(&bot, &msg, &deps, &tariff, true).await?,
                    Command::Buy(tariff) => handle_checkout_command(&bot, &msg, &deps, &tariff, false).await?,
                    Command::Status => handle_status_command(&bot, &msg, &deps).await?,
                    Command::Cancel => handle_cancel_command(&bot, &msg, &deps).await?,
                    Command::History => handle_history_command(&bot, &msg, &deps).await?,
                    Command::DemoComplete(payment_id) => {
                        handle_demo_complete_command(&bot, &msg, &deps, &payment_id).await?
                    }
                    Command::SetPrice(args) => handle_set_price_command(&bot, &msg, &deps, &args).await?,
                    Command::SetUserPrice(args) => handle_set_user_price_command(&bot, &msg, &deps, &args).await?,
                    Command::Prices => handle_prices_command(&bot, &msg, &deps).await?,
                }
                Ok(())
            }
        },
    ))
}

/// Handler for pre-checkout queries: the invoice must match a pending order.
fn pre_checkout_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_pre_checkout_query().endpoint(move |bot: Bot, query: PreCheckoutQuery| {
        let deps = deps.clone();
        async move {
            let user_id = i64::try_from(query.from.id.0).unwrap_or_default();
            let verdict = deps.service.validate_invoice(
                &query.invoice_payload,
                user_id,
                i64::from(query.total_amount),
                &query.currency,
            );

            match verdict {
                Ok(true) => {
                    bot.answer_pre_checkout_query(query.id.clone(), true).await?;
                }
                Ok(false) => {
                    log::warn!(
                        "Rejected pre-checkout {} from user {} (payload {})",
                        query.id,
                        user_id,
                        query.invoice_payload
                    );
                    bot.answer_pre_checkout_query(query.id.clone(), false)
                        .error_message("This order is no longer valid. Please start a new one with /subscribe.")
                        .await?;
                }
                Err(e) => {
                    log::error!("Pre-checkout validation failed for user {}: {}", user_id, e);
                    bot.answer_pre_checkout_query(query.id.clone(), false)
                        .error_message(e.user_message())
                        .await?;
                }
            }
            Ok(())
        }
    })
}
