//! Command handler implementations

use teloxide::prelude::*;
use teloxide::types::Message;
use teloxide::utils::command::BotCommands;

use super::types::{sender_id, HandlerDeps, HandlerError};
use crate::payments::format_major_units;
use crate::subscription::{CancelOutcome, CheckoutOutcome, InboundOutcome, ServiceError};
use crate::telegram::bot::Command;

const HISTORY_LIMIT: usize = 10;

/// Optional command argument, `None` when blank.
fn argument(raw: &str) -> Option<&str> {
    Some(raw.trim()).filter(|s| !s.is_empty())
}

async fn reply_error(bot: &Bot, msg: &Message, command: &str, err: &ServiceError) -> Result<(), HandlerError> {
    if err.is_transient() {
        log::warn!("{} failed for chat {}: {}", command, msg.chat.id, err);
    } else {
        log::error!("{} failed for chat {}: {}", command, msg.chat.id, err);
    }
    bot.send_message(msg.chat.id, err.user_message()).await?;
    Ok(())
}

/// Command list plus the tariffs at the prices this user would pay.
pub(super) fn help_text(deps: &HandlerDeps, user_id: i64) -> String {
    let tariffs: Vec<String> = deps
        .service
        .tariffs()
        .all()
        .iter()
        .map(|t| {
            let price = match deps.service.quote(user_id, Some(&t.id)) {
                Ok(quote) => quote.amount_minor,
                Err(e) => {
                    log::warn!("Could not quote {} for user {}: {}", t.id, user_id, e);
                    t.price_minor
                }
            };
            format!(
                "• {} ({}): {} {} for {} days",
                t.title,
                t.id,
                format_major_units(price),
                t.currency,
                t.period_days
            )
        })
        .collect();
    format!("{}\n\nTariffs:\n{}", Command::descriptions(), tariffs.join("\n"))
}

/// Handle /start, including deep links back from a demo payment page.
pub(super) async fn handle_start_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    payload: &str,
) -> Result<(), HandlerError> {
    let user_id = sender_id(msg);
    if let Err(e) = deps.service.start(user_id) {
        return reply_error(bot, msg, "/start", &e).await;
    }

    if let Some(payment_id) = argument(payload) {
        if deps.service.supports_manual_completion() {
            return handle_demo_complete_command(bot, msg, deps, payment_id).await;
        }
        log::info!("Ignoring /start payload {} from user {}", payment_id, user_id);
    }

    bot.send_message(msg.chat.id, format!("Welcome!\n\n{}", help_text(deps, user_id)))
        .await?;
    Ok(())
}

pub(super) async fn handle_checkout_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    tariff: &str,
    recurring: bool,
) -> Result<(), HandlerError> {
    let user_id = sender_id(msg);
    let result = if recurring {
        deps.service.subscribe(user_id, argument(tariff)).await
    } else {
        deps.service.purchase(user_id, argument(tariff)).await
    };

    match result {
        Ok(CheckoutOutcome::AwaitingPayment { payment_url, .. }) => {
            bot.send_message(msg.chat.id, format!("Complete the payment here:\n{}", payment_url))
                .await?;
        }
        // The outcome notification has already been sent
        Ok(CheckoutOutcome::Activated(_)) | Ok(CheckoutOutcome::Declined { .. }) => {}
        Err(e) => {
            let command = if recurring { "/subscribe" } else { "/buy" };
            reply_error(bot, msg, command, &e).await?;
        }
    }
    Ok(())
}

pub(super) async fn handle_status_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    match deps.service.status(sender_id(msg)) {
        Ok(status) => {
            bot.send_message(msg.chat.id, status.render()).await?;
            Ok(())
        }
        Err(e) => reply_error(bot, msg, "/status", &e).await,
    }
}

pub(super) async fn handle_cancel_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    match deps.service.cancel_auto_renewal(sender_id(msg)).await {
        // Confirmation goes out as an auto_renewal_disabled notification
        Ok(CancelOutcome::Cancelled { .. }) => Ok(()),
        Ok(outcome @ CancelOutcome::NotActive) => {
            bot.send_message(msg.chat.id, outcome.message()).await?;
            Ok(())
        }
        Err(e) => reply_error(bot, msg, "/cancel", &e).await,
    }
}

pub(super) async fn handle_history_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let history = match deps.service.history(sender_id(msg), HISTORY_LIMIT) {
        Ok(history) => history,
        Err(e) => return reply_error(bot, msg, "/history", &e).await,
    };

    let text = if history.is_empty() {
        "No payments yet.".to_string()
    } else {
        history
            .iter()
            .map(|event| {
                format!(
                    "{} {} {} {} ({})",
                    event.timestamp.format("%Y-%m-%d"),
                    format_major_units(event.amount_minor),
                    event.currency,
                    event.status,
                    event.tariff.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub(super) async fn handle_demo_complete_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    payment_id: &str,
) -> Result<(), HandlerError> {
    let Some(payment_id) = argument(payment_id) else {
        bot.send_message(msg.chat.id, "Usage: /demo_complete <payment id>").await?;
        return Ok(());
    };

    match deps.service.complete_manual_payment(sender_id(msg), payment_id).await {
        Ok(InboundOutcome::Applied(_)) => {}
        Ok(InboundOutcome::Duplicate(_)) => {
            bot.send_message(msg.chat.id, "This payment was already completed.").await?;
        }
        Ok(InboundOutcome::Ignored(reason)) => {
            bot.send_message(msg.chat.id, format!("Nothing to do: {}.", reason)).await?;
        }
        Err(e) => reply_error(bot, msg, "/demo_complete", &e).await?,
    }
    Ok(())
}

/// `<tariff> <regular> [returning]`, prices in minor units.
fn parse_set_price(args: &str) -> Result<(String, i64, Option<i64>), &'static str> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let price = |raw: &str| raw.parse::<i64>().map_err(|_| "prices must be whole numbers in minor units");
    match parts.as_slice() {
        [tariff, regular] => Ok((tariff.to_string(), price(regular)?, None)),
        [tariff, regular, returning] => Ok((tariff.to_string(), price(regular)?, Some(price(returning)?))),
        _ => Err("usage: /set_price <tariff> <regular> [returning]"),
    }
}

/// `<user id> <price|reset>`
fn parse_set_user_price(args: &str) -> Result<(i64, Option<i64>), &'static str> {
    const USAGE: &str = "usage: /set_user_price <user id> <price|reset>";
    let parts: Vec<&str> = args.split_whitespace().collect();
    let [user, price] = parts.as_slice() else {
        return Err(USAGE);
    };
    let user_id = user.parse::<i64>().map_err(|_| USAGE)?;
    if price.eq_ignore_ascii_case("reset") {
        return Ok((user_id, None));
    }
    let price = price
        .parse::<i64>()
        .map_err(|_| "the price must be a whole number in minor units")?;
    Ok((user_id, Some(price)))
}

async fn deny_non_admin(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<bool, HandlerError> {
    if deps.service.is_admin(sender_id(msg)) {
        return Ok(false);
    }
    bot.send_message(msg.chat.id, "This command is only available to administrators.")
        .await?;
    Ok(true)
}

/// Handle /set_price (admin only)
pub(super) async fn handle_set_price_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    args: &str,
) -> Result<(), HandlerError> {
    if deny_non_admin(bot, msg, deps).await? {
        return Ok(());
    }
    let (tariff, regular, returning) = match parse_set_price(args) {
        Ok(parsed) => parsed,
        Err(usage) => {
            bot.send_message(msg.chat.id, usage).await?;
            return Ok(());
        }
    };

    match deps.service.set_tariff_price(sender_id(msg), &tariff, regular, returning) {
        Ok(price) => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "Prices for {} updated:\nRegular: {}\nReturning: {}",
                    price.tariff,
                    format_major_units(price.regular_minor),
                    format_major_units(price.returning_minor)
                ),
            )
            .await?;
        }
        Err(e) => reply_error(bot, msg, "/set_price", &e).await?,
    }
    Ok(())
}

/// Handle /set_user_price (admin only)
pub(super) async fn handle_set_user_price_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    args: &str,
) -> Result<(), HandlerError> {
    if deny_non_admin(bot, msg, deps).await? {
        return Ok(());
    }
    let (user_id, price) = match parse_set_user_price(args) {
        Ok(parsed) => parsed,
        Err(usage) => {
            bot.send_message(msg.chat.id, usage).await?;
            return Ok(());
        }
    };

    match deps.service.set_user_price(sender_id(msg), user_id, price) {
        Ok(()) => {
            let text = match price {
                Some(price) => format!("User {} now pays {}.", user_id, format_major_units(price)),
                None => format!("Personal price of user {} removed.", user_id),
            };
            bot.send_message(msg.chat.id, text).await?;
        }
        Err(e) => reply_error(bot, msg, "/set_user_price", &e).await?,
    }
    Ok(())
}

/// Handle /prices (admin only)
pub(super) async fn handle_prices_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    if deny_non_admin(bot, msg, deps).await? {
        return Ok(());
    }
    let list = match deps.service.price_list(sender_id(msg)) {
        Ok(list) => list,
        Err(e) => return reply_error(bot, msg, "/prices", &e).await,
    };

    let lines: Vec<String> = list
        .iter()
        .map(|entry| {
            format!(
                "{}: {} / {} returning {}{}",
                entry.tariff.id,
                format_major_units(entry.regular_minor),
                format_major_units(entry.returning_minor),
                entry.tariff.currency,
                if entry.overridden { "" } else { " (configured)" }
            )
        })
        .collect();
    bot.send_message(msg.chat.id, lines.join("\n")).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_arguments_are_none() {
        assert_eq!(argument("  "), None);
        assert_eq!(argument(" premium "), Some("premium"));
    }

    #[test]
    fn test_parse_set_price() {
        assert_eq!(parse_set_price("basic 50000"), Ok(("basic".to_string(), 50_000, None)));
        assert_eq!(
            parse_set_price(" premium 90000  70000 "),
            Ok(("premium".to_string(), 90_000, Some(70_000)))
        );
        assert!(parse_set_price("basic").is_err());
        assert!(parse_set_price("basic 12.5").is_err());
        assert!(parse_set_price("basic 1 2 3").is_err());
    }

    #[test]
    fn test_parse_set_user_price() {
        assert_eq!(parse_set_user_price("42 9900"), Ok((42, Some(9_900))));
        assert_eq!(parse_set_user_price("42 RESET"), Ok((42, None)));
        assert!(parse_set_user_price("bob 9900").is_err());
        assert!(parse_set_user_price("42").is_err());
    }
}
