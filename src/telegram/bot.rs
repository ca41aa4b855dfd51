//! Bot initialization and the command set

use std::time::Duration;

use anyhow::anyhow;
use reqwest::ClientBuilder;
use secrecy::ExposeSecret;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::core::config;

/// Upper bound for one Bot API request
const BOT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "register and show the menu")]
    Start(String),
    #[command(description = "show this help and the tariffs")]
    Help,
    #[command(description = "subscribe with auto-renewal: /subscribe [basic|standard|premium]")]
    Subscribe(String),
    #[command(description = "pay for one period without auto-renewal: /buy [tariff]")]
    Buy(String),
    #[command(description = "subscription status")]
    Status,
    #[command(description = "turn auto-renewal off")]
    Cancel,
    #[command(description = "latest payments")]
    History,
    #[command(rename = "demo_complete", description = "complete a demo payment: /demo_complete <payment id>")]
    DemoComplete(String),
    #[command(rename = "set_price", hide)]
    SetPrice(String),
    #[command(rename = "set_user_price", hide)]
    SetUserPrice(String),
    #[command(hide)]
    Prices,
}

/// Creates a Bot instance with custom or default API URL
pub fn create_bot() -> anyhow::Result<Bot> {
    let token = config::BOT_TOKEN
        .as_ref()
        .ok_or_else(|| anyhow!("BOT_TOKEN (or TELOXIDE_TOKEN) is not set"))?;
    let client = ClientBuilder::new().timeout(BOT_HTTP_TIMEOUT).build()?;
    let bot = Bot::with_client(token.expose_secret(), client);

    // Check if local Bot API server is configured
    let bot = match std::env::var("BOT_API_URL") {
        Ok(bot_api_url) => {
            log::info!("Using custom Bot API URL: {}", bot_api_url);
            let url = url::Url::parse(&bot_api_url).map_err(|e| anyhow!("Invalid BOT_API_URL: {}", e))?;
            bot.set_api_url(url)
        }
        Err(_) => bot,
    };

    Ok(bot)
}

/// Sets up bot commands in Telegram UI
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(Command::bot_commands()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands_with_arguments() {
        assert_eq!(
            Command::parse("/subscribe premium", "subgate_bot").unwrap(),
            Command::Subscribe("premium".into())
        );
        assert_eq!(Command::parse("/subscribe", "subgate_bot").unwrap(), Command::Subscribe(String::new()));
        assert_eq!(
            Command::parse("/start demo_pay_0123456789abcdef", "subgate_bot").unwrap(),
            Command::Start("demo_pay_0123456789abcdef".into())
        );
        assert_eq!(
            Command::parse("/demo_complete demo_sub_1", "subgate_bot").unwrap(),
            Command::DemoComplete("demo_sub_1".into())
        );
        assert_eq!(
            Command::parse("/set_price basic 50000 35000", "subgate_bot").unwrap(),
            Command::SetPrice("basic 50000 35000".into())
        );
        assert!(Command::parse("/unknown", "subgate_bot").is_err());
    }

    #[test]
    fn test_descriptions_list_every_command() {
        let help = Command::descriptions().to_string();
        for command in ["/subscribe", "/buy", "/status", "/cancel", "/history"] {
            assert!(help.contains(command), "missing {}", command);
        }
        // Admin commands stay out of the public help
        assert!(!help.contains("/set_price"));
        assert!(!help.contains("/prices"));
    }
}
