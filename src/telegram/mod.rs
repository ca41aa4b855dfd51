//! Telegram bot integration: command surface, notifications and group access

pub mod bot;
pub mod gateway;
pub mod handlers;

pub use bot::{create_bot, setup_bot_commands, Command};
pub use gateway::TelegramGateway;
pub use handlers::{schema, HandlerDeps, HandlerError};
