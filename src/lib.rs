//! Subgate - Telegram paid-group subscription bot
//!
//! The library holds the subscription engine and its adapters; the binary
//! only wires them together.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging and metrics
//! - `storage`: SQLite pool, migrations, user records and payment intents
//! - `payments`: provider adapters and the tariff catalogue
//! - `subscription`: state machine, engine, reminders and the sweeper
//! - `telegram`: bot commands, notifications and group access
//! - `webhook`: HTTP endpoint for provider webhooks

pub mod cli;
pub mod core;
pub mod payments;
pub mod storage;
pub mod subscription;
pub mod telegram;
pub mod webhook;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult};
pub use storage::{create_pool, get_connection, DbConnection, DbPool};
pub use subscription::{LifecyclePolicy, SubscriptionService};
