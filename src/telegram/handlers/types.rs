//! Handler types and dependencies

use std::sync::Arc;

use teloxide::types::Message;

use crate::subscription::SubscriptionService;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub service: Arc<SubscriptionService>,
}

impl HandlerDeps {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }
}

/// Telegram user behind a message; falls back to the private chat id.
pub(super) fn sender_id(msg: &Message) -> i64 {
    msg.from
        .as_ref()
        .and_then(|u| i64::try_from(u.id.0).ok())
        .unwrap_or(msg.chat.id.0)
}
