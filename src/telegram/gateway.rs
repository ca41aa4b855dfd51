use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::UserId;

use crate::subscription::{CollaboratorError, GroupMembership, Notification, Notifier};

/// Delivers notifications as private messages and manages membership of
/// the subscription group through ban/unban.
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
    group_chat_id: Option<ChatId>,
}

impl TelegramGateway {
    pub fn new(bot: Bot, group_chat_id: Option<i64>) -> Self {
        Self {
            bot,
            group_chat_id: group_chat_id.map(ChatId),
        }
    }

    fn group(&self) -> Result<ChatId, CollaboratorError> {
        self.group_chat_id.ok_or(CollaboratorError::NotConfigured("GROUP_CHAT_ID"))
    }
}

fn telegram_user(user_id: i64) -> Result<UserId, CollaboratorError> {
    u64::try_from(user_id)
        .map(UserId)
        .map_err(|_| CollaboratorError::Other(format!("{} is not a Telegram user id", user_id)))
}

#[async_trait]
impl Notifier for TelegramGateway {
    async fn notify(&self, user_id: i64, notification: &Notification) -> Result<(), CollaboratorError> {
        self.bot.send_message(ChatId(user_id), notification.render()).await?;
        log::debug!("Sent {} to user {}", notification.kind(), user_id);
        Ok(())
    }
}

#[async_trait]
impl GroupMembership for TelegramGateway {
    async fn revoke(&self, user_id: i64) -> Result<(), CollaboratorError> {
        let group = self.group()?;
        self.bot.ban_chat_member(group, telegram_user(user_id)?).await?;
        log::info!("Removed user {} from group {}", user_id, group);
        Ok(())
    }

    async fn restore(&self, user_id: i64) -> Result<(), CollaboratorError> {
        let group = self.group()?;
        self.bot
            .unban_chat_member(group, telegram_user(user_id)?)
            .only_if_banned(true)
            .await?;
        log::info!("Lifted removal of user {} from group {}", user_id, group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_ids_are_not_users() {
        assert!(telegram_user(-100).is_err());
        assert_eq!(telegram_user(42).unwrap(), UserId(42));
    }

    #[tokio::test]
    async fn test_revoke_without_group_is_not_configured() {
        let gateway = TelegramGateway::new(Bot::new("123:test"), None);
        let err = gateway.revoke(42).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotConfigured("GROUP_CHAT_ID")));
    }
}
