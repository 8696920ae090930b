//! Messaging client: the seam between the bot's features and Telegram.

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{info, warn};

/// A chat user as seen by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: i64,
    pub display_name: String,
    pub username: Option<String>,
}

impl ChatUser {
    /// `@username` when known, otherwise the display name.
    pub fn mention(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username}"),
            None => self.display_name.clone(),
        }
    }
}

/// A group or channel the bot can post to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChannel {
    pub id: i64,
    pub member_count: u32,
}

/// Outbound messaging used by the Santa engine, relays and reminders.
///
/// Every call may fail (network, blocked bot, missing permissions).
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn fetch_user(&self, user_id: i64) -> Result<ChatUser, String>;

    /// Send a private message. Returns the sent message id.
    async fn send_direct_message(&self, user_id: i64, text: &str) -> Result<i64, String>;

    async fn fetch_channel(&self, chat_id: i64) -> Result<ChatChannel, String>;

    /// Post to a group/channel. Returns the sent message id.
    async fn send_to_channel(&self, chat_id: i64, text: &str) -> Result<i64, String>;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
    /// Group used to resolve member info (the Santa channel).
    home_chat: i64,
    dry_run: bool,
}

impl TelegramClient {
    pub fn new(bot: Bot, home_chat: i64, dry_run: bool) -> Self {
        Self { bot, home_chat, dry_run }
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        if self.dry_run {
            info!("[DRY RUN] Would send to {}: {:?}", chat_id, text.chars().take(80).collect::<String>());
            return Ok(0);
        }

        // Plain text on purpose: registrations carry user-written addresses and notes.
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                let msg = format!("Failed to send to {chat_id}: {e}");
                warn!("{}", msg);
                msg
            })
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn fetch_user(&self, user_id: i64) -> Result<ChatUser, String> {
        let member = self
            .bot
            .get_chat_member(ChatId(self.home_chat), UserId(user_id as u64))
            .await
            .map_err(|e| {
                let msg = format!("Failed to get chat member {user_id}: {e}");
                warn!("{}", msg);
                msg
            })?;

        let user = &member.user;
        let display_name = match &user.last_name {
            Some(last) => format!("{} {}", user.first_name, last),
            None => user.first_name.clone(),
        };
        Ok(ChatUser {
            id: user.id.0 as i64,
            display_name,
            username: user.username.clone(),
        })
    }

    async fn send_direct_message(&self, user_id: i64, text: &str) -> Result<i64, String> {
        // Private chat ids equal user ids.
        self.send(user_id, text).await
    }

    async fn fetch_channel(&self, chat_id: i64) -> Result<ChatChannel, String> {
        let member_count = self
            .bot
            .get_chat_member_count(ChatId(chat_id))
            .await
            .map_err(|e| {
                let msg = format!("Failed to fetch chat {chat_id}: {e}");
                warn!("{}", msg);
                msg
            })?;
        Ok(ChatChannel { id: chat_id, member_count })
    }

    async fn send_to_channel(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        self.send(chat_id, text).await
    }
}
