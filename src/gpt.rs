//! GPT chat: one-shot prompts plus follow-ups when a user replies to one
//! of the bot's answers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{self, ApiError};

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Conversations kept for follow-ups; the oldest is dropped first.
const MAX_CONVERSATIONS: usize = 200;
/// User and assistant turns kept per conversation, system prompt excluded.
const MAX_TURNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// A model that continues a conversation.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError>;
}

pub struct OpenAiClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Completion for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError> {
        let request = ApiRequest { model: &self.model, messages };
        let response: ApiResponse = api::post_json(
            self.http.post(COMPLETIONS_URL).bearer_auth(&self.api_key),
            &request,
        )
        .await?;
        first_answer(response)
    }
}

fn first_answer(response: ApiResponse) -> Result<String, ApiError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(ApiError::Empty)
}

/// The bot's persona, restated at the top of every new conversation.
pub fn system_messages(now: DateTime<Utc>, tz: Tz) -> Vec<ChatMessage> {
    let date = now.with_timezone(&tz).format("%A, %B %-d, %Y at %-I:%M:%S %p %Z");
    [
        "Your name is Makaroni. You are a friendly and helpful Telegram bot in a group chat.".to_string(),
        "You respond to user queries, which could be anything.".to_string(),
        "Replies are shown as plain Telegram text. Keep them under 4000 characters, as longer messages are cut off."
            .to_string(),
        format!(
            "You have real-time access to information. For example, the current date is {date}. \
             You answer date or time questions by working from this date."
        ),
        "You speak multiple languages and can freely translate between them.".to_string(),
        "You can draw ASCII art by placing it in code blocks, since it needs a monospaced font.".to_string(),
        "You can write code and give examples in fenced code blocks.".to_string(),
    ]
    .into_iter()
    .map(|content| ChatMessage::new(Role::System, content))
    .collect()
}

/// Identifies a bot message that carries a conversation: (chat id, message id).
pub type ReplyKey = (i64, i32);

#[derive(Default)]
struct Conversations {
    by_reply: HashMap<ReplyKey, Vec<ChatMessage>>,
    order: VecDeque<ReplyKey>,
}

impl Conversations {
    fn insert(&mut self, key: ReplyKey, history: Vec<ChatMessage>) {
        if self.by_reply.insert(key, history).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > MAX_CONVERSATIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.by_reply.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &ReplyKey) {
        if self.by_reply.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

pub struct GptManager {
    client: Arc<dyn Completion>,
    tz: Tz,
    conversations: Mutex<Conversations>,
}

impl GptManager {
    pub fn new(client: Arc<dyn Completion>, tz: Tz) -> Self {
        Self {
            client,
            tz,
            conversations: Mutex::new(Conversations::default()),
        }
    }

    /// Whether a reply to this bot message continues a conversation.
    pub fn has_context(&self, key: ReplyKey) -> bool {
        self.lock().by_reply.contains_key(&key)
    }

    /// Ask `prompt`, continuing the conversation attached to `reply_to` if any.
    /// Returns the full history ending in the answer. A used conversation is
    /// forgotten; `remember` the returned history against the new answer.
    pub async fn ask(
        &self,
        reply_to: Option<ReplyKey>,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let previous = reply_to.and_then(|key| self.lock().by_reply.get(&key).cloned());
        let mut history = previous.unwrap_or_else(|| system_messages(now, self.tz));
        history.push(ChatMessage::new(Role::User, prompt));

        let answer = self.client.complete(&history).await?;
        history.push(ChatMessage::new(Role::Assistant, answer));

        if let Some(key) = reply_to {
            self.lock().remove(&key);
        }
        debug!("GPT conversation is now {} messages", history.len());
        Ok(history)
    }

    pub fn remember(&self, key: ReplyKey, mut history: Vec<ChatMessage>) {
        trim_turns(&mut history);
        self.lock().insert(key, history);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Conversations> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drop the oldest user/assistant turns past `MAX_TURNS`.
fn trim_turns(history: &mut Vec<ChatMessage>) {
    let turns = history.iter().filter(|m| m.role != Role::System).count();
    let mut excess = turns.saturating_sub(MAX_TURNS);
    history.retain(|m| {
        if excess > 0 && m.role != Role::System {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Last assistant message of a history returned by `ask`.
pub fn answer(history: &[ChatMessage]) -> &str {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}
