//! Mirror log events into a Telegram chat.
//!
//! WARN and ERROR go out immediately. INFO lines are batched and flushed on
//! a timer or when the batch fills up.

use std::time::Duration;

use teloxide::prelude::*;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Telegram rejects messages over 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const FLUSH_AT_LINES: usize = 50;

/// Targets whose events are never forwarded: our own sends and the HTTP
/// stack underneath them would feed back into the chat.
const MUTED_TARGETS: &[&str] = &["santabot::chat_log", "teloxide", "reqwest", "hyper", "h2", "rustls"];

enum Entry {
    Urgent(String),
    Batched(String),
}

pub struct ChatLogLayer {
    tx: mpsc::UnboundedSender<Entry>,
}

impl ChatLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: i64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Entry>();
        let chat_id = ChatId(chat_id);

        tokio::spawn(async move {
            let mut batch = Batch::default();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    entry = rx.recv() => match entry {
                        Some(Entry::Urgent(line)) => {
                            // Keep ordering: anything batched before this goes first.
                            for chunk in batch.take_chunks() {
                                post(&bot, chat_id, &chunk).await;
                            }
                            post(&bot, chat_id, &truncate(&line)).await;
                        }
                        Some(Entry::Batched(line)) => {
                            if batch.push(line) {
                                for chunk in batch.take_chunks() {
                                    post(&bot, chat_id, &chunk).await;
                                }
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => {
                        for chunk in batch.take_chunks() {
                            post(&bot, chat_id, &chunk).await;
                        }
                    }
                }
            }
        });

        Self { tx }
    }
}

async fn post(bot: &Bot, chat_id: ChatId, text: &str) {
    // eprintln, not tracing: a failed send must not produce another event.
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("Failed to send log to chat {}: {e}", chat_id.0);
    }
}

/// Pending INFO lines.
#[derive(Default)]
struct Batch {
    lines: Vec<String>,
}

impl Batch {
    /// Returns true once the batch should be flushed.
    fn push(&mut self, line: String) -> bool {
        self.lines.push(truncate(&line));
        self.lines.len() >= FLUSH_AT_LINES
    }

    /// Drain into as few messages as fit under the size limit.
    fn take_chunks(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        for line in self.lines.drain(..) {
            let needed = line.chars().count() + usize::from(!current.is_empty());
            if !current.is_empty() && current.chars().count() + needed > MAX_MESSAGE_CHARS {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&line);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_MESSAGE_CHARS - 3).collect();
    format!("{truncated}...")
}

fn should_forward(level: Level, target: &str) -> bool {
    level <= Level::INFO && !MUTED_TARGETS.iter().any(|muted| target.starts_with(muted))
}

fn format_line(level: Level, target: &str, message: &str) -> String {
    let module = target.rsplit("::").next().unwrap_or(target);
    match level {
        Level::ERROR => format!("❌ [{module}] {message}"),
        Level::WARN => format!("⚠️ [{module}] {message}"),
        _ => format!("[{module}] {message}"),
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(", ")
        } else {
            format!("{} ({})", self.message, self.fields.join(", "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{} = {}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for ChatLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if !should_forward(level, metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format_line(level, metadata.target(), &visitor.finish());

        let entry = if level <= Level::WARN { Entry::Urgent(line) } else { Entry::Batched(line) };
        if self.tx.send(entry).is_err() {
            eprintln!("Log chat channel closed, message dropped");
        }
    }
}
