//! Text commands: parsing, permission checks and user-facing replies.
//!
//! Feature modules return typed results; every string a user sees is
//! written here.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{error, info, warn};

use crate::gpt::{self, ChatMessage, GptManager, ReplyKey};
use crate::messenger::Messenger;
use crate::reminders::{daily_cron, describe, format_time, next_cron_trigger, parse_trigger_time};
use crate::santa::pairing::MIN_PARTICIPANTS;
use crate::santa::{Destination, Identity, RelayTarget, SantaEngine, SantaError, StartReport};
use crate::store::Database;
use crate::w2g::{self, WatchTogether};

static COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^/(\w+)(?:@\w+)?(?:\s+(.*))?$").expect("command regex"));

/// `<time> <message>` where time may be `YYYY-MM-DD HH:MM` (contains a space).
static TIMED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(\d{4}-\d{2}-\d{2} \d{1,2}:\d{2}|\S+)\s+(.+)$").expect("reminder regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Santa(SantaCommand),
    Reminder(ReminderCommand),
    Gpt { prompt: String },
    W2g { video_url: String, room: Option<String> },
    Ping,
    Shutdown,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SantaCommand {
    Register { name: String, address: String, notes: String },
    Unregister,
    Relay { target: RelayTarget, message: String },
    Status,
    Blacklist,
    Start,
    Reset,
    Reload,
    Preview,
    Assign { giver: Identity, receiver: Identity },
}

impl SantaCommand {
    fn requires_admin(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Reset | Self::Reload | Self::Preview | Self::Assign { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderCommand {
    Create { time: String, message: String },
    Daily { time: String, message: String },
    List,
    Cancel { id: i64 },
}

/// Who sent a command, and from where.
#[derive(Debug, Clone, Copy)]
pub struct Invoker {
    pub user_id: Identity,
    pub chat_id: i64,
    pub is_private: bool,
    pub is_admin: bool,
}

const SANTA_USAGE: &str = "Usage: /ss register|unregister|receiver|santa|channel|status|blacklist";
const REGISTER_USAGE: &str = "Usage: /ss register <name> | <address> | <notes>";
const REMINDER_USAGE: &str = "Usage: /reminder create <time> <message> | daily <HH:MM> <message> | list | cancel <id>";
const GPT_USAGE: &str = "Sorry, but I was unable to parse your query.";
const W2G_USAGE: &str = "Usage: /w2g <video-link> [room-id]";

/// Telegram rejects messages over 4096 characters.
const MAX_REPLY_CHARS: usize = 4000;

/// Parse a message. `None` for anything that is not one of our commands;
/// `Some(Err(usage))` for a known command with bad arguments.
pub fn parse(text: &str) -> Option<Result<Command, String>> {
    let caps = COMMAND_RE.captures(text.trim())?;
    let name = caps.get(1)?.as_str().to_lowercase();
    let args = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

    match name.as_str() {
        "ss" => Some(parse_santa(args).map(Command::Santa)),
        "reminder" => Some(parse_reminder(args).map(Command::Reminder)),
        "gpt" => Some(if args.is_empty() {
            Err(GPT_USAGE.to_string())
        } else {
            Ok(Command::Gpt { prompt: args.to_string() })
        }),
        "w2g" => Some(parse_w2g(args)),
        "ping" => Some(Ok(Command::Ping)),
        "shutdown" => Some(Ok(Command::Shutdown)),
        "help" | "start" => Some(Ok(Command::Help)),
        _ => None,
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (s, ""),
    }
}

fn parse_santa(args: &str) -> Result<SantaCommand, String> {
    let (sub, rest) = split_word(args);
    let relay = |target| {
        if rest.is_empty() {
            Err(format!("Usage: /ss {} <message>", sub.to_lowercase()))
        } else {
            Ok(SantaCommand::Relay { target, message: rest.to_string() })
        }
    };

    match sub.to_lowercase().as_str() {
        "register" => {
            let parts: Vec<&str> = rest.splitn(3, '|').map(str::trim).collect();
            match parts.as_slice() {
                [name, address, notes] if !name.is_empty() && !address.is_empty() => {
                    Ok(SantaCommand::Register {
                        name: name.to_string(),
                        address: address.to_string(),
                        notes: notes.to_string(),
                    })
                }
                _ => Err(REGISTER_USAGE.to_string()),
            }
        }
        "unregister" => Ok(SantaCommand::Unregister),
        "receiver" => relay(RelayTarget::Receiver),
        "santa" => relay(RelayTarget::Santa),
        "channel" => relay(RelayTarget::Channel),
        "status" => Ok(SantaCommand::Status),
        "blacklist" => Ok(SantaCommand::Blacklist),
        "start" => Ok(SantaCommand::Start),
        "reset" => Ok(SantaCommand::Reset),
        "reload" => Ok(SantaCommand::Reload),
        "preview" => Ok(SantaCommand::Preview),
        "assign" => {
            let ids: Vec<Identity> = rest
                .split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect();
            match ids.as_slice() {
                [giver, receiver] if rest.split_whitespace().count() == 2 => {
                    Ok(SantaCommand::Assign { giver: *giver, receiver: *receiver })
                }
                _ => Err("Usage: /ss assign <giver_id> <receiver_id>".to_string()),
            }
        }
        _ => Err(SANTA_USAGE.to_string()),
    }
}

fn parse_reminder(args: &str) -> Result<ReminderCommand, String> {
    let (sub, rest) = split_word(args);
    let timed = || -> Option<(String, String)> {
        let caps = TIMED_RE.captures(rest)?;
        Some((caps[1].to_string(), caps[2].trim().to_string()))
    };

    match sub.to_lowercase().as_str() {
        "create" => timed()
            .map(|(time, message)| ReminderCommand::Create { time, message })
            .ok_or_else(|| "Usage: /reminder create <+30m|+2h|YYYY-MM-DD HH:MM|unix> <message>".to_string()),
        "daily" => timed()
            .map(|(time, message)| ReminderCommand::Daily { time, message })
            .ok_or_else(|| "Usage: /reminder daily <HH:MM> <message>".to_string()),
        "list" => Ok(ReminderCommand::List),
        "cancel" => rest
            .trim_start_matches('#')
            .parse()
            .map(|id| ReminderCommand::Cancel { id })
            .map_err(|_| "Usage: /reminder cancel <id>".to_string()),
        _ => Err(REMINDER_USAGE.to_string()),
    }
}

fn parse_w2g(args: &str) -> Result<Command, String> {
    let words: Vec<&str> = args.split_whitespace().collect();
    let (video_url, room) = match words.as_slice() {
        [video_url] => (*video_url, None),
        [video_url, room] => (*video_url, Some(*room)),
        _ => return Err(W2G_USAGE.to_string()),
    };
    if !w2g::is_video_url(video_url) {
        return Err(format!("[ERROR] '{video_url}' is not an http(s) link. {W2G_USAGE}"));
    }
    if room.is_some_and(|r| !w2g::is_stream_key(r)) {
        return Err(format!("[ERROR] Room IDs are letters and digits only. {W2G_USAGE}"));
    }
    Ok(Command::W2g {
        video_url: video_url.to_string(),
        room: room.map(str::to_string),
    })
}

pub fn help_text(is_admin: bool) -> String {
    let mut text = String::from(
        "🎅 Secret Santa\n\
         /ss register <name> | <address> | <notes> (private chat only)\n\
         /ss unregister\n\
         /ss receiver <message> - anonymous message to the person you shop for\n\
         /ss santa <message> - anonymous message to your Santa\n\
         /ss channel <message> - anonymous post to the Secret Santa channel\n\
         /ss status\n\
         /ss blacklist\n\n\
         ⏰ Reminders\n\
         /reminder create <+30m|+2h|+1d|+1w|YYYY-MM-DD HH:MM> <message>\n\
         /reminder daily <HH:MM> <message>\n\
         /reminder list\n\
         /reminder cancel <id>\n\n\
         🍿 Extras\n\
         /gpt <question> - reply to my answer to keep the conversation going\n\
         /w2g <video-link> [room-id] - new Watch2Gether room, or add to one\n\
         /ping",
    );
    if is_admin {
        text.push_str(
            "\n\nAdmin\n\
             /ss start | reset | reload | preview\n\
             /ss assign <giver_id> <receiver_id>\n\
             /shutdown",
        );
    }
    text
}

// ==================== SECRET SANTA ====================

/// Reply text for an engine failure.
pub fn error_reply(err: &SantaError) -> String {
    match err {
        SantaError::SessionLocked => "[ERROR] The Secret Santa session has already started.".to_string(),
        SantaError::InsufficientParticipants { count } => format!(
            "[ERROR] Not enough users registered ({count}, need at least {MIN_PARTICIPANTS})."
        ),
        SantaError::NotRegistered => "[ERROR] You are not registered.".to_string(),
        SantaError::NotStarted => "[ERROR] The Secret Santa session has not started yet.".to_string(),
        SantaError::NoValidPairing { .. } => {
            "[ERROR] No valid pairing exists with the current blacklists.".to_string()
        }
        SantaError::InvalidOverride(reason) => format!("[ERROR] Cannot change the pairing: {reason}."),
        SantaError::SearchAborted(e) => {
            error!("Pairing search failed: {e}");
            "[ERROR] The pairing search failed. Please try again.".to_string()
        }
        SantaError::Store(e) => {
            error!("Secret Santa store failure: {e}");
            "[ERROR] Could not save the Secret Santa session. Please tell an admin.".to_string()
        }
    }
}

pub async fn handle_santa(
    engine: &SantaEngine,
    messenger: &dyn Messenger,
    invoker: &Invoker,
    cmd: SantaCommand,
) -> String {
    if cmd.requires_admin() && !invoker.is_admin {
        info!("Rejected admin command {:?} from {}", cmd, invoker.user_id);
        return "You do not have permission to run this command.".to_string();
    }

    match cmd {
        SantaCommand::Register { name, address, notes } => {
            if !invoker.is_private {
                return "[ERROR] Register in a private chat with me so your address stays private.".to_string();
            }
            match engine.register(invoker.user_id, &name, &address, &notes).await {
                Ok(true) => "Successfully registered.".to_string(),
                Ok(false) => "Successfully updated registration.".to_string(),
                Err(SantaError::SessionLocked) => {
                    "[ERROR] The Secret Santa session has already started. Failed to register.".to_string()
                }
                Err(e) => error_reply(&e),
            }
        }
        SantaCommand::Unregister => match engine.unregister(invoker.user_id).await {
            Ok(true) => "Successfully unregistered.".to_string(),
            Ok(false) => "[ERROR] You are not registered.".to_string(),
            Err(SantaError::SessionLocked) => {
                "[ERROR] The Secret Santa session has already started. Failed to unregister.".to_string()
            }
            Err(e) => error_reply(&e),
        },
        SantaCommand::Relay { target, message } => relay(engine, messenger, invoker, target, &message).await,
        SantaCommand::Status => status(engine, messenger, invoker).await,
        SantaCommand::Blacklist => blacklist(engine, messenger, invoker).await,
        SantaCommand::Start => match engine.start(messenger).await {
            Ok(report) => start_reply(messenger, &report).await,
            Err(e) => error_reply(&e),
        },
        SantaCommand::Reset => match engine.reset().await {
            Ok(()) => "Secret Santa session reset.".to_string(),
            Err(e) => error_reply(&e),
        },
        SantaCommand::Reload => match engine.reload().await {
            Ok(status) => format!(
                "Reloaded santas. {} registered, {}.",
                status.participants,
                if status.started { "started" } else { "not started" }
            ),
            Err(e) => error_reply(&e),
        },
        SantaCommand::Preview => match engine.preview().await {
            Ok(ring) => {
                let mut names: Vec<&str> = ring.iter().map(|p| p.display_name.as_str()).collect();
                if let Some(first) = names.first().copied() {
                    names.push(first);
                }
                format!("Candidate pairing (not saved):\n{}", names.join(" → "))
            }
            Err(e) => error_reply(&e),
        },
        SantaCommand::Assign { giver, receiver } => match engine.set_receiver(giver, receiver).await {
            Ok(()) => {
                let name = |id| engine.participant(id).map(|p| p.display_name).unwrap_or_else(|| id.to_string());
                format!("Pairing updated: {} now gives to {}.", name(giver), name(receiver))
            }
            Err(e) => error_reply(&e),
        },
    }
}

async fn relay(
    engine: &SantaEngine,
    messenger: &dyn Messenger,
    invoker: &Invoker,
    target: RelayTarget,
    message: &str,
) -> String {
    let destination = match engine.relay_destination(invoker.user_id, target) {
        Ok(d) => d,
        Err(SantaError::NotStarted) => {
            return "[ERROR] The Secret Santa session has not started yet. Unable to send message.".to_string();
        }
        Err(e) => return error_reply(&e),
    };

    let result = match destination {
        Destination::User(id) => messenger.send_direct_message(id, &relay_text(target, message)).await,
        Destination::Channel(id) => messenger.send_to_channel(id, message).await,
    };
    match result {
        Ok(_) => {
            info!("Relayed {:?} message from {}", target, invoker.user_id);
            "Message sent.".to_string()
        }
        Err(e) => {
            warn!("Relay {:?} from {} failed: {}", target, invoker.user_id, e);
            "[ERROR] Could not deliver your message. They may need to start a chat with me first.".to_string()
        }
    }
}

fn relay_text(target: RelayTarget, message: &str) -> String {
    match target {
        RelayTarget::Receiver => format!("🎅 Message from your Secret Santa:\n\n{message}"),
        RelayTarget::Santa => format!("🎁 Message from the person you are shopping for:\n\n{message}"),
        RelayTarget::Channel => message.to_string(),
    }
}

async fn status(engine: &SantaEngine, messenger: &dyn Messenger, invoker: &Invoker) -> String {
    let mut lines = vec![
        format!(
            "Secret Santa: {}",
            if engine.started() { "started" } else { "open for registration" }
        ),
        format!("Registered: {}", engine.count()),
    ];
    if let Ok(channel) = messenger.fetch_channel(engine.get_channel_id()).await {
        lines.push(format!("Channel members: {}", channel.member_count));
    }
    if !engine.is_registered(invoker.user_id) {
        lines.push("You are not registered.".to_string());
    } else if let Some(receiver) = engine.get_receiver(invoker.user_id) {
        // Only ever shown to the giver; keep it out of group chats.
        if invoker.is_private {
            let name = engine.participant(receiver).map(|p| p.display_name).unwrap_or_default();
            lines.push(format!("You are the Secret Santa for: {name}"));
            if engine.get_santa(invoker.user_id).is_some() {
                lines.push("Your own Santa is assigned. Write to them with /ss santa <message>.".to_string());
            }
        } else {
            lines.push("You are registered. Ask me in private to see who you shop for.".to_string());
        }
    } else {
        lines.push("You are registered.".to_string());
    }
    lines.join("\n")
}

/// Admins see every entry; everyone else only their own.
async fn blacklist(engine: &SantaEngine, messenger: &dyn Messenger, invoker: &Invoker) -> String {
    let exclusions = engine.get_blacklists();
    let entries: Vec<(&Identity, &Vec<Identity>)> = exclusions
        .iter()
        .filter(|(giver, blocked)| !blocked.is_empty() && (invoker.is_admin || **giver == invoker.user_id))
        .collect();
    if entries.is_empty() {
        return "No blacklist entries.".to_string();
    }

    let mut lines = vec!["Blacklist (santa → cannot draw):".to_string()];
    for (giver, blocked) in entries {
        let mut names = Vec::with_capacity(blocked.len());
        for id in blocked {
            names.push(display(messenger, *id).await);
        }
        lines.push(format!("{} → {}", display(messenger, *giver).await, names.join(", ")));
    }
    lines.join("\n")
}

async fn display(messenger: &dyn Messenger, id: Identity) -> String {
    messenger
        .fetch_user(id)
        .await
        .map(|u| u.mention())
        .unwrap_or_else(|_| id.to_string())
}

async fn start_reply(messenger: &dyn Messenger, report: &StartReport) -> String {
    let mut reply = format!(
        "🎄 Secret Santa started! Notified {}/{} santas.",
        report.delivered(),
        report.deliveries.len()
    );
    let failures = report.failures();
    if !failures.is_empty() {
        reply.push_str("\nCould not reach (they must start a chat with me, then an admin can resend):");
        for (id, reason) in failures {
            reply.push_str(&format!("\n- {} ({})", display(messenger, id).await, reason));
        }
    }
    reply
}

// ==================== GPT AND WATCH2GETHER ====================

/// What to send back for a GPT prompt. `history` is set on success and
/// should be remembered against the sent message so replies continue it.
#[derive(Debug)]
pub struct GptReply {
    pub text: String,
    pub history: Option<Vec<ChatMessage>>,
}

pub async fn handle_gpt(
    manager: Option<&GptManager>,
    reply_to: Option<ReplyKey>,
    prompt: &str,
    now: DateTime<Utc>,
) -> GptReply {
    let Some(manager) = manager else {
        return GptReply { text: "GPT is not configured on this bot.".to_string(), history: None };
    };
    match manager.ask(reply_to, prompt, now).await {
        Ok(history) => {
            let text = clip(gpt::answer(&history));
            info!("GPT answered a {}-message conversation ({} chars)", history.len(), text.chars().count());
            GptReply { text, history: Some(history) }
        }
        Err(e) => {
            warn!("GPT request failed: {e}");
            GptReply { text: "Sorry, I could not get an answer right now.".to_string(), history: None }
        }
    }
}

pub async fn handle_w2g(
    client: Option<&dyn WatchTogether>,
    who: &str,
    video_url: &str,
    room: Option<&str>,
) -> String {
    let Some(client) = client else {
        return "Watch2Gether is not configured on this bot.".to_string();
    };
    match room {
        None => match client.create_room(video_url).await {
            Ok(key) => {
                info!("{} created W2G room {}", who, key);
                format!(
                    "{who} has created a W2G Room!\nRoom: {}\nVideo: {video_url}\nRoom ID: {key}",
                    w2g::room_url(&key)
                )
            }
            Err(e) => {
                warn!("W2G room creation failed: {e}");
                "Network error or invalid video url provided.".to_string()
            }
        },
        Some(key) => match client.add_video(key, video_url).await {
            Ok(()) => {
                info!("{} added a video to W2G room {}", who, key);
                format!(
                    "{who} has added a video!\nRoom: {}\nVideo: {video_url}\nRoom ID: {key}",
                    w2g::room_url(key)
                )
            }
            Err(e) => {
                warn!("W2G add to room {} failed: {e}", key);
                "Unable to add video. This could be due to a bad room ID or invalid video link.".to_string()
            }
        },
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_REPLY_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(MAX_REPLY_CHARS - 3).collect();
    format!("{clipped}...")
}

// ==================== REMINDERS ====================

pub fn handle_reminder(
    database: &Database,
    tz: Tz,
    invoker: &Invoker,
    cmd: ReminderCommand,
    now: DateTime<Utc>,
) -> String {
    match cmd {
        ReminderCommand::Create { time, message } => {
            let trigger_at = match parse_trigger_time(&time, tz, now) {
                Ok(t) => t,
                Err(e) => return format!("[ERROR] {e}"),
            };
            match database.create_reminder(invoker.chat_id, invoker.user_id, &message, trigger_at, None) {
                Ok(id) => {
                    info!("Created reminder #{} for {} at {}", id, invoker.user_id, trigger_at);
                    format!("✅ Reminder #{id} set for {}.", format_time(trigger_at, tz))
                }
                Err(e) => format!("[ERROR] {e}"),
            }
        }
        ReminderCommand::Daily { time, message } => {
            let scheduled = daily_cron(&time)
                .and_then(|cron| next_cron_trigger(&cron, now, tz).map(|next| (cron, next)));
            let (cron, first) = match scheduled {
                Ok(s) => s,
                Err(e) => return format!("[ERROR] {e}"),
            };
            match database.create_reminder(invoker.chat_id, invoker.user_id, &message, first, Some(&cron)) {
                Ok(id) => {
                    info!("Created daily reminder #{} for {} ({})", id, invoker.user_id, cron);
                    format!("✅ Daily reminder #{id} set. First one at {}.", format_time(first, tz))
                }
                Err(e) => format!("[ERROR] {e}"),
            }
        }
        ReminderCommand::List => {
            let reminders = database.list_reminders(Some(invoker.user_id));
            if reminders.is_empty() {
                return "You have no active reminders.".to_string();
            }
            let lines: Vec<String> = reminders.iter().map(|r| describe(r, tz)).collect();
            format!("Your reminders:\n{}", lines.join("\n"))
        }
        ReminderCommand::Cancel { id } => match database.cancel_reminder(id, invoker.user_id) {
            Ok(true) => format!("Cancelled reminder #{id}."),
            Ok(false) => format!("[ERROR] You have no active reminder #{id}."),
            Err(e) => format!("[ERROR] {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::Role;
    use crate::gpt::fake::ScriptedCompletion;
    use crate::messenger::fake::RecordingMessenger;
    use crate::santa::{ExclusionSet, PairingLimits, SessionTemplate};
    use crate::store::MemoryStore;
    use crate::w2g::fake::FakeRooms;
    use chrono::TimeZone;
    use std::sync::Arc;

    const CHANNEL: i64 = -500;
    const ADMIN: i64 = 1000;

    fn user(user_id: i64) -> Invoker {
        Invoker { user_id, chat_id: user_id, is_private: true, is_admin: user_id == ADMIN }
    }

    fn santa(text: &str) -> SantaCommand {
        match parse(text) {
            Some(Ok(Command::Santa(cmd))) => cmd,
            other => panic!("expected santa command for {text:?}, got {other:?}"),
        }
    }

    fn reminder(text: &str) -> ReminderCommand {
        match parse(text) {
            Some(Ok(Command::Reminder(cmd))) => cmd,
            other => panic!("expected reminder command for {text:?}, got {other:?}"),
        }
    }

    async fn engine(exclusions: ExclusionSet) -> SantaEngine {
        let template = SessionTemplate { primary_channel: CHANNEL, exclusions };
        let engine = SantaEngine::new(Arc::new(MemoryStore::new()), template, PairingLimits::default()).with_seed(11);
        engine.init_session().await.unwrap();
        engine
    }

    async fn register_all(engine: &SantaEngine, messenger: &RecordingMessenger, ids: &[i64]) {
        for id in ids {
            let cmd = santa(&format!("/ss register P{id} | {id} Main St | socks"));
            assert_eq!(handle_santa(engine, messenger, &user(*id), cmd).await, "Successfully registered.");
        }
    }

    // ==================== PARSING ====================

    #[test]
    fn test_parse_register() {
        assert_eq!(
            santa("/ss register Ann Lee | 1 Main St, Springfield | no candles | really"),
            SantaCommand::Register {
                name: "Ann Lee".into(),
                address: "1 Main St, Springfield".into(),
                notes: "no candles | really".into(),
            }
        );
        // Notes may be blank, name and address may not.
        assert!(matches!(santa("/ss register Ann | Street |"), SantaCommand::Register { notes, .. } if notes.is_empty()));
        assert_eq!(parse("/ss register Ann | | x"), Some(Err(REGISTER_USAGE.to_string())));
        assert_eq!(parse("/ss register Ann"), Some(Err(REGISTER_USAGE.to_string())));
    }

    #[test]
    fn test_parse_bot_suffix_and_case() {
        assert_eq!(santa("/ss@santa_bot STATUS"), SantaCommand::Status);
        assert_eq!(parse("/ping@santa_bot"), Some(Ok(Command::Ping)));
        assert_eq!(parse("/help"), Some(Ok(Command::Help)));
    }

    #[test]
    fn test_parse_relays() {
        assert_eq!(
            santa("/ss receiver hello\nthere"),
            SantaCommand::Relay { target: RelayTarget::Receiver, message: "hello\nthere".into() }
        );
        assert_eq!(
            santa("/ss santa thanks!"),
            SantaCommand::Relay { target: RelayTarget::Santa, message: "thanks!".into() }
        );
        assert_eq!(
            santa("/ss channel hi all"),
            SantaCommand::Relay { target: RelayTarget::Channel, message: "hi all".into() }
        );
        assert_eq!(parse("/ss santa"), Some(Err("Usage: /ss santa <message>".to_string())));
    }

    #[test]
    fn test_parse_admin_commands() {
        assert_eq!(santa("/ss start"), SantaCommand::Start);
        assert_eq!(santa("/ss reset"), SantaCommand::Reset);
        assert_eq!(santa("/ss reload"), SantaCommand::Reload);
        assert_eq!(santa("/ss preview"), SantaCommand::Preview);
        assert_eq!(santa("/ss assign 12 -34"), SantaCommand::Assign { giver: 12, receiver: -34 });
        assert!(matches!(parse("/ss assign 12"), Some(Err(_))));
        assert!(matches!(parse("/ss assign 12 x"), Some(Err(_))));
        assert!(matches!(parse("/ss assign 1 2 3"), Some(Err(_))));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("/weather"), None);
        assert_eq!(parse("/ss"), Some(Err(SANTA_USAGE.to_string())));
        assert_eq!(parse("/ss dance"), Some(Err(SANTA_USAGE.to_string())));
    }

    #[test]
    fn test_parse_reminders() {
        assert_eq!(
            reminder("/reminder create +30m take out the trash"),
            ReminderCommand::Create { time: "+30m".into(), message: "take out the trash".into() }
        );
        assert_eq!(
            reminder("/reminder create 2026-12-24 18:00 wrap gifts"),
            ReminderCommand::Create { time: "2026-12-24 18:00".into(), message: "wrap gifts".into() }
        );
        assert_eq!(
            reminder("/reminder daily 09:30 standup"),
            ReminderCommand::Daily { time: "09:30".into(), message: "standup".into() }
        );
        assert_eq!(reminder("/reminder list"), ReminderCommand::List);
        assert_eq!(reminder("/reminder cancel #4"), ReminderCommand::Cancel { id: 4 });
        assert!(matches!(parse("/reminder create +30m"), Some(Err(_))));
        assert!(matches!(parse("/reminder cancel abc"), Some(Err(_))));
        assert_eq!(parse("/reminder"), Some(Err(REMINDER_USAGE.to_string())));
    }

    #[test]
    fn test_parse_gpt() {
        assert_eq!(
            parse("/gpt@santa_bot what is\na haiku?"),
            Some(Ok(Command::Gpt { prompt: "what is\na haiku?".into() }))
        );
        assert_eq!(parse("/gpt"), Some(Err(GPT_USAGE.to_string())));
        assert_eq!(parse("/gpt   "), Some(Err(GPT_USAGE.to_string())));
    }

    #[test]
    fn test_parse_w2g() {
        assert_eq!(
            parse("/w2g https://youtu.be/abc"),
            Some(Ok(Command::W2g { video_url: "https://youtu.be/abc".into(), room: None }))
        );
        assert_eq!(
            parse("/w2g https://youtu.be/abc mkl8zq"),
            Some(Ok(Command::W2g { video_url: "https://youtu.be/abc".into(), room: Some("mkl8zq".into()) }))
        );
        assert_eq!(parse("/w2g"), Some(Err(W2G_USAGE.to_string())));
        assert_eq!(parse("/w2g a b c"), Some(Err(W2G_USAGE.to_string())));
        assert!(matches!(parse("/w2g youtu.be/abc"), Some(Err(e)) if e.contains("not an http(s) link")));
        assert!(matches!(parse("/w2g https://youtu.be/abc ../x"), Some(Err(e)) if e.contains("Room IDs")));
    }

    #[test]
    fn test_help_lists_admin_commands_only_for_admins() {
        assert!(!help_text(false).contains("/shutdown"));
        assert!(help_text(true).contains("/shutdown"));
        assert!(help_text(false).contains("/ss register"));
        assert!(help_text(false).contains("/gpt") && help_text(false).contains("/w2g"));
    }

    // ==================== SECRET SANTA REPLIES ====================

    #[tokio::test]
    async fn test_registration_replies() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();
        let cmd = santa("/ss register Ann | 1 Main St | none");

        let reply = handle_santa(&engine, &messenger, &user(1), cmd.clone()).await;
        assert_eq!(reply, "Successfully registered.");
        let reply = handle_santa(&engine, &messenger, &user(1), cmd).await;
        assert_eq!(reply, "Successfully updated registration.");

        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Unregister).await;
        assert_eq!(reply, "Successfully unregistered.");
        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Unregister).await;
        assert_eq!(reply, "[ERROR] You are not registered.");
    }

    #[tokio::test]
    async fn test_register_in_group_rejected() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();
        let group = Invoker { chat_id: -42, is_private: false, ..user(1) };

        let reply = handle_santa(&engine, &messenger, &group, santa("/ss register Ann | Street | x")).await;
        assert!(reply.contains("private chat"));
        assert!(!engine.is_registered(1));
    }

    #[tokio::test]
    async fn test_admin_commands_need_admin() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();
        for cmd in [SantaCommand::Start, SantaCommand::Reset, SantaCommand::Reload, SantaCommand::Preview] {
            let reply = handle_santa(&engine, &messenger, &user(1), cmd).await;
            assert_eq!(reply, "You do not have permission to run this command.");
        }
    }

    #[tokio::test]
    async fn test_start_and_locked_registration() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();

        let reply = handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Start).await;
        assert_eq!(reply, "[ERROR] Not enough users registered (0, need at least 3).");

        register_all(&engine, &messenger, &[1, 2, 3]).await;
        let reply = handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Start).await;
        assert_eq!(reply, "🎄 Secret Santa started! Notified 3/3 santas.");

        let reply = handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Start).await;
        assert_eq!(reply, "[ERROR] The Secret Santa session has already started.");

        let reply = handle_santa(&engine, &messenger, &user(4), santa("/ss register D | Street | x")).await;
        assert_eq!(reply, "[ERROR] The Secret Santa session has already started. Failed to register.");
        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Unregister).await;
        assert_eq!(reply, "[ERROR] The Secret Santa session has already started. Failed to unregister.");
    }

    #[tokio::test]
    async fn test_start_reports_unreachable_santas() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::failing_for(&[2]);
        register_all(&engine, &RecordingMessenger::new(), &[1, 2, 3]).await;

        let reply = handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Start).await;
        assert!(reply.starts_with("🎄 Secret Santa started! Notified 2/3 santas."));
        assert!(reply.contains("- User 2 (Forbidden"));
        assert!(engine.started());
    }

    #[tokio::test]
    async fn test_relays() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();
        register_all(&engine, &messenger, &[1, 2, 3]).await;

        let reply = handle_santa(&engine, &messenger, &user(1), santa("/ss receiver hi")).await;
        assert_eq!(reply, "[ERROR] The Secret Santa session has not started yet. Unable to send message.");
        let reply = handle_santa(&engine, &messenger, &user(9), santa("/ss channel hi")).await;
        assert_eq!(reply, "[ERROR] You are not registered.");

        handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Start).await;
        let receiver = engine.get_receiver(1).unwrap();
        let santa_of_1 = engine.get_santa(1).unwrap();

        let reply = handle_santa(&engine, &messenger, &user(1), santa("/ss receiver what size?")).await;
        assert_eq!(reply, "Message sent.");
        assert!(messenger.sent_to(receiver).iter().any(|m| m.ends_with("what size?") && m.contains("Secret Santa")));

        handle_santa(&engine, &messenger, &user(1), santa("/ss santa thank you")).await;
        assert!(messenger.sent_to(santa_of_1).iter().any(|m| m.ends_with("thank you")));

        handle_santa(&engine, &messenger, &user(1), santa("/ss channel merry xmas")).await;
        assert_eq!(messenger.sent_to(CHANNEL), vec!["merry xmas".to_string()]);

        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Status).await;
        assert!(reply.starts_with("Secret Santa: started\nRegistered: 3\n"));
        assert!(reply.contains(&format!("You are the Secret Santa for: P{receiver}")));
        assert!(reply.contains("Your own Santa is assigned."));
        assert!(!reply.contains(&format!("P{santa_of_1}")));
        let in_group = Invoker { is_private: false, chat_id: -42, ..user(1) };
        let reply = handle_santa(&engine, &messenger, &in_group, SantaCommand::Status).await;
        assert!(!reply.contains(&format!("P{receiver}")));
    }

    #[tokio::test]
    async fn test_relay_delivery_failure() {
        let engine = engine(ExclusionSet::new()).await;
        register_all(&engine, &RecordingMessenger::new(), &[1, 2, 3]).await;
        engine.start(&RecordingMessenger::new()).await.unwrap();

        let messenger = RecordingMessenger::failing_for(&[CHANNEL]);
        let reply = handle_santa(&engine, &messenger, &user(1), santa("/ss channel hi")).await;
        assert!(reply.starts_with("[ERROR] Could not deliver"));
    }

    #[tokio::test]
    async fn test_status_and_blacklist() {
        let exclusions = ExclusionSet::from([(1, vec![2]), (3, vec![1])]);
        let engine = engine(exclusions).await;
        let messenger = RecordingMessenger::new();
        register_all(&engine, &messenger, &[1, 2]).await;

        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Status).await;
        assert!(reply.contains("open for registration"));
        assert!(reply.contains("Registered: 2"));
        assert!(reply.contains("You are registered."));
        assert!(!reply.contains("Your own Santa"));

        let reply = handle_santa(&engine, &messenger, &user(1), SantaCommand::Blacklist).await;
        assert_eq!(reply, "Blacklist (santa → cannot draw):\nUser 1 → User 2");
        let reply = handle_santa(&engine, &messenger, &user(2), SantaCommand::Blacklist).await;
        assert_eq!(reply, "No blacklist entries.");
        let reply = handle_santa(&engine, &messenger, &user(ADMIN), SantaCommand::Blacklist).await;
        assert!(reply.contains("User 1 → User 2") && reply.contains("User 3 → User 1"));
    }

    #[tokio::test]
    async fn test_preview_reset_reload_assign() {
        let engine = engine(ExclusionSet::new()).await;
        let messenger = RecordingMessenger::new();
        let admin = user(ADMIN);
        register_all(&engine, &messenger, &[1, 2, 3, 4]).await;

        let reply = handle_santa(&engine, &messenger, &admin, SantaCommand::Preview).await;
        assert!(reply.starts_with("Candidate pairing (not saved):\n"));
        assert_eq!(reply.matches(" → ").count(), 4);
        assert!(!engine.started());

        let reply = handle_santa(&engine, &messenger, &admin, santa("/ss assign 1 2")).await;
        assert_eq!(reply, "[ERROR] The Secret Santa session has not started yet.");

        handle_santa(&engine, &messenger, &admin, SantaCommand::Start).await;
        // Single 4-ring 1→a→b→t→1: giving 1 the receiver t swaps cleanly.
        let target = [1, 2, 3]
            .iter()
            .try_fold(1, |id, _| engine.get_receiver(id))
            .unwrap();
        let reply = handle_santa(&engine, &messenger, &admin, santa(&format!("/ss assign 1 {target}"))).await;
        assert_eq!(reply, format!("Pairing updated: P1 now gives to P{target}."));
        assert_eq!(engine.get_receiver(1), Some(target));
        assert_eq!(engine.get_santa(target), Some(1));

        let reply = handle_santa(&engine, &messenger, &admin, santa("/ss assign 1 1")).await;
        assert!(reply.starts_with("[ERROR] Cannot change the pairing"));

        let reply = handle_santa(&engine, &messenger, &admin, SantaCommand::Reload).await;
        assert_eq!(reply, "Reloaded santas. 4 registered, started.");

        let reply = handle_santa(&engine, &messenger, &admin, SantaCommand::Reset).await;
        assert_eq!(reply, "Secret Santa session reset.");
        assert_eq!(engine.count(), 0);
        assert!(!engine.started());
    }

    // ==================== GPT AND WATCH2GETHER REPLIES ====================

    #[tokio::test]
    async fn test_gpt_not_configured() {
        let reply = handle_gpt(None, None, "hello", now()).await;
        assert_eq!(reply.text, "GPT is not configured on this bot.");
        assert!(reply.history.is_none());
    }

    #[tokio::test]
    async fn test_gpt_follow_up_carries_context() {
        let client = Arc::new(ScriptedCompletion::default());
        let gpt = GptManager::new(client.clone(), Tz::UTC);

        let first = handle_gpt(Some(&gpt), None, "pick a number", now()).await;
        assert_eq!(first.text, "answer 1");
        // The bot's answer went out as message 77 in chat -5.
        gpt.remember((-5, 77), first.history.unwrap());

        let second = handle_gpt(Some(&gpt), Some((-5, 77)), "double it", now()).await;
        assert_eq!(second.text, "answer 2");
        let sent = &client.requests()[1];
        let turns: Vec<(Role, &str)> = sent
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            turns,
            vec![(Role::User, "pick a number"), (Role::Assistant, "answer 1"), (Role::User, "double it")]
        );
    }

    #[tokio::test]
    async fn test_gpt_failure_reply() {
        let gpt = GptManager::new(Arc::new(ScriptedCompletion::failing()), Tz::UTC);
        let reply = handle_gpt(Some(&gpt), None, "hello", now()).await;
        assert_eq!(reply.text, "Sorry, I could not get an answer right now.");
        assert!(reply.history.is_none());
    }

    #[test]
    fn test_clip_long_answers() {
        assert_eq!(clip("short"), "short");
        let clipped = clip(&"ж".repeat(MAX_REPLY_CHARS * 2));
        assert_eq!(clipped.chars().count(), MAX_REPLY_CHARS);
        assert!(clipped.ends_with("..."));
    }

    #[tokio::test]
    async fn test_w2g_create_then_add() {
        let fake = FakeRooms::default();
        let rooms: &dyn WatchTogether = &fake;

        let reply = handle_w2g(Some(rooms), "@ann", "https://youtu.be/a", None).await;
        assert_eq!(
            reply,
            "@ann has created a W2G Room!\nRoom: https://w2g.tv/rooms/room1\nVideo: https://youtu.be/a\nRoom ID: room1"
        );

        let reply = handle_w2g(Some(rooms), "@bob", "https://youtu.be/b", Some("room1")).await;
        assert!(reply.starts_with("@bob has added a video!\nRoom: https://w2g.tv/rooms/room1"));
        assert_eq!(
            fake.rooms.lock().unwrap()[0].1,
            vec!["https://youtu.be/a".to_string(), "https://youtu.be/b".to_string()]
        );

        let reply = handle_w2g(Some(rooms), "@bob", "https://youtu.be/c", Some("nosuchroom")).await;
        assert_eq!(reply, "Unable to add video. This could be due to a bad room ID or invalid video link.");
    }

    #[tokio::test]
    async fn test_w2g_not_configured() {
        let reply = handle_w2g(None, "@ann", "https://youtu.be/a", None).await;
        assert_eq!(reply, "Watch2Gether is not configured on this bot.");
    }

    // ==================== REMINDER REPLIES ====================

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 12, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_reminder_create_list_cancel() {
        let db = Database::new().unwrap();
        let me = Invoker { chat_id: -77, ..user(5) };

        let reply = handle_reminder(&db, Tz::UTC, &me, reminder("/reminder create +2h wrap gifts"), now());
        assert_eq!(reply, "✅ Reminder #1 set for 2026-12-01 14:00 UTC.");
        let reply = handle_reminder(&db, Tz::UTC, &me, reminder("/reminder daily 09:00 standup"), now());
        assert_eq!(reply, "✅ Daily reminder #2 set. First one at 2026-12-02 09:00 UTC.");

        let reply = handle_reminder(&db, Tz::UTC, &me, ReminderCommand::List, now());
        assert!(reply.starts_with("Your reminders:\n#1 at 2026-12-01 14:00 UTC: wrap gifts"));
        assert!(reply.contains("#2 at 2026-12-02 09:00 UTC (repeats: "));
        assert_eq!(db.list_reminders(None)[0].chat_id, -77);

        let other = user(6);
        let reply = handle_reminder(&db, Tz::UTC, &other, ReminderCommand::List, now());
        assert_eq!(reply, "You have no active reminders.");
        let reply = handle_reminder(&db, Tz::UTC, &other, ReminderCommand::Cancel { id: 1 }, now());
        assert_eq!(reply, "[ERROR] You have no active reminder #1.");

        let reply = handle_reminder(&db, Tz::UTC, &me, ReminderCommand::Cancel { id: 1 }, now());
        assert_eq!(reply, "Cancelled reminder #1.");
        assert_eq!(db.list_reminders(Some(5)).len(), 1);
    }

    #[test]
    fn test_reminder_bad_times() {
        let db = Database::new().unwrap();
        let me = user(5);

        let reply = handle_reminder(&db, Tz::UTC, &me, reminder("/reminder create 2020-01-01 10:00 late"), now());
        assert!(reply.starts_with("[ERROR]"));
        let reply = handle_reminder(&db, Tz::UTC, &me, reminder("/reminder daily 25:00 nope"), now());
        assert!(reply.starts_with("[ERROR]"));
        assert!(db.list_reminders(None).is_empty());
    }
}
