mod api;
mod chat_log;
mod commands;
mod config;
mod gpt;
mod messenger;
mod reminders;
mod santa;
mod store;
mod w2g;

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::Utc;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use commands::{Command, Invoker};
use config::Config;
use gpt::{GptManager, OpenAiClient};
use messenger::{Messenger, TelegramClient};
use santa::SantaEngine;
use store::{Database, KeyValueStore};
use w2g::{W2gClient, WatchTogether};

struct BotState {
    config: Config,
    engine: SantaEngine,
    database: Arc<Database>,
    messenger: Arc<dyn Messenger>,
    gpt: Option<GptManager>,
    w2g: Option<Box<dyn WatchTogether>>,
    /// Set once the dispatcher is built; `/shutdown` uses it.
    shutdown: OnceLock<ShutdownToken>,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "santabot.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("santabot.log"))
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        registry.with(chat_log::ChatLogLayer::new(bot.clone(), log_chat_id)).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting santabot...");
    info!("Loaded config from {config_path}");
    info!("Admin IDs: {:?}", config.admin_ids);
    if config.dry_run {
        info!("DRY RUN mode enabled");
    }

    let database = match Database::load_or_new(&config.data_dir.join("santabot.db")) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to open database: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn KeyValueStore> = database.clone();
    let engine = SantaEngine::new(store, config.session_template(), config.pairing_limits);
    match engine.init_session().await {
        Ok(status) => info!(
            "🎅 Secret Santa session: {} participants, started: {}, channel {}",
            status.participants, status.started, status.channel
        ),
        Err(e) => {
            error!("Failed to load Secret Santa session: {e}");
            std::process::exit(1);
        }
    }

    let messenger: Arc<dyn Messenger> =
        Arc::new(TelegramClient::new(bot.clone(), config.santa_channel_id, config.dry_run));
    let checker = reminders::spawn_checker(
        database.clone(),
        messenger.clone(),
        config.timezone,
        config.reminder_check_interval,
    );

    let gpt = config.openai_api_key.clone().map(|key| {
        info!("GPT enabled ({})", config.openai_model);
        GptManager::new(Arc::new(OpenAiClient::new(key, config.openai_model.clone())), config.timezone)
    });
    let w2g = config.w2g_api_key.clone().map(|key| {
        info!("Watch2Gether enabled");
        Box::new(W2gClient::new(key)) as Box<dyn WatchTogether>
    });

    let state = Arc::new(BotState {
        config,
        engine,
        database,
        messenger,
        gpt,
        w2g,
        shutdown: OnceLock::new(),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .enable_ctrlc_handler()
        .build();
    state.shutdown.set(dispatcher.shutdown_token()).ok();

    dispatcher.dispatch().await;

    checker.abort();
    info!("👋 santabot stopped");
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let reply_to = msg.reply_to_message().map(|m| (msg.chat.id.0, m.id.0));

    let Some(parsed) = commands::parse(text) else {
        // A plain reply to one of our GPT answers continues that conversation.
        if let (Some(gpt), Some(key)) = (&state.gpt, reply_to) {
            if gpt.has_context(key) {
                info!("GPT follow-up from {} in {}", user_id, msg.chat.id.0);
                gpt_reply(&bot, msg.chat.id, gpt, Some(key), text, state.config.dry_run).await;
            }
        }
        return Ok(());
    };

    let username = user.username.as_deref().unwrap_or(&user.first_name);
    let invoker = Invoker {
        user_id,
        chat_id: msg.chat.id.0,
        is_private: msg.chat.is_private(),
        is_admin: state.config.is_admin(user_id),
    };

    // Command word only: arguments may carry addresses.
    let verb: Vec<&str> = text.split_whitespace().take(2).collect();
    info!("Command from {} ({}) in {}: {}", username, user_id, msg.chat.id.0, verb.join(" "));

    let command = match parsed {
        Ok(command) => command,
        Err(usage) => {
            reply(&bot, msg.chat.id, &usage, state.config.dry_run).await;
            return Ok(());
        }
    };

    let response = match command {
        Command::Santa(cmd) => {
            Some(commands::handle_santa(&state.engine, state.messenger.as_ref(), &invoker, cmd).await)
        }
        Command::Reminder(cmd) => Some(commands::handle_reminder(
            &state.database,
            state.config.timezone,
            &invoker,
            cmd,
            Utc::now(),
        )),
        Command::Gpt { prompt } => match &state.gpt {
            Some(gpt) => {
                gpt_reply(&bot, msg.chat.id, gpt, reply_to, &prompt, state.config.dry_run).await;
                None
            }
            None => Some(commands::handle_gpt(None, reply_to, &prompt, Utc::now()).await.text),
        },
        Command::W2g { video_url, room } => {
            let who = match &user.username {
                Some(name) => format!("@{name}"),
                None => user.first_name.clone(),
            };
            Some(commands::handle_w2g(state.w2g.as_deref(), &who, &video_url, room.as_deref()).await)
        }
        Command::Help => Some(commands::help_text(invoker.is_admin)),
        Command::Ping => {
            ping(&bot, msg.chat.id, state.config.dry_run).await;
            None
        }
        Command::Shutdown => Some(shutdown(&state, &invoker)),
    };

    if let Some(text) = response {
        reply(&bot, msg.chat.id, &text, state.config.dry_run).await;
    }
    Ok(())
}

/// Returns the id of the sent message.
async fn reply(bot: &Bot, chat_id: ChatId, text: &str, dry_run: bool) -> Option<i32> {
    if dry_run {
        info!("[DRY RUN] Would reply in {}: {:?}", chat_id.0, text.chars().take(80).collect::<String>());
        return None;
    }
    match bot.send_message(chat_id, text).await {
        Ok(sent) => Some(sent.id.0),
        Err(e) => {
            warn!("Failed to reply in {}: {e}", chat_id.0);
            None
        }
    }
}

/// Answer a prompt and keep the conversation attached to the answer.
async fn gpt_reply(
    bot: &Bot,
    chat_id: ChatId,
    manager: &GptManager,
    reply_to: Option<gpt::ReplyKey>,
    prompt: &str,
    dry_run: bool,
) {
    if !dry_run {
        bot.send_chat_action(chat_id, teloxide::types::ChatAction::Typing).await.ok();
    }
    let answer = commands::handle_gpt(Some(manager), reply_to, prompt, Utc::now()).await;
    let sent = reply(bot, chat_id, &answer.text, dry_run).await;
    if let (Some(history), Some(message_id)) = (answer.history, sent) {
        manager.remember((chat_id.0, message_id), history);
    }
}

/// Reply, then edit the reply with the measured round trip.
async fn ping(bot: &Bot, chat_id: ChatId, dry_run: bool) {
    if dry_run {
        info!("[DRY RUN] Would answer ping in {}", chat_id.0);
        return;
    }
    let started = Instant::now();
    match bot.send_message(chat_id, "🏓 Pong!").await {
        Ok(sent) => {
            let elapsed = started.elapsed().as_millis();
            if let Err(e) = bot
                .edit_message_text(chat_id, sent.id, format!("🏓 Pong! {elapsed} ms"))
                .await
            {
                warn!("Failed to edit ping reply: {e}");
            }
        }
        Err(e) => warn!("Failed to answer ping: {e}"),
    }
}

fn shutdown(state: &BotState, invoker: &Invoker) -> String {
    if !invoker.is_admin {
        return "You do not have permission to run this command.".to_string();
    }
    let Some(token) = state.shutdown.get().cloned() else {
        warn!("Shutdown requested before the dispatcher started");
        return "[ERROR] Not ready to shut down yet.".to_string();
    };

    info!("Shutdown requested by {}", invoker.user_id);
    // The dispatcher waits for running handlers, this one included.
    tokio::spawn(async move {
        match token.shutdown() {
            Ok(done) => done.await,
            Err(_) => warn!("Dispatcher was not running"),
        }
    });
    "Shutting down... 👋".to_string()
}
