use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gpt::DEFAULT_MODEL;
use crate::santa::{ExclusionSet, PairingLimits, SessionTemplate};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Users allowed to start/reset the exchange and shut the bot down.
    admin_ids: Vec<i64>,
    telegram_bot_token: String,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    #[serde(default)]
    dry_run: bool,
    /// IANA timezone for reminder input and display.
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default = "default_reminder_check_secs")]
    reminder_check_secs: u64,
    /// Enables `/gpt` when set.
    openai_api_key: Option<String>,
    openai_model: Option<String>,
    /// Enables `/w2g` when set.
    w2g_api_key: Option<String>,
    santa: SantaFile,
}

#[derive(Deserialize)]
struct SantaFile {
    /// Chat used for anonymous `/ss channel` posts.
    channel_id: i64,
    /// Giver id -> ids that giver must never draw.
    #[serde(default)]
    blacklists: BTreeMap<i64, Vec<i64>>,
    max_shuffle_attempts: Option<usize>,
    max_backtrack_steps: Option<usize>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_reminder_check_secs() -> u64 {
    60
}

/// Blank keys in the file mean "not configured".
fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct Config {
    pub admin_ids: HashSet<i64>,
    pub telegram_bot_token: String,
    pub log_chat_id: Option<i64>,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub dry_run: bool,
    pub timezone: Tz,
    pub reminder_check_interval: Duration,
    pub santa_channel_id: i64,
    pub blacklists: ExclusionSet,
    pub pairing_limits: PairingLimits,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub w2g_api_key: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.admin_ids.is_empty() {
            return Err(ConfigError::Validation("admin_ids must contain at least one user ID".into()));
        }
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.santa.channel_id == 0 {
            return Err(ConfigError::Validation("santa.channel_id is required".into()));
        }
        for (giver, blocked) in &file.santa.blacklists {
            if blocked.contains(giver) {
                return Err(ConfigError::Validation(format!(
                    "santa.blacklists: {giver} lists themself"
                )));
            }
        }
        if file.reminder_check_secs == 0 {
            return Err(ConfigError::Validation("reminder_check_secs must be positive".into()));
        }

        let timezone: Tz = file
            .timezone
            .parse()
            .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", file.timezone)))?;

        let defaults = PairingLimits::default();
        let pairing_limits = PairingLimits {
            max_shuffle_attempts: file.santa.max_shuffle_attempts.unwrap_or(defaults.max_shuffle_attempts),
            max_backtrack_steps: file.santa.max_backtrack_steps.unwrap_or(defaults.max_backtrack_steps),
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            admin_ids: file.admin_ids.into_iter().collect(),
            telegram_bot_token: file.telegram_bot_token,
            log_chat_id: file.log_chat_id,
            data_dir,
            dry_run: file.dry_run,
            timezone,
            reminder_check_interval: Duration::from_secs(file.reminder_check_secs),
            santa_channel_id: file.santa.channel_id,
            blacklists: file.santa.blacklists,
            pairing_limits,
            openai_api_key: non_empty(file.openai_api_key),
            openai_model: non_empty(file.openai_model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            w2g_api_key: non_empty(file.w2g_api_key),
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub fn session_template(&self) -> SessionTemplate {
        SessionTemplate {
            primary_channel: self.santa_channel_id,
            exclusions: self.blacklists.clone(),
        }
    }
}
