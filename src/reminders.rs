//! Reminder system for scheduled messages.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::messenger::Messenger;
use crate::store::Database;

/// A reminder stored in the database.
#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub message: String,
    pub trigger_at: DateTime<Utc>,
    pub repeat_cron: Option<String>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// Parse trigger time: "+30m", "+2h", "+1d", "+1w", unix seconds, or
/// "2026-01-25 15:00" in `tz`. Times in the past are rejected.
pub fn parse_trigger_time(input: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let input = input.trim();

    let when = if let Some(rest) = input.strip_prefix('+') {
        parse_relative(input, rest, now)?
    } else if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        let secs: i64 = input
            .parse()
            .map_err(|_| format!("Invalid timestamp '{}'", input))?;
        DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("Timestamp out of range: {}", secs))?
    } else {
        let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
            .map_err(|e| format!("Invalid date format: {}. Use YYYY-MM-DD HH:MM", e))?;
        tz.from_local_datetime(&naive)
            .single()
            .ok_or_else(|| format!("'{}' is ambiguous or skipped in {}", input, tz))?
            .with_timezone(&Utc)
    };

    if when <= now {
        return Err(format!("{} is in the past", format_time(when, tz)));
    }
    Ok(when)
}

fn parse_relative(input: &str, rest: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    if rest.len() < 2 {
        return Err(format!("Invalid relative time: '{}'", input));
    }

    // Find where the number ends and unit begins
    let unit_start = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if unit_start == 0 {
        return Err(format!("Invalid number in '{}'", input));
    }

    let num: i64 = rest[..unit_start]
        .parse()
        .map_err(|_| format!("Invalid number in '{}'", input))?;

    let duration = match &rest[unit_start..] {
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(num),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::try_hours(num),
        "d" | "day" | "days" => Duration::try_days(num),
        "w" | "week" | "weeks" => Duration::try_weeks(num),
        unit => return Err(format!("Unknown unit '{}'. Use m/h/d/w", unit)),
    };
    duration
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| format!("'{}' is out of range", input))
}

/// Get next trigger time from a cron expression evaluated in `tz`.
pub fn next_cron_trigger(expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, String> {
    let schedule = Schedule::from_str(expr).map_err(|e| format!("Invalid cron: {}", e))?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| "No future occurrence for cron".to_string())
}

/// Cron expression firing every day at "HH:MM".
pub fn daily_cron(time: &str) -> Result<String, String> {
    let (hour, minute) = time
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("Invalid time '{}'. Use HH:MM", time))?;
    let hour: u32 = hour.parse().map_err(|_| format!("Invalid hour in '{}'", time))?;
    let minute: u32 = minute.parse().map_err(|_| format!("Invalid minute in '{}'", time))?;
    if hour > 23 || minute > 59 {
        return Err(format!("Invalid time '{}'. Use HH:MM", time));
    }
    // cron crate uses 7-field format: sec min hour day month dow year
    Ok(format!("0 {} {} * * * *", minute, hour))
}

pub fn format_time(when: DateTime<Utc>, tz: Tz) -> String {
    when.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string()
}

/// One line per reminder for `/reminder list`.
pub fn describe(reminder: &Reminder, tz: Tz) -> String {
    let repeat = match (&reminder.repeat_cron, reminder.last_triggered_at) {
        (Some(cron), Some(last)) => format!(" (repeats: {}, last sent {})", cron, format_time(last, tz)),
        (Some(cron), None) => format!(" (repeats: {})", cron),
        (None, _) => String::new(),
    };
    format!(
        "#{} at {}{}: {}",
        reminder.id,
        format_time(reminder.trigger_at, tz),
        repeat,
        reminder.message
    )
}

/// Check and fire due reminders. Returns how many were sent.
pub async fn check_reminders(
    database: &Database,
    messenger: &dyn Messenger,
    tz: Tz,
    now: DateTime<Utc>,
) -> usize {
    let due_reminders = database.get_due_reminders(now);
    if due_reminders.is_empty() {
        return 0;
    }

    info!("Firing {} due reminder(s)", due_reminders.len());

    let mut sent = 0;
    for reminder in due_reminders {
        let text = format!("⏰ Reminder: {}", reminder.message);
        match messenger.send_to_channel(reminder.chat_id, &text).await {
            Ok(msg_id) => {
                sent += 1;
                info!(
                    "Sent reminder #{} from user {} to chat {} (msg {})",
                    reminder.id, reminder.user_id, reminder.chat_id, msg_id
                );
            }
            Err(e) => {
                warn!("Failed to send reminder #{}: {}", reminder.id, e);
            }
        }

        if let Some(cron) = &reminder.repeat_cron {
            // Recurring reminder - reschedule to next occurrence
            match next_cron_trigger(cron, now, tz) {
                Ok(next_trigger) => {
                    if let Err(e) = database.reschedule_reminder(reminder.id, next_trigger) {
                        warn!("Failed to reschedule reminder #{}: {}", reminder.id, e);
                    } else {
                        info!("Rescheduled reminder #{} to {}", reminder.id, next_trigger);
                    }
                }
                Err(e) => {
                    warn!("Failed to calculate next trigger for reminder #{}: {}", reminder.id, e);
                    if let Err(e) = database.mark_reminder_completed(reminder.id) {
                        warn!("Failed to mark reminder #{} completed: {}", reminder.id, e);
                    }
                }
            }
        } else if let Err(e) = database.mark_reminder_completed(reminder.id) {
            warn!("Failed to mark reminder #{} completed: {}", reminder.id, e);
        }
    }

    sent
}

/// Spawn the background task that fires reminders every `every`.
pub fn spawn_checker(
    database: Arc<Database>,
    messenger: Arc<dyn Messenger>,
    tz: Tz,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            check_reminders(&database, messenger.as_ref(), tz, Utc::now()).await;
        }
    })
}
