//! Key-value persistence for sessions, plus the SQLite reminder tables.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
#[cfg(test)]
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::reminders::Reminder;

/// Errors from the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend (SQLite, lock) failed.
    Backend(String),
    /// A blob could not be encoded or decoded.
    Serialize(String),
    /// The blob was written by a newer schema.
    UnsupportedVersion(u64),
    /// The blob decoded but breaks the session invariants.
    Invalid(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "storage backend error: {msg}"),
            Self::Serialize(msg) => write!(f, "failed to (de)serialize stored value: {msg}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported schema version {v}"),
            Self::Invalid(msg) => write!(f, "stored value is invalid: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Blob store keyed by string. Last write wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-process store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// SQLite-backed store: a `kv` table for session blobs and a `reminders` table.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database.
    #[cfg(test)]
    pub fn new() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    /// Open (or create) the database file at `path`.
    pub fn load_or_new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;

        let reminders = db.list_reminders(None).len();
        info!("Loaded database from {:?} ({} active reminders)", path, reminders);
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database lock poisoned".into()))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reminders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                trigger_at TEXT NOT NULL,
                repeat_cron TEXT,
                created_at TEXT NOT NULL,
                last_triggered_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_reminders_trigger_at ON reminders(trigger_at);
            CREATE INDEX IF NOT EXISTS idx_reminders_user_id ON reminders(user_id);
        "#).map_err(backend)
    }

    // ==================== REMINDER METHODS ====================

    /// Insert a reminder and return its id.
    pub fn create_reminder(
        &self,
        chat_id: i64,
        user_id: i64,
        message: &str,
        trigger_at: DateTime<Utc>,
        repeat_cron: Option<&str>,
    ) -> Result<i64, String> {
        let conn = self.conn().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO reminders (chat_id, user_id, message, trigger_at, repeat_cron, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![chat_id, user_id, message, trigger_at.to_rfc3339(), repeat_cron, Utc::now().to_rfc3339()],
        ).map_err(|e| format!("Failed to create reminder: {e}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Active reminders, optionally only those created by `user_id`.
    pub fn list_reminders(&self, user_id: Option<i64>) -> Vec<Reminder> {
        let Ok(conn) = self.conn() else {
            return Vec::new();
        };
        let sql = "SELECT id, chat_id, user_id, message, trigger_at, repeat_cron, last_triggered_at
                   FROM reminders WHERE active = 1 AND (?1 IS NULL OR user_id = ?1) ORDER BY trigger_at ASC";
        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!("Failed to prepare reminder query: {e}");
                return Vec::new();
            }
        };
        let rows = match stmt.query_map(params![user_id], row_to_reminder) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to list reminders: {e}");
                return Vec::new();
            }
        };
        let reminders: Vec<Reminder> = rows.filter_map(Result::ok).collect();
        reminders
    }

    /// Deactivate a reminder owned by `user_id`. False if none matched.
    pub fn cancel_reminder(&self, id: i64, user_id: i64) -> Result<bool, String> {
        let conn = self.conn().map_err(|e| e.to_string())?;
        let changed = conn
            .execute(
                "UPDATE reminders SET active = 0 WHERE id = ?1 AND user_id = ?2 AND active = 1",
                params![id, user_id],
            )
            .map_err(|e| format!("Failed to cancel reminder: {e}"))?;
        Ok(changed > 0)
    }

    /// Active reminders whose trigger time is at or before `now`.
    pub fn get_due_reminders(&self, now: DateTime<Utc>) -> Vec<Reminder> {
        self.list_reminders(None)
            .into_iter()
            .filter(|r| r.trigger_at <= now)
            .collect()
    }

    pub fn reschedule_reminder(&self, id: i64, next: DateTime<Utc>) -> Result<(), String> {
        let conn = self.conn().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE reminders SET trigger_at = ?2, last_triggered_at = ?3 WHERE id = ?1",
            params![id, next.to_rfc3339(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to reschedule reminder: {e}"))?;
        Ok(())
    }

    pub fn mark_reminder_completed(&self, id: i64) -> Result<(), String> {
        let conn = self.conn().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE reminders SET active = 0, last_triggered_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("Failed to complete reminder: {e}"))?;
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .map_err(backend)?;
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let last_triggered: Option<String> = row.get(6)?;
    Ok(Reminder {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        message: row.get(3)?,
        trigger_at: parse_time(&row.get::<_, String>(4)?)?,
        repeat_cron: row.get(5)?,
        last_triggered_at: last_triggered.as_deref().map(parse_time).transpose()?,
    })
}
