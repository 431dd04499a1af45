//! SQLite-backed mailbox storage shared by every local agent process.
//!
//! Many short-lived processes open the same file, so the connection runs in
//! WAL mode with a busy timeout, and contended writes are retried a bounded
//! number of times before the error surfaces.

mod agents;
mod messages;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Error, Result};

pub use messages::{InboxCounts, StoreStats};

/// Current schema version (`PRAGMA user_version`).
/// 1: messages only. 2: adds the agents roster.
pub const SCHEMA_VERSION: i64 = 2;

/// How long SQLite waits on a lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts for a write that keeps hitting a busy database.
const MAX_ATTEMPTS: u32 = 3;

/// Base back-off between retries; multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

const MESSAGES_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        from_agent TEXT NOT NULL,
        to_agent TEXT NOT NULL,
        type TEXT NOT NULL CHECK (type IN ('task_dispatch', 'status_report', 'discovery', 'request', 'broadcast')),
        priority TEXT NOT NULL DEFAULT 'normal' CHECK (priority IN ('high', 'normal', 'low')),
        convoy TEXT NOT NULL DEFAULT 'none',
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'unread' CHECK (status IN ('unread', 'read', 'archived')),
        created_at TEXT NOT NULL,
        read_at TEXT,
        archived_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(to_agent, status);
    CREATE INDEX IF NOT EXISTS idx_messages_archived ON messages(status, archived_at);
"#;

const AGENTS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        role TEXT NOT NULL DEFAULT 'worker',
        branch TEXT,
        worktree TEXT,
        status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
        registered_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status, last_seen_at);
"#;

/// Format a timestamp the way every column stores it (fixed width, UTC).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Handle to the mailbox database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path`, creating its directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        tracing::debug!("Opened mailbox store at {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn, path: None };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Idempotent schema creation plus upgrade of older databases.
    fn init_schema(&self) -> Result<()> {
        self.with_retry("init schema", |conn| {
            conn.execute_batch(MESSAGES_SCHEMA)?;

            let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if !table_exists(conn, "agents")? {
                if version > 0 {
                    tracing::info!(
                        "Upgrading mailbox schema from version {} to {}",
                        version,
                        SCHEMA_VERSION
                    );
                }
                conn.execute_batch(AGENTS_SCHEMA)?;
            }
            if version < SCHEMA_VERSION {
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            Ok(())
        })
    }

    /// Schema version recorded in the file.
    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Run `f`, retrying while SQLite reports the database busy or locked.
    pub(crate) fn with_retry<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match f(&self.conn) {
                Err(e) if e.is_busy() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        "Mailbox busy during {} (attempt {}/{}), retrying",
                        op,
                        attempt,
                        MAX_ATTEMPTS
                    );
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Reclaim space left by deleted rows.
    pub fn vacuum(&self) -> Result<()> {
        self.with_retry("vacuum", |conn| {
            conn.execute_batch("VACUUM;")?;
            if self.path.is_some() {
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            }
            Ok(())
        })
    }

    /// On-disk size of the database including its WAL, 0 for in-memory stores.
    pub fn file_size(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        let wal = PathBuf::from(format!("{}-wal", path.display()));
        [path.as_path(), wal.as_path()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Map a TEXT column onto one of the protocol enums.
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_directory_and_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("mailbox.db");

        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(store.file_size() > 0);
    }

    #[test]
    fn test_open_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mailbox.db");

        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrades_database_without_agents_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mailbox.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(MESSAGES_SCHEMA).unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(table_exists(&store.conn, "agents").unwrap());
        assert!(store.list_agents(false).unwrap().is_empty());
    }

    fn sample_message(id: &str) -> crate::protocol::Message {
        crate::protocol::Message {
            id: id.to_string(),
            from_agent: "agent-a".to_string(),
            to_agent: "agent-b".to_string(),
            message_type: crate::protocol::MessageType::Request,
            priority: crate::protocol::Priority::Normal,
            convoy: "none".to_string(),
            payload: "hello".to_string(),
            status: crate::protocol::MessageStatus::Unread,
            created_at: format_ts(Utc::now()),
            read_at: None,
            archived_at: None,
        }
    }

    #[test]
    fn test_writer_waits_for_competing_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mailbox.db");
        let holder = Store::open(&path).unwrap();
        let writer = Store::open(&path).unwrap();

        holder.conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1000));
            holder.conn.execute_batch("COMMIT").unwrap();
        });

        writer.insert_message(&sample_message("msg-late")).unwrap();
        release.join().unwrap();
        assert!(writer.get_message("msg-late").unwrap().is_some());
    }

    #[test]
    fn test_busy_errors_are_retried_a_bounded_number_of_times() {
        let store = Store::open_in_memory().unwrap();
        let mut attempts = 0;
        let result: Result<()> = store.with_retry("busy op", |_| {
            attempts += 1;
            Err(Error::Storage(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            )))
        });

        assert!(result.unwrap_err().is_busy());
        assert_eq!(attempts, MAX_ATTEMPTS);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let store = Store::open_in_memory().unwrap();
        let mut attempts = 0;
        let result: Result<()> = store.with_retry("bad op", |_| {
            attempts += 1;
            Err(Error::validation("nope"))
        });

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = format_ts(Utc::now());
        let later = format_ts(Utc::now() + chrono::Duration::days(3));
        assert!(earlier < later);
        assert!(earlier.ends_with('Z'));
    }
}
