//! Message queries.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::{parse_column, Store};
use crate::error::Result;
use crate::protocol::{Message, MessageStatus, MessageType, BROADCAST_RECIPIENT};

const MESSAGE_COLUMNS: &str = "id, from_agent, to_agent, type, priority, convoy, payload, \
     status, created_at, read_at, archived_at";

const PRIORITY_ORDER: &str =
    "CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        message_type: parse_column(row, 3)?,
        priority: parse_column(row, 4)?,
        convoy: row.get(5)?,
        payload: row.get(6)?,
        status: parse_column(row, 7)?,
        created_at: row.get(8)?,
        read_at: row.get(9)?,
        archived_at: row.get(10)?,
    })
}

/// Inbox totals for one agent (archived messages excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxCounts {
    pub total: usize,
    pub unread: usize,
}

/// Whole-store statistics used by `status` and prune reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub unread: usize,
    pub read: usize,
    pub archived: usize,
    pub by_type: BTreeMap<String, usize>,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

const INSERT_SQL: &str = "INSERT INTO messages (id, from_agent, to_agent, type, priority, convoy, \
     payload, status, created_at, read_at, archived_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const INGEST_SQL: &str = "INSERT OR IGNORE INTO messages (id, from_agent, to_agent, type, \
     priority, convoy, payload, status, created_at, read_at, archived_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

fn bind(sql: &str, conn: &rusqlite::Connection, m: &Message) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            m.id,
            m.from_agent,
            m.to_agent,
            m.message_type.as_str(),
            m.priority.as_str(),
            m.convoy,
            m.payload,
            m.status.as_str(),
            m.created_at,
            m.read_at,
            m.archived_at,
        ],
    )
}

impl Store {
    /// Insert a new message. A duplicate id is an error.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.insert_messages(std::slice::from_ref(message))
    }

    /// Insert several messages in one transaction (broadcast fan-out).
    pub fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        self.with_retry("insert messages", |conn| {
            let tx = conn.unchecked_transaction()?;
            for message in messages {
                bind(INSERT_SQL, &tx, message)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Insert a message unless its id is already stored.
    /// Returns true if a row was added.
    pub fn ingest_message(&self, message: &Message) -> Result<bool> {
        self.with_retry("ingest message", |conn| {
            Ok(bind(INGEST_SQL, conn, message)? > 0)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], row_to_message)
            .optional()?)
    }

    /// Messages addressed to `agent_id` (or to everyone), highest priority
    /// first, newest first within a priority.
    pub fn inbox(&self, agent_id: &str, unread_only: bool) -> Result<Vec<Message>> {
        let status_filter = if unread_only {
            "status = 'unread'"
        } else {
            "status != 'archived'"
        };
        let sql = format!(
            "SELECT {} FROM messages WHERE (to_agent = ?1 OR to_agent = ?2) AND {} \
             ORDER BY {}, created_at DESC, id DESC",
            MESSAGE_COLUMNS, status_filter, PRIORITY_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![agent_id, BROADCAST_RECIPIENT], row_to_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn inbox_counts(&self, agent_id: &str) -> Result<InboxCounts> {
        let (total, unread): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'unread'), 0) FROM messages \
             WHERE (to_agent = ?1 OR to_agent = ?2) AND status != 'archived'",
            params![agent_id, BROADCAST_RECIPIENT],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(InboxCounts {
            total: total as usize,
            unread: unread as usize,
        })
    }

    /// unread -> read. Returns false if the message was not unread.
    pub fn mark_read(&self, id: &str, at: &str) -> Result<bool> {
        self.with_retry("mark read", |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'read', read_at = ?2 WHERE id = ?1 AND status = 'unread'",
                params![id, at],
            )?;
            Ok(changed > 0)
        })
    }

    /// unread/read -> archived. Returns false if already archived or absent.
    pub fn mark_archived(&self, id: &str, at: &str) -> Result<bool> {
        self.with_retry("mark archived", |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'archived', archived_at = ?2 \
                 WHERE id = ?1 AND status != 'archived'",
                params![id, at],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_column::<MessageStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            stats.total += count;
            match status {
                MessageStatus::Unread => stats.unread = count,
                MessageStatus::Read => stats.read = count,
                MessageStatus::Archived => stats.archived = count,
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT type, COUNT(*) FROM messages GROUP BY type ORDER BY type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            stats.by_type.insert(kind, count as usize);
        }

        let (oldest, newest): (Option<String>, Option<String>) = self.conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM messages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.oldest = oldest;
        stats.newest = newest;

        Ok(stats)
    }

    /// Archived messages whose `archived_at` is before `cutoff`.
    pub fn count_prunable(&self, cutoff: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status = 'archived' AND archived_at < ?1",
            [cutoff],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Read messages whose `read_at` is before `cutoff`.
    pub fn count_archivable(&self, cutoff: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status = 'read' AND COALESCE(read_at, created_at) < ?1",
            [cutoff],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Prunable messages of the given types, oldest first.
    pub fn prunable_of_types(&self, cutoff: &str, types: &[MessageType]) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE status = 'archived' AND archived_at < ?1 \
             ORDER BY archived_at ASC",
            MESSAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([cutoff], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            let message = row?;
            if types.contains(&message.message_type) {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Archive read messages read before `cutoff`. Returns rows changed.
    pub fn auto_archive_read_before(&self, cutoff: &str, at: &str) -> Result<usize> {
        self.with_retry("auto-archive", |conn| {
            Ok(conn.execute(
                "UPDATE messages SET status = 'archived', archived_at = ?2 \
                 WHERE status = 'read' AND COALESCE(read_at, created_at) < ?1",
                params![cutoff, at],
            )?)
        })
    }

    /// Delete archived messages archived before `cutoff`. Returns rows deleted.
    pub fn delete_archived_before(&self, cutoff: &str) -> Result<usize> {
        self.with_retry("delete archived", |conn| {
            Ok(conn.execute(
                "DELETE FROM messages WHERE status = 'archived' AND archived_at < ?1",
                [cutoff],
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{new_message_id, Priority};
    use crate::store::format_ts;
    use chrono::Utc;

    fn message(to: &str, priority: Priority, created_at: &str) -> Message {
        Message {
            id: new_message_id(),
            from_agent: "agent-a".to_string(),
            to_agent: to.to_string(),
            message_type: MessageType::Request,
            priority,
            convoy: "none".to_string(),
            payload: "hello".to_string(),
            status: MessageStatus::Unread,
            created_at: created_at.to_string(),
            read_at: None,
            archived_at: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let msg = message("agent-b", Priority::Normal, &format_ts(Utc::now()));
        store.insert_message(&msg).unwrap();

        assert_eq!(store.get_message(&msg.id).unwrap(), Some(msg.clone()));
        assert!(store.get_message("msg-missing").unwrap().is_none());
        assert!(store.insert_message(&msg).is_err());
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let msg = message("agent-b", Priority::Normal, &format_ts(Utc::now()));

        assert!(store.ingest_message(&msg).unwrap());
        assert!(!store.ingest_message(&msg).unwrap());
        assert_eq!(store.stats().unwrap().total, 1);
    }

    #[test]
    fn test_inbox_orders_by_priority_then_recency() {
        let store = Store::open_in_memory().unwrap();
        let low = message("agent-b", Priority::Low, "2026-01-01T00:00:03.000Z");
        let old_high = message("agent-b", Priority::High, "2026-01-01T00:00:01.000Z");
        let new_high = message("agent-b", Priority::High, "2026-01-01T00:00:02.000Z");
        let normal = message("all", Priority::Normal, "2026-01-01T00:00:04.000Z");
        let other = message("agent-c", Priority::High, "2026-01-01T00:00:05.000Z");
        for m in [&low, &old_high, &new_high, &normal, &other] {
            store.insert_message(m).unwrap();
        }

        let ids: Vec<String> = store
            .inbox("agent-b", false)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![new_high.id, old_high.id, normal.id, low.id]);
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        let store = Store::open_in_memory().unwrap();
        let msg = message("agent-b", Priority::Normal, &format_ts(Utc::now()));
        store.insert_message(&msg).unwrap();
        let now = format_ts(Utc::now());

        assert!(store.mark_read(&msg.id, &now).unwrap());
        assert!(!store.mark_read(&msg.id, &now).unwrap());
        assert!(store.mark_archived(&msg.id, &now).unwrap());
        assert!(!store.mark_archived(&msg.id, &now).unwrap());
        assert!(!store.mark_read(&msg.id, &now).unwrap());

        let stored = store.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Archived);
        assert!(stored.read_at.is_some());
        assert!(stored.archived_at.is_some());
    }

    #[test]
    fn test_counts_and_stats() {
        let store = Store::open_in_memory().unwrap();
        let now = format_ts(Utc::now());
        let a = message("agent-b", Priority::Normal, &now);
        let b = message("agent-b", Priority::Normal, &now);
        store.insert_messages(&[a.clone(), b.clone()]).unwrap();
        store.mark_read(&a.id, &now).unwrap();

        assert_eq!(
            store.inbox_counts("agent-b").unwrap(),
            InboxCounts { total: 2, unread: 1 }
        );
        assert_eq!(store.inbox_counts("agent-z").unwrap(), InboxCounts::default());

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unread, 1);
        assert_eq!(stats.read, 1);
        assert_eq!(stats.by_type.get("request"), Some(&2));
        assert_eq!(stats.oldest.as_deref(), Some(now.as_str()));
    }
}
