//! One-time import from the legacy file-per-message inbox.
//!
//! Each legacy file is a TOON record:
//!
//! ```text
//! <!--TOON:message{id,from,to,type,priority,convoy,timestamp,status}:
//! msg-1,agent-a,agent-b,request,normal,none,2025-01-01T00:00:00Z,unread
//! -->
//! payload text...
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{Message, MessageStatus};
use crate::store::{format_ts, Store};

const HEADER_PREFIX: &str = "<!--TOON:message{";
const HEADER_END: &str = "-->";
const FIELD_COUNT: usize = 8;

/// Legacy subdirectories, in import order.
const LEGACY_DIRS: [&str; 3] = ["inbox", "outbox", "archive"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub imported: usize,
    /// Already present in the store.
    pub duplicates: usize,
    /// Unreadable or malformed files.
    pub skipped: usize,
}

/// Import every `*.toon` file under `dir/{inbox,outbox,archive}`.
pub fn migrate(store: &Store, dir: &Path) -> Result<MigrationReport> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!(
            "legacy directory {}",
            dir.display()
        )));
    }

    let mut report = MigrationReport::default();
    for sub in LEGACY_DIRS {
        let archived = sub == "archive";
        for path in toon_files(&dir.join(sub))? {
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|content| parse_toon(&content, archived));

            match parsed {
                Ok(message) => {
                    if store.ingest_message(&message)? {
                        report.imported += 1;
                    } else {
                        report.duplicates += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping legacy file {}: {}", path.display(), e);
                    report.skipped += 1;
                }
            }
        }
    }

    tracing::info!(
        "Migrated {} legacy message(s) from {} ({} duplicate, {} skipped)",
        report.imported,
        dir.display(),
        report.duplicates,
        report.skipped
    );
    Ok(report)
}

fn toon_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = dir.join("*.toon");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| Error::Other(format!("non-UTF-8 path {}", dir.display())))?;

    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| Error::Other(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();
    Ok(files)
}

/// Parse one TOON record. Files from the archive directory are imported as
/// archived whatever their recorded status.
pub fn parse_toon(content: &str, archived: bool) -> Result<Message> {
    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default().trim();
    if !header.starts_with(HEADER_PREFIX) {
        return Err(Error::validation("missing TOON header"));
    }
    let row = lines
        .next()
        .ok_or_else(|| Error::validation("missing TOON row"))?;
    if lines.next().map(str::trim) != Some(HEADER_END) {
        return Err(Error::validation("unterminated TOON header"));
    }
    let payload = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    let fields: Vec<&str> = row.splitn(FIELD_COUNT, ',').map(str::trim).collect();
    let [id, from, to, kind, priority, convoy, timestamp, status] = fields[..] else {
        return Err(Error::validation(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        )));
    };
    if id.is_empty() || from.is_empty() || to.is_empty() {
        return Err(Error::validation("empty id, from or to"));
    }

    let created_at = DateTime::parse_from_rfc3339(timestamp)
        .map(|ts| format_ts(ts.with_timezone(&Utc)))
        .map_err(|e| Error::validation(format!("bad timestamp '{}': {}", timestamp, e)))?;
    let status = if archived {
        MessageStatus::Archived
    } else {
        status.parse()?
    };

    Ok(Message {
        id: id.to_string(),
        from_agent: from.to_string(),
        to_agent: to.to_string(),
        message_type: kind.parse()?,
        priority: priority.parse()?,
        convoy: convoy.to_string(),
        payload,
        status,
        read_at: (status != MessageStatus::Unread).then(|| created_at.clone()),
        archived_at: (status == MessageStatus::Archived).then(|| created_at.clone()),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, Priority};
    use tempfile::TempDir;

    fn toon(id: &str, status: &str, payload: &str) -> String {
        format!(
            "<!--TOON:message{{id,from,to,type,priority,convoy,timestamp,status}}:\n\
             {},agent-a,agent-b,discovery,high,c-1,2025-03-01T12:00:00Z,{}\n\
             -->\n{}\n",
            id, status, payload
        )
    }

    #[test]
    fn test_parse_toon() {
        let message = parse_toon(&toon("msg-1", "read", "line one\nline two"), false).unwrap();
        assert_eq!(message.id, "msg-1");
        assert_eq!(message.message_type, MessageType::Discovery);
        assert_eq!(message.priority, Priority::High);
        assert_eq!(message.status, MessageStatus::Read);
        assert_eq!(message.payload, "line one\nline two");
        assert_eq!(message.created_at, "2025-03-01T12:00:00.000Z");
        assert!(message.read_at.is_some());
        assert!(message.archived_at.is_none());

        let archived = parse_toon(&toon("msg-2", "unread", "x"), true).unwrap();
        assert_eq!(archived.status, MessageStatus::Archived);
        assert!(archived.archived_at.is_some());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_toon("just text", false).is_err());
        assert!(parse_toon("<!--TOON:message{id}:\nmsg-1,a\n-->\n", false).is_err());
        assert!(parse_toon(&toon("msg-1", "lost", "x"), false).is_err());
    }

    #[test]
    fn test_migrate_directory_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let legacy = temp_dir.path();
        for sub in LEGACY_DIRS {
            std::fs::create_dir_all(legacy.join(sub)).unwrap();
        }
        std::fs::write(legacy.join("inbox/1.toon"), toon("msg-1", "unread", "a")).unwrap();
        std::fs::write(legacy.join("archive/2.toon"), toon("msg-2", "read", "b")).unwrap();
        std::fs::write(legacy.join("outbox/3.toon"), "garbage").unwrap();
        std::fs::write(legacy.join("outbox/notes.txt"), "ignored").unwrap();

        let store = Store::open_in_memory().unwrap();
        let report = migrate(&store, legacy).unwrap();
        assert_eq!(
            report,
            MigrationReport {
                imported: 2,
                duplicates: 0,
                skipped: 1
            }
        );
        assert_eq!(
            store.get_message("msg-2").unwrap().unwrap().status,
            MessageStatus::Archived
        );

        let again = migrate(&store, legacy).unwrap();
        assert_eq!(again.imported, 0);
        assert_eq!(again.duplicates, 2);
    }

    #[test]
    fn test_missing_directory() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            migrate(&store, Path::new("/nonexistent/legacy")),
            Err(Error::NotFound(_))
        ));
    }
}
