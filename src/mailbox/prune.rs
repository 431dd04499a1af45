//! Garbage collection of old messages.
//!
//! Reporting never mutates. Forcing captures notable payloads into memory,
//! archives stale read messages, deletes old archived ones and compacts
//! the database file.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::Mailbox;
use crate::error::Result;
use crate::memory::MemoryRecorder;
use crate::protocol::{Message, MessageType, NO_CONVOY};
use crate::store::{format_ts, Store, StoreStats};

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub threshold_days: u32,
    pub cutoff: String,
    pub stats: StoreStats,
    /// Archived messages old enough to delete.
    pub prunable: usize,
    /// Read messages old enough to be archived first.
    pub archivable: usize,
    pub db_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub remembered: usize,
    pub remember_failures: usize,
    pub auto_archived: usize,
    pub deleted: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

fn cutoff(days: u32, now: DateTime<Utc>) -> String {
    format_ts(now - Duration::days(i64::from(days)))
}

pub fn report(store: &Store, days: u32) -> Result<PruneReport> {
    report_at(store, days, Utc::now())
}

pub fn report_at(store: &Store, days: u32, now: DateTime<Utc>) -> Result<PruneReport> {
    let cutoff = cutoff(days, now);
    Ok(PruneReport {
        threshold_days: days,
        stats: store.stats()?,
        prunable: store.count_prunable(&cutoff)?,
        archivable: store.count_archivable(&cutoff)?,
        db_bytes: store.file_size(),
        cutoff,
    })
}

pub async fn force(store: &Store, memory: &dyn MemoryRecorder, days: u32) -> Result<PruneOutcome> {
    force_at(store, memory, days, Utc::now()).await
}

pub async fn force_at(
    store: &Store,
    memory: &dyn MemoryRecorder,
    days: u32,
    now: DateTime<Utc>,
) -> Result<PruneOutcome> {
    let cutoff = cutoff(days, now);
    let mut outcome = PruneOutcome {
        bytes_before: store.file_size(),
        ..Default::default()
    };

    let memorable: Vec<MessageType> = MessageType::ALL
        .into_iter()
        .filter(MessageType::is_memorable)
        .collect();
    for message in store.prunable_of_types(&cutoff, &memorable)? {
        let (text, tags) = memory_entry(&message);
        match memory.remember(&text, &tags).await {
            Ok(()) => outcome.remembered += 1,
            Err(e) => {
                outcome.remember_failures += 1;
                tracing::warn!("Failed to remember {} before pruning: {}", message.id, e);
            }
        }
    }

    outcome.auto_archived = store.auto_archive_read_before(&cutoff, &format_ts(now))?;
    outcome.deleted = store.delete_archived_before(&cutoff)?;
    store.vacuum()?;
    outcome.bytes_after = store.file_size();

    tracing::info!(
        "Pruned {} message(s), auto-archived {}, remembered {} ({} -> {} bytes)",
        outcome.deleted,
        outcome.auto_archived,
        outcome.remembered,
        outcome.bytes_before,
        outcome.bytes_after
    );
    Ok(outcome)
}

fn memory_entry(message: &Message) -> (String, Vec<String>) {
    let text = format!(
        "[{}] {} -> {}: {}",
        message.message_type, message.from_agent, message.to_agent, message.payload
    );
    let mut tags = vec![
        "agent-mail".to_string(),
        message.message_type.to_string(),
        message.from_agent.clone(),
    ];
    if message.convoy != NO_CONVOY {
        tags.push(message.convoy.clone());
    }
    (text, tags)
}

impl Mailbox {
    pub fn prune_report(&self, days: u32) -> Result<PruneReport> {
        report(&self.store, days)
    }

    pub async fn prune_force(&self, memory: &dyn MemoryRecorder, days: u32) -> Result<PruneOutcome> {
        force(&self.store, memory, days).await
    }
}
