//! Inbox listing and the unread -> read -> archived lifecycle.

use chrono::Utc;
use serde::Serialize;

use super::Mailbox;
use crate::error::{Error, Result};
use crate::protocol::{Message, MessageStatus};
use crate::store::format_ts;

/// One agent's inbox, highest priority first then newest first.
#[derive(Debug, Clone, Serialize)]
pub struct Inbox {
    pub agent_id: String,
    pub messages: Vec<Message>,
    /// Non-archived messages addressed to the agent.
    pub total: usize,
    pub unread: usize,
}

impl Mailbox {
    /// List the inbox of `agent_id` (defaults to this process's identity).
    /// Messages addressed to `all` are included.
    pub fn check(&self, agent_id: Option<&str>, unread_only: bool) -> Result<Inbox> {
        let agent_id = agent_id.unwrap_or(&self.identity.agent_id).to_string();
        let messages = self.store.inbox(&agent_id, unread_only)?;
        let counts = self.store.inbox_counts(&agent_id)?;

        Ok(Inbox {
            agent_id,
            messages,
            total: counts.total,
            unread: counts.unread,
        })
    }

    /// Fetch a message, marking it read on first access. Reading a read or
    /// archived message leaves it untouched.
    pub fn read(&self, id: &str) -> Result<Message> {
        let message = self.require(id)?;
        if message.status != MessageStatus::Unread {
            return Ok(message);
        }

        if self.store.mark_read(id, &format_ts(Utc::now()))? {
            tracing::debug!("Marked {} read", id);
        }
        self.require(id)
    }

    /// Archive a message regardless of whether it was read.
    pub fn archive(&self, id: &str) -> Result<Message> {
        let message = self.require(id)?;
        if message.status == MessageStatus::Archived
            || !self.store.mark_archived(id, &format_ts(Utc::now()))?
        {
            return Err(Error::AlreadyArchived(id.to_string()));
        }

        tracing::info!("Archived {}", id);
        self.require(id)
    }

    fn require(&self, id: &str) -> Result<Message> {
        self.store
            .get_message(id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }
}
