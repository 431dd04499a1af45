//! Message and agent types for the mailbox.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sentinel recipient meaning "every agent".
pub const BROADCAST_RECIPIENT: &str = "all";

/// Default convoy when none is given.
pub const NO_CONVOY: &str = "none";

/// Message type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed from one agent to another
    TaskDispatch,
    /// Progress or completion report
    StatusReport,
    /// Something worth remembering
    Discovery,
    /// Question or ask expecting an answer
    Request,
    /// Sent to every active agent
    Broadcast,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::TaskDispatch,
        MessageType::StatusReport,
        MessageType::Discovery,
        MessageType::Request,
        MessageType::Broadcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskDispatch => "task_dispatch",
            MessageType::StatusReport => "status_report",
            MessageType::Discovery => "discovery",
            MessageType::Request => "request",
            MessageType::Broadcast => "broadcast",
        }
    }

    /// Types whose payload is captured into memory before pruning.
    pub fn is_memorable(&self) -> bool {
        matches!(self, MessageType::Discovery | MessageType::StatusReport)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                Error::validation(format!(
                    "invalid message type '{}' (expected one of: task_dispatch, status_report, discovery, request, broadcast)",
                    s
                ))
            })
    }
}

/// Message priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::validation(format!(
                "invalid priority '{}' (expected high, normal or low)",
                other
            ))),
        }
    }
}

/// Message lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
    Archived,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
            MessageStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(MessageStatus::Unread),
            "read" => Ok(MessageStatus::Read),
            "archived" => Ok(MessageStatus::Archived),
            other => Err(Error::validation(format!("invalid message status '{}'", other))),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub convoy: String,
    pub payload: String,
    pub status: MessageStatus,
    pub created_at: String,
    pub read_at: Option<String>,
    pub archived_at: Option<String>,
}

/// Roster state of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "inactive" => Ok(AgentStatus::Inactive),
            other => Err(Error::validation(format!("invalid agent status '{}'", other))),
        }
    }
}

/// A roster entry for a known agent process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub role: String,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub status: AgentStatus,
    pub registered_at: String,
    pub last_seen_at: String,
}

/// Generate a fresh message id (timestamp + random suffix).
pub fn new_message_id() -> String {
    format!("msg-{}", ulid::Ulid::new().to_string().to_lowercase())
}
