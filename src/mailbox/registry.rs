//! Agent roster used for broadcast fan-out and status output.

use chrono::Utc;

use super::Mailbox;
use crate::error::{Error, Result};
use crate::protocol::envelope::is_wire_safe;
use crate::protocol::{Agent, AgentStatus, BROADCAST_RECIPIENT};
use crate::store::format_ts;

const DEFAULT_ROLE: &str = "worker";

/// Optional `register` arguments; gaps are filled from the identity.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub id: Option<String>,
    pub role: Option<String>,
    pub branch: Option<String>,
    pub worktree: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Mailbox {
    /// Upsert an agent and mark it active.
    pub fn register(&self, registration: Registration) -> Result<Agent> {
        let id = non_empty(registration.id).unwrap_or_else(|| self.identity.agent_id.clone());
        if id == BROADCAST_RECIPIENT || !is_wire_safe(&id) {
            return Err(Error::validation(format!("invalid agent id '{}'", id)));
        }
        let role = non_empty(registration.role).unwrap_or_else(|| DEFAULT_ROLE.to_string());
        let branch = non_empty(registration.branch).or_else(|| self.identity.branch.clone());
        let worktree = non_empty(registration.worktree).or_else(|| self.identity.worktree.clone());

        self.store.upsert_agent(
            &id,
            &role,
            branch.as_deref(),
            worktree.as_deref(),
            &format_ts(Utc::now()),
        )?;
        tracing::info!("Registered agent {} ({})", id, role);

        self.store
            .get_agent(&id)?
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))
    }

    /// Mark an agent inactive. The row is kept.
    pub fn deregister(&self, id: Option<&str>) -> Result<Agent> {
        let id = id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.identity.agent_id)
            .to_string();

        if !self
            .store
            .set_agent_status(&id, AgentStatus::Inactive, &format_ts(Utc::now()))?
        {
            return Err(Error::NotFound(format!("agent {}", id)));
        }
        tracing::info!("Deregistered agent {}", id);

        self.store
            .get_agent(&id)?
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))
    }

    pub fn agents(&self, active_only: bool) -> Result<Vec<Agent>> {
        self.store.list_agents(active_only)
    }
}
