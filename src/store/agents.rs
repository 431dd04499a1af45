//! Agent roster queries.

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_column, Store};
use crate::error::Result;
use crate::protocol::{Agent, AgentStatus};

const AGENT_COLUMNS: &str = "id, role, branch, worktree, status, registered_at, last_seen_at";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        role: row.get(1)?,
        branch: row.get(2)?,
        worktree: row.get(3)?,
        status: parse_column(row, 4)?,
        registered_at: row.get(5)?,
        last_seen_at: row.get(6)?,
    })
}

impl Store {
    /// Insert or refresh an agent; always leaves it active.
    pub fn upsert_agent(
        &self,
        id: &str,
        role: &str,
        branch: Option<&str>,
        worktree: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_retry("register agent", |conn| {
            conn.execute(
                "INSERT INTO agents (id, role, branch, worktree, status, registered_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5) \
                 ON CONFLICT(id) DO UPDATE SET \
                     role = excluded.role, \
                     branch = excluded.branch, \
                     worktree = excluded.worktree, \
                     status = 'active', \
                     last_seen_at = excluded.last_seen_at",
                params![id, role, branch, worktree, now],
            )?;
            Ok(())
        })
    }

    /// Returns false if no such agent exists.
    pub fn set_agent_status(&self, id: &str, status: AgentStatus, now: &str) -> Result<bool> {
        self.with_retry("update agent", |conn| {
            let changed = conn.execute(
                "UPDATE agents SET status = ?2, last_seen_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], row_to_agent).optional()?)
    }

    /// Agents, most recently seen first.
    pub fn list_agents(&self, active_only: bool) -> Result<Vec<Agent>> {
        let filter = if active_only {
            "WHERE status = 'active'"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM agents {} ORDER BY last_seen_at DESC, id ASC",
            AGENT_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_agent)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ids of active agents other than `sender`, used for broadcast fan-out.
    pub fn active_agent_ids_except(&self, sender: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM agents WHERE status = 'active' AND id != ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([sender], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_refreshes_and_reactivates() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_agent("agent-a", "worker", Some("feature/x"), Some("/w/a"), "2026-01-01T00:00:00.000Z")
            .unwrap();
        store
            .set_agent_status("agent-a", AgentStatus::Inactive, "2026-01-01T00:00:01.000Z")
            .unwrap();
        store
            .upsert_agent("agent-a", "reviewer", None, None, "2026-01-01T00:00:02.000Z")
            .unwrap();

        let agent = store.get_agent("agent-a").unwrap().unwrap();
        assert_eq!(agent.role, "reviewer");
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.branch, None);
        assert_eq!(agent.registered_at, "2026-01-01T00:00:00.000Z");
        assert_eq!(agent.last_seen_at, "2026-01-01T00:00:02.000Z");
    }

    #[test]
    fn test_list_and_fan_out_targets() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_agent("a", "worker", None, None, "2026-01-01T00:00:00.000Z").unwrap();
        store.upsert_agent("b", "worker", None, None, "2026-01-01T00:00:02.000Z").unwrap();
        store.upsert_agent("c", "worker", None, None, "2026-01-01T00:00:01.000Z").unwrap();
        store
            .set_agent_status("c", AgentStatus::Inactive, "2026-01-01T00:00:03.000Z")
            .unwrap();

        let all: Vec<String> = store.list_agents(false).unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(all, vec!["c", "b", "a"]);
        let active: Vec<String> = store.list_agents(true).unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(active, vec!["b", "a"]);

        assert_eq!(store.active_agent_ids_except("a").unwrap(), vec!["b"]);
        assert!(!store
            .set_agent_status("ghost", AgentStatus::Inactive, "2026-01-01T00:00:04.000Z")
            .unwrap());
    }
}
