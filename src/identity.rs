//! Local agent identity, resolved once per process.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;

/// Branch names that say nothing about which agent is running.
const GENERIC_BRANCHES: [&str; 3] = ["HEAD", "main", "master"];

/// Who this process is, plus where it runs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub agent_id: String,
    pub branch: Option<String>,
    pub worktree: Option<String>,
}

impl Identity {
    /// Resolve from an explicit id, else the git branch, else the working
    /// directory name, else the process id.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let cwd = std::env::current_dir().ok();
        let branch = cwd.as_deref().and_then(current_branch);
        let worktree = cwd.as_deref().map(|p| p.display().to_string());
        let agent_id = derive_agent_id(explicit, branch.as_deref(), cwd.as_deref());

        tracing::debug!("Resolved agent identity '{}'", agent_id);
        Self {
            agent_id,
            branch,
            worktree,
        }
    }

    /// Fixed identity (tests and explicit callers).
    pub fn named(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            branch: None,
            worktree: None,
        }
    }
}

fn derive_agent_id(explicit: Option<&str>, branch: Option<&str>, cwd: Option<&Path>) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }

    if let Some(branch) = branch.filter(|b| !GENERIC_BRANCHES.contains(b)) {
        let id = sanitize(branch);
        if !id.is_empty() {
            return id;
        }
    }

    if let Some(name) = cwd.and_then(Path::file_name).and_then(|n| n.to_str()) {
        let id = sanitize(name);
        if !id.is_empty() {
            return id;
        }
    }

    format!("agent-{}", std::process::id())
}

/// Lowercase and collapse anything outside `[a-z0-9]` into single dashes.
pub fn sanitize(raw: &str) -> String {
    static NON_ID: OnceLock<Regex> = OnceLock::new();
    let re = NON_ID.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));
    re.replace_all(&raw.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Current git branch of `dir`, if it is inside a repository.
pub fn current_branch(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}
