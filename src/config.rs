//! Configuration loading for agent-mail.
//!
//! Settings come from `<home>/settings.json` when present, then environment
//! variables override individual fields. Every field has a default, so a
//! missing settings file is normal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::transport::TransportKind;

pub type Result<T> = std::result::Result<T, Error>;

pub const ENV_HOME: &str = "AGENT_MAIL_HOME";
pub const ENV_AGENT_ID: &str = "AGENT_MAIL_AGENT_ID";
pub const ENV_TRANSPORT: &str = "AGENT_MAIL_TRANSPORT";
pub const ENV_SIMPLEX_BIN: &str = "AGENT_MAIL_SIMPLEX_BIN";
pub const ENV_SIMPLEX_GROUP: &str = "AGENT_MAIL_SIMPLEX_GROUP";
pub const ENV_SIMPLEX_CONTACT: &str = "AGENT_MAIL_SIMPLEX_CONTACT";
pub const ENV_MATRIX_ROOM: &str = "AGENT_MAIL_MATRIX_ROOM";
pub const ENV_MATRIX_CREDENTIALS: &str = "AGENT_MAIL_MATRIX_CREDENTIALS";
pub const ENV_MEMORY_CMD: &str = "AGENT_MAIL_MEMORY_CMD";
pub const ENV_PRUNE_DAYS: &str = "AGENT_MAIL_PRUNE_DAYS";

/// Default age threshold for pruning, in days.
pub const DEFAULT_PRUNE_DAYS: u32 = 7;

/// Get the agent-mail home directory (`$AGENT_MAIL_HOME` or `~/.agent-mail`).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Some(dir) = non_empty(std::env::var(ENV_HOME).ok()) {
        return Ok(PathBuf::from(dir));
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agent-mail"))
}

/// SimpleX relay settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SimplexSettings {
    /// CLI binary name or path.
    pub binary: String,
    /// Group to post to (preferred).
    pub group: Option<String>,
    /// Direct contact fallback.
    pub contact: Option<String>,
    /// Inbound envelope files dropped by the companion bot.
    pub spool_dir: Option<PathBuf>,
}

impl Default for SimplexSettings {
    fn default() -> Self {
        Self {
            binary: "simplex-chat".to_string(),
            group: None,
            contact: None,
            spool_dir: None,
        }
    }
}

/// Matrix relay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct MatrixSettings {
    pub room_id: Option<String>,
    /// JSON file holding the homeserver URL and access token.
    pub credentials_file: Option<PathBuf>,
    /// Where the pagination cursor is kept between polls.
    pub cursor_file: Option<PathBuf>,
}

/// Settings file contents.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    pub agent_id: Option<String>,
    pub transport: String,
    pub prune_days: u32,
    pub memory_command: Option<String>,
    pub legacy_dir: Option<PathBuf>,
    pub simplex: SimplexSettings,
    pub matrix: MatrixSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_id: None,
            transport: TransportKind::Local.as_str().to_string(),
            prune_days: DEFAULT_PRUNE_DAYS,
            memory_command: None,
            legacy_dir: None,
            simplex: SimplexSettings::default(),
            matrix: MatrixSettings::default(),
        }
    }
}

impl Settings {
    /// Overlay environment variables, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(v) = get(ENV_AGENT_ID) {
            self.agent_id = Some(v);
        }
        if let Some(v) = get(ENV_TRANSPORT) {
            self.transport = v;
        }
        if let Some(v) = get(ENV_SIMPLEX_BIN) {
            self.simplex.binary = v;
        }
        if let Some(v) = get(ENV_SIMPLEX_GROUP) {
            self.simplex.group = Some(v);
        }
        if let Some(v) = get(ENV_SIMPLEX_CONTACT) {
            self.simplex.contact = Some(v);
        }
        if let Some(v) = get(ENV_MATRIX_ROOM) {
            self.matrix.room_id = Some(v);
        }
        if let Some(v) = get(ENV_MATRIX_CREDENTIALS) {
            self.matrix.credentials_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_MEMORY_CMD) {
            self.memory_command = Some(v);
        }
        if let Some(v) = get(ENV_PRUNE_DAYS) {
            self.prune_days = v.parse().map_err(|_| {
                Error::Config(format!("{} must be a number of days, got '{}'", ENV_PRUNE_DAYS, v))
            })?;
        }
        Ok(())
    }

    /// The configured default transport.
    pub fn transport_kind(&self) -> Result<TransportKind> {
        self.transport
            .parse()
            .map_err(|_| Error::Config(format!("unknown transport '{}'", self.transport)))
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    settings.transport_kind()?;
    if settings.prune_days == 0 {
        return Err(Error::Config("prune_days must be at least 1".to_string()));
    }
    if let Some(id) = settings.agent_id.as_deref() {
        if !crate::protocol::envelope::is_wire_safe(id) {
            return Err(Error::Config(format!("agent id '{}' contains '|' or a line break", id)));
        }
    }
    Ok(())
}

/// Resolved configuration: the home directory plus settings.
#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub settings: Settings,
}

impl Config {
    /// Load from the default home directory and the process environment.
    pub fn load() -> Result<Self> {
        Self::load_from(get_home_dir()?, |key| std::env::var(key).ok())
    }

    /// Load from `home`, reading overrides through `lookup`.
    pub fn load_from<F>(home: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = home.join("settings.json");
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let settings: Settings = serde_json::from_str(&content)?;
            tracing::debug!("Loaded settings from {}", path.display());
            settings
        } else {
            Settings::default()
        };

        settings.apply_env(lookup)?;
        validate_settings(&settings)?;

        Ok(Self { home, settings })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("mailbox.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.settings
            .simplex
            .spool_dir
            .clone()
            .unwrap_or_else(|| self.home.join("simplex-spool"))
    }

    pub fn matrix_credentials_file(&self) -> PathBuf {
        self.settings
            .matrix
            .credentials_file
            .clone()
            .unwrap_or_else(|| self.home.join("matrix-credentials.json"))
    }

    pub fn matrix_cursor_file(&self) -> PathBuf {
        self.settings
            .matrix
            .cursor_file
            .clone()
            .unwrap_or_else(|| self.home.join("matrix-cursor"))
    }

    pub fn legacy_dir(&self) -> PathBuf {
        self.settings
            .legacy_dir
            .clone()
            .unwrap_or_else(|| self.home.join("legacy"))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
