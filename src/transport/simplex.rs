//! SimpleX relay through the `simplex-chat` CLI.
//!
//! Outbound envelopes go to the configured group first and fall back to the
//! direct contact. Inbound envelopes are files dropped into a spool directory
//! by a companion bot; consumed files are moved to `processed/` and deleted
//! once they are a week old.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::process::Command;

use super::{Checkpoint, Fetched, Result, Transport, TransportError};
use crate::config::Config;
use crate::protocol::envelope::{decode, is_envelope};

/// Upper bound for one CLI invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Seconds the CLI stays connected after executing a command.
const CLI_LINGER_SECS: &str = "3";

/// Subdirectory of the spool holding consumed files.
pub const PROCESSED_DIR: &str = "processed";

/// Consumed files older than this are deleted when a receive commits.
const PROCESSED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct SimplexTransport {
    binary: String,
    group: Option<String>,
    contact: Option<String>,
    spool_dir: PathBuf,
}

impl SimplexTransport {
    pub fn new(
        binary: impl Into<String>,
        group: Option<String>,
        contact: Option<String>,
        spool_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            group,
            contact,
            spool_dir: spool_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let simplex = &config.settings.simplex;
        Self::new(
            simplex.binary.clone(),
            simplex.group.clone(),
            simplex.contact.clone(),
            config.spool_dir(),
        )
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Run one chat command such as `#group text` or `@contact text`.
    async fn run_chat_command(&self, chat_command: &str) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-e")
            .arg(chat_command)
            .arg("-t")
            .arg(CLI_LINGER_SECS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout)??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransportError::Api(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )))
        }
    }

    fn spool_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.spool_dir)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if path.is_file() && !hidden {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Delete consumed files last modified more than `older_than` ago.
    fn sweep_processed(&self, older_than: Duration) -> Result<usize> {
        let processed = self.spool_dir.join(PROCESSED_DIR);
        if !processed.is_dir() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(&processed)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > older_than) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Locate a CLI binary by explicit path or on `$PATH`.
pub fn find_binary(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}

#[async_trait]
impl Transport for SimplexTransport {
    fn name(&self) -> &str {
        "simplex"
    }

    fn available(&self) -> bool {
        find_binary(&self.binary).is_some()
    }

    fn can_receive(&self) -> bool {
        self.spool_dir.is_dir()
    }

    fn describe(&self) -> String {
        let target = match (&self.group, &self.contact) {
            (Some(g), Some(c)) => format!("group #{} (fallback @{})", g, c),
            (Some(g), None) => format!("group #{}", g),
            (None, Some(c)) => format!("contact @{}", c),
            (None, None) => "no group or contact configured".to_string(),
        };
        format!("{}; spool {}", target, self.spool_dir.display())
    }

    async fn send(&self, envelope: &str) -> Result<()> {
        if !self.available() {
            return Err(TransportError::NotAvailable(format!(
                "{} not found",
                self.binary
            )));
        }
        if self.group.is_none() && self.contact.is_none() {
            return Err(TransportError::NotConfigured(
                "set a SimpleX group or contact".to_string(),
            ));
        }

        if let Some(group) = &self.group {
            match self.run_chat_command(&format!("#{} {}", group, envelope)).await {
                Ok(()) => {
                    tracing::debug!("Relayed envelope to SimpleX group #{}", group);
                    return Ok(());
                }
                Err(e) if self.contact.is_some() => {
                    tracing::warn!("SimpleX group #{} send failed, trying contact: {}", group, e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(contact) = &self.contact {
            self.run_chat_command(&format!("@{} {}", contact, envelope))
                .await?;
            tracing::debug!("Relayed envelope to SimpleX contact @{}", contact);
        }
        Ok(())
    }

    async fn fetch_new(&self) -> Result<Fetched> {
        if !self.spool_dir.is_dir() {
            return Ok(Fetched::default());
        }

        let files = self.spool_files()?;
        let mut envelopes = Vec::new();
        for path in &files {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Skipping unreadable spool file {}: {}", path.display(), e);
                    continue;
                }
            };
            if !is_envelope(&content) {
                tracing::debug!("Spool file {} is not an envelope", path.display());
                continue;
            }
            for line in content.lines().filter(|l| is_envelope(l)) {
                match decode(line) {
                    Some(envelope) => envelopes.push(envelope),
                    None => tracing::warn!("Malformed envelope in {}", path.display()),
                }
            }
        }

        Ok(Fetched {
            envelopes,
            checkpoint: Checkpoint::Files(files),
        })
    }

    async fn commit(&self, checkpoint: Checkpoint) -> Result<()> {
        let Checkpoint::Files(files) = checkpoint else {
            return Ok(());
        };

        if !files.is_empty() {
            let processed = self.spool_dir.join(PROCESSED_DIR);
            std::fs::create_dir_all(&processed)?;
            for path in files {
                let Some(name) = path.file_name() else {
                    continue;
                };
                std::fs::rename(&path, processed.join(name))?;
            }
        }

        let swept = self.sweep_processed(PROCESSED_RETENTION)?;
        if swept > 0 {
            tracing::debug!("Removed {} old processed spool file(s)", swept);
        }
        Ok(())
    }
}
