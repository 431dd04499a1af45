//! Hand-off to the external memory service.
//!
//! Before old messages are pruned, notable payloads are passed to a memory
//! recorder. Recording is best effort: callers log failures and carry on.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

const RECORD_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can be asked to remember a piece of text.
#[async_trait]
pub trait MemoryRecorder: Send + Sync {
    async fn remember(&self, text: &str, tags: &[String]) -> Result<()>;
}

/// Recorder used when no memory command is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl MemoryRecorder for NoopRecorder {
    async fn remember(&self, _text: &str, _tags: &[String]) -> Result<()> {
        tracing::debug!("No memory command configured; skipping capture");
        Ok(())
    }
}

/// Runs `<program> [args...] store --content <text> --tags <a,b>`.
#[derive(Debug, Clone)]
pub struct CommandRecorder {
    program: String,
    args: Vec<String>,
}

impl CommandRecorder {
    /// Build from a whitespace-separated command line.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl MemoryRecorder for CommandRecorder {
    async fn remember(&self, text: &str, tags: &[String]) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("store")
            .arg("--content")
            .arg(text)
            .arg("--tags")
            .arg(tags.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(RECORD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Other(format!("{} timed out", self.program)))??;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Recorder that keeps everything in memory (tests, dry runs).
#[derive(Debug, Default, Clone)]
pub struct CollectingRecorder {
    entries: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl CollectingRecorder {
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MemoryRecorder for CollectingRecorder {
    async fn remember(&self, text: &str, tags: &[String]) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Other("memory recorder poisoned".to_string()))?
            .push((text.to_string(), tags.to_vec()));
        Ok(())
    }
}

/// Pick the recorder for a configured command line.
pub fn recorder_for(command_line: Option<&str>) -> Arc<dyn MemoryRecorder> {
    match command_line.and_then(CommandRecorder::parse) {
        Some(recorder) => Arc::new(recorder),
        None => Arc::new(NoopRecorder),
    }
}
