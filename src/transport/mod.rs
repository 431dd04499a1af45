//! Transport adapters for relaying envelopes between machines.
//!
//! Every adapter is registered under its name; the sender and receiver only
//! ever talk to the `Transport` trait.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::protocol::Envelope;

pub mod local;
pub mod matrix;
pub mod simplex;

pub use local::LocalTransport;
pub use matrix::MatrixTransport;
pub use simplex::SimplexTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    NotAvailable(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport selector accepted on the command line and in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Local,
    Simplex,
    Matrix,
    /// Every configured network adapter.
    All,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Local => "local",
            TransportKind::Simplex => "simplex",
            TransportKind::Matrix => "matrix",
            TransportKind::All => "all",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(TransportKind::Local),
            "simplex" => Ok(TransportKind::Simplex),
            "matrix" => Ok(TransportKind::Matrix),
            "all" => Ok(TransportKind::All),
            other => Err(crate::error::Error::validation(format!(
                "invalid transport '{}' (expected local, simplex, matrix or all)",
                other
            ))),
        }
    }
}

/// Where a receive poll got to, handed back to `commit` once the fetched
/// envelopes are safely stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Checkpoint {
    #[default]
    None,
    /// Spool files that were read.
    Files(Vec<PathBuf>),
    /// Next pagination token.
    Cursor(String),
}

/// Result of one receive poll.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub envelopes: Vec<Envelope>,
    pub checkpoint: Checkpoint,
}

/// A delivery mechanism for encoded envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Cheap, side-effect-free check that dependencies are present.
    fn available(&self) -> bool;

    /// Whether there is anything to poll on this machine.
    fn can_receive(&self) -> bool {
        self.available()
    }

    /// False for the local store-only transport.
    fn is_network(&self) -> bool {
        true
    }

    /// Human-readable destination summary.
    fn describe(&self) -> String;

    /// Best-effort delivery of one encoded envelope line.
    async fn send(&self, envelope: &str) -> Result<()>;

    /// Pull envelopes that arrived since the last commit.
    async fn fetch_new(&self) -> Result<Fetched> {
        Ok(Fetched::default())
    }

    /// Mark a fetch as consumed.
    async fn commit(&self, _checkpoint: Checkpoint) -> Result<()> {
        Ok(())
    }
}

/// Adapters keyed by name.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    adapters: BTreeMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local, SimpleX and Matrix adapters built from configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalTransport));
        registry.register(Arc::new(SimplexTransport::from_config(config)));
        registry.register(Arc::new(MatrixTransport::from_config(config)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn Transport>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.adapters.get(name).cloned()
    }

    /// All registered adapters, in name order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.adapters.values()
    }

    /// Adapters that relay over a network.
    pub fn network(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.adapters.values().filter(|a| a.is_network())
    }

    /// Adapters a selector refers to. `local` resolves to nothing to relay.
    pub fn resolve(&self, kind: TransportKind) -> Vec<Arc<dyn Transport>> {
        match kind {
            TransportKind::Local => Vec::new(),
            TransportKind::All => self.network().cloned().collect(),
            single => self.get(single.as_str()).into_iter().collect(),
        }
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}
