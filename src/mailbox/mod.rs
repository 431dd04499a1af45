//! Mailbox operations: send, receive, lifecycle, prune and the agent roster.
//!
//! A `Mailbox` ties together the shared store, the identity this process
//! resolved at start-up and the registered transport adapters.

pub mod lifecycle;
pub mod prune;
pub mod receive;
pub mod registry;
pub mod send;

use std::path::PathBuf;

use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::identity::Identity;
use crate::store::{InboxCounts, Store, StoreStats};
use crate::transport::{TransportKind, TransportRegistry};

pub use lifecycle::Inbox;
pub use prune::{PruneOutcome, PruneReport};
pub use receive::{PollResult, ReceiveReport};
pub use registry::Registration;
pub use send::{RelayResult, SendOutcome, SendRequest};

pub struct Mailbox {
    store: Store,
    identity: Identity,
    transports: TransportRegistry,
    default_transport: TransportKind,
}

/// Snapshot printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct MailboxStatus {
    pub agent_id: String,
    pub inbox: InboxCounts,
    pub store: StoreStats,
    pub active_agents: usize,
    pub db_path: Option<PathBuf>,
    pub db_bytes: u64,
    pub default_transport: String,
}

impl Mailbox {
    pub fn new(
        store: Store,
        identity: Identity,
        transports: TransportRegistry,
        default_transport: TransportKind,
    ) -> Self {
        Self {
            store,
            identity,
            transports,
            default_transport,
        }
    }

    /// Open the configured store and build the configured adapters.
    pub fn open(config: &Config, identity: Identity) -> Result<Self> {
        let store = Store::open(config.db_path())?;
        let transports = TransportRegistry::from_config(config);
        let default_transport = config.settings.transport_kind()?;
        Ok(Self::new(store, identity, transports, default_transport))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn default_transport(&self) -> TransportKind {
        self.default_transport
    }

    pub fn status(&self) -> Result<MailboxStatus> {
        Ok(MailboxStatus {
            agent_id: self.identity.agent_id.clone(),
            inbox: self.store.inbox_counts(&self.identity.agent_id)?,
            store: self.store.stats()?,
            active_agents: self.store.list_agents(true)?.len(),
            db_path: self.store.path().map(|p| p.to_path_buf()),
            db_bytes: self.store.file_size(),
            default_transport: self.default_transport.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for mailbox tests.

    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::{Checkpoint, Fetched, Transport, TransportError};

    /// Adapter that records sends and serves queued envelopes.
    #[derive(Default)]
    pub struct FakeTransport {
        pub name: &'static str,
        pub fail_send: bool,
        pub sent: Mutex<Vec<String>>,
        pub inbound: Mutex<Vec<Envelope>>,
        pub commits: Mutex<Vec<Checkpoint>>,
    }

    impl FakeTransport {
        pub fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        pub fn failing(name: &'static str) -> Self {
            Self {
                name,
                fail_send: true,
                ..Default::default()
            }
        }

        pub fn queue(&self, envelope: &Envelope) {
            self.inbound.lock().unwrap().push(envelope.clone());
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            self.name
        }

        fn available(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            format!("fake {}", self.name)
        }

        async fn send(&self, envelope: &str) -> crate::transport::Result<()> {
            if self.fail_send {
                return Err(TransportError::Api("boom".to_string()));
            }
            self.sent.lock().unwrap().push(envelope.to_string());
            Ok(())
        }

        async fn fetch_new(&self) -> crate::transport::Result<Fetched> {
            let envelopes = self.inbound.lock().unwrap().clone();
            Ok(Fetched {
                checkpoint: Checkpoint::Cursor(format!("after-{}", envelopes.len())),
                envelopes,
            })
        }

        async fn commit(&self, checkpoint: Checkpoint) -> crate::transport::Result<()> {
            self.commits.lock().unwrap().push(checkpoint);
            Ok(())
        }
    }

    /// In-memory mailbox for `agent_id` with the given adapters registered.
    pub fn mailbox(agent_id: &str, adapters: Vec<Arc<dyn Transport>>) -> Mailbox {
        let mut registry = TransportRegistry::new();
        registry.register(Arc::new(crate::transport::LocalTransport));
        for adapter in adapters {
            registry.register(adapter);
        }
        Mailbox::new(
            Store::open_in_memory().unwrap(),
            Identity::named(agent_id),
            registry,
            TransportKind::Local,
        )
    }
}
