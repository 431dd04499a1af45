//! Store-only transport: the message is already persisted, nothing to relay.

use async_trait::async_trait;

use super::{Result, Transport};

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn available(&self) -> bool {
        true
    }

    fn is_network(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "shared SQLite mailbox".to_string()
    }

    async fn send(&self, _envelope: &str) -> Result<()> {
        Ok(())
    }
}
