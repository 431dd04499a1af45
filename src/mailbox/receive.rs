//! Pulling envelopes from network adapters into the local store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::Mailbox;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Message, MessageStatus};
use crate::store::format_ts;
use crate::transport::{Transport, TransportKind};

/// What happened on one adapter during a receive pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PollResult {
    /// Nothing to poll on this machine.
    Skipped,
    Polled { fetched: usize, ingested: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiveReport {
    pub transports: Vec<(String, PollResult)>,
    /// New messages stored across all adapters.
    pub ingested: usize,
}

/// Local row for an inbound envelope: unread, stamped with arrival time.
pub fn message_from_envelope(envelope: &Envelope, received_at: &str) -> Message {
    Message {
        id: envelope.id.clone(),
        from_agent: envelope.from_agent.clone(),
        to_agent: envelope.to_agent.clone(),
        message_type: envelope.message_type,
        priority: envelope.priority,
        convoy: envelope.convoy.clone(),
        payload: envelope.payload.clone(),
        status: MessageStatus::Unread,
        created_at: received_at.to_string(),
        read_at: None,
        archived_at: None,
    }
}

impl Mailbox {
    /// Store an inbound envelope unless its id is already known.
    pub fn ingest(&self, envelope: &Envelope) -> Result<bool> {
        let message = message_from_envelope(envelope, &format_ts(Utc::now()));
        self.store.ingest_message(&message)
    }

    /// Poll the selected adapters once (all network adapters by default).
    /// An adapter failure is recorded and the others still run.
    pub async fn receive(&self, selector: Option<&str>) -> Result<ReceiveReport> {
        let kind = match selector.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.parse()?,
            None => TransportKind::All,
        };

        let mut report = ReceiveReport::default();
        for adapter in self.transports.resolve(kind) {
            let name = adapter.name().to_string();
            if !adapter.can_receive() {
                tracing::debug!("Skipping receive on {}: nothing to poll", name);
                report.transports.push((name, PollResult::Skipped));
                continue;
            }

            let result = match self.poll(&adapter).await {
                Ok((fetched, ingested)) => {
                    report.ingested += ingested;
                    if ingested > 0 {
                        tracing::info!("Received {} new message(s) via {}", ingested, name);
                    }
                    PollResult::Polled { fetched, ingested }
                }
                Err(Error::Transport(e)) => {
                    tracing::warn!("Receive via {} failed: {}", name, e);
                    PollResult::Failed {
                        error: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };
            report.transports.push((name, result));
        }

        Ok(report)
    }

    /// Fetch, store the envelopes meant for us, then commit the checkpoint.
    /// The checkpoint only moves once everything is stored.
    async fn poll(&self, adapter: &Arc<dyn Transport>) -> Result<(usize, usize)> {
        let fetched = adapter.fetch_new().await?;
        let received_at = format_ts(Utc::now());
        let total = fetched.envelopes.len();

        let mut ingested = 0;
        for envelope in fetched
            .envelopes
            .iter()
            .filter(|e| e.is_for(&self.identity.agent_id))
        {
            let message = message_from_envelope(envelope, &received_at);
            if self.store.ingest_message(&message)? {
                ingested += 1;
            } else {
                tracing::debug!("Skipping duplicate {}", envelope.id);
            }
        }

        adapter.commit(fetched.checkpoint).await?;
        Ok((total, ingested))
    }

    /// Run `receive` every `interval` until interrupted.
    pub async fn watch(&self, selector: Option<&str>, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        tracing::info!(
            "Watching for messages every {}s (Ctrl-C to stop)",
            interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.receive(selector).await?;
                    if report.ingested > 0 {
                        println!("Received {} new message(s)", report.ingested);
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Stopping watch");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mailbox::testing::{mailbox, FakeTransport};
    use crate::protocol::{MessageType, Priority};
    use crate::transport::Checkpoint;

    fn envelope(id: &str, to: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            from_agent: "agent-a".to_string(),
            to_agent: to.to_string(),
            message_type: MessageType::Request,
            priority: Priority::High,
            convoy: "c-1".to_string(),
            payload: "please look".to_string(),
        }
    }

    #[tokio::test]
    async fn test_receive_filters_and_dedupes() {
        let matrix = Arc::new(FakeTransport::named("matrix"));
        matrix.queue(&envelope("msg-1", "agent-b"));
        matrix.queue(&envelope("msg-2", "all"));
        matrix.queue(&envelope("msg-3", "agent-c"));
        let mb = mailbox("agent-b", vec![matrix.clone()]);

        let report = mb.receive(None).await.unwrap();
        assert_eq!(report.ingested, 2);
        assert_eq!(
            report.transports,
            vec![(
                "matrix".to_string(),
                PollResult::Polled {
                    fetched: 3,
                    ingested: 2
                }
            )]
        );
        assert_eq!(
            matrix.commits.lock().unwrap().as_slice(),
            &[Checkpoint::Cursor("after-3".to_string())]
        );

        let stored = mb.store().get_message("msg-1").unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Unread);
        assert_eq!(stored.priority, Priority::High);
        assert!(mb.store().get_message("msg-3").unwrap().is_none());

        let again = mb.receive(Some("matrix")).await.unwrap();
        assert_eq!(again.ingested, 0);
        assert_eq!(mb.store().stats().unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_receive_local_is_a_no_op() {
        let matrix = Arc::new(FakeTransport::named("matrix"));
        matrix.queue(&envelope("msg-1", "agent-b"));
        let mb = mailbox("agent-b", vec![matrix]);

        let report = mb.receive(Some("local")).await.unwrap();
        assert!(report.transports.is_empty());
        assert!(matches!(
            mb.receive(Some("carrier-pigeon")).await,
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let mb = mailbox("agent-b", vec![]);
        assert!(mb.ingest(&envelope("msg-1", "agent-b")).unwrap());
        assert!(!mb.ingest(&envelope("msg-1", "agent-b")).unwrap());
    }
}
