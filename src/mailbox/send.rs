//! Sending: validate, persist (with broadcast fan-out), then relay.

use chrono::Utc;
use serde::Serialize;

use super::Mailbox;
use crate::error::{Error, Result};
use crate::protocol::envelope::is_wire_safe;
use crate::protocol::{
    new_message_id, Envelope, Message, MessageStatus, MessageType, Priority, BROADCAST_RECIPIENT,
    NO_CONVOY,
};
use crate::store::format_ts;
use crate::transport::TransportKind;

/// Raw send arguments as they arrive from the command line.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub to: Option<String>,
    pub message_type: Option<String>,
    pub payload: Option<String>,
    pub priority: Option<String>,
    pub convoy: Option<String>,
    pub from: Option<String>,
    pub transport: Option<String>,
}

/// Outcome of relaying through one adapter.
#[derive(Debug, Clone, Serialize)]
pub struct RelayResult {
    pub transport: String,
    pub error: Option<String>,
}

impl RelayResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    /// Ids of every stored row (one per recipient).
    pub ids: Vec<String>,
    pub relays: Vec<RelayResult>,
}

#[derive(Debug)]
struct ValidSend {
    to: String,
    from: String,
    message_type: MessageType,
    priority: Priority,
    convoy: String,
    payload: String,
    transport: TransportKind,
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("--{} is required", name)))
}

fn wire_safe(value: &str, name: &str) -> Result<()> {
    if is_wire_safe(value) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{} must not contain '|' or line breaks",
            name
        )))
    }
}

impl SendRequest {
    fn validate(self, sender: &str, default_transport: TransportKind) -> Result<ValidSend> {
        let to = required(self.to, "to")?.trim().to_string();
        let message_type: MessageType = required(self.message_type, "type")?.trim().parse()?;
        let payload = self
            .payload
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::validation("--payload is required"))?;

        let priority = match self.priority.as_deref().map(str::trim) {
            None | Some("") => Priority::default(),
            Some(p) => p.parse()?,
        };
        let convoy = self
            .convoy
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| NO_CONVOY.to_string());
        let from = self
            .from
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| sender.to_string());
        let transport = match self.transport.as_deref().map(str::trim) {
            None | Some("") => default_transport,
            Some(t) => t.parse()?,
        };

        wire_safe(&to, "to")?;
        wire_safe(&from, "from")?;
        wire_safe(&convoy, "convoy")?;

        Ok(ValidSend {
            to,
            from,
            message_type,
            priority,
            convoy,
            payload,
            transport,
        })
    }
}

impl ValidSend {
    fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_RECIPIENT || self.message_type == MessageType::Broadcast
    }

    fn message_to(&self, to: &str, created_at: &str) -> Message {
        Message {
            id: new_message_id(),
            from_agent: self.from.clone(),
            to_agent: to.to_string(),
            message_type: self.message_type,
            priority: self.priority,
            convoy: self.convoy.clone(),
            payload: self.payload.clone(),
            status: MessageStatus::Unread,
            created_at: created_at.to_string(),
            read_at: None,
            archived_at: None,
        }
    }
}

impl Mailbox {
    /// Store a message (one row per recipient for broadcasts) and relay it.
    /// Relay failures are reported in the outcome, never as an error.
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome> {
        let send = request.validate(&self.identity.agent_id, self.default_transport)?;
        let now = format_ts(Utc::now());

        let messages: Vec<Message> = if send.is_broadcast() {
            let recipients = self.store.active_agent_ids_except(&send.from)?;
            if recipients.is_empty() {
                tracing::info!("No other active agents; storing broadcast for 'all'");
                vec![send.message_to(BROADCAST_RECIPIENT, &now)]
            } else {
                recipients
                    .iter()
                    .map(|agent| send.message_to(agent, &now))
                    .collect()
            }
        } else {
            vec![send.message_to(&send.to, &now)]
        };

        self.store.insert_messages(&messages)?;
        tracing::info!(
            "Stored {} {} message(s) from {} (priority {})",
            messages.len(),
            send.message_type,
            send.from,
            send.priority
        );

        // Broadcast relays go out once, addressed to everyone, reusing the
        // first stored id so an echo back into this store is deduplicated.
        let mut envelope = Envelope::from(&messages[0]);
        if send.is_broadcast() {
            envelope.to_agent = BROADCAST_RECIPIENT.to_string();
        }
        let relays = self.relay(send.transport, &envelope).await;

        Ok(SendOutcome {
            ids: messages.into_iter().map(|m| m.id).collect(),
            relays,
        })
    }

    /// Push one envelope through every adapter `kind` resolves to. Each
    /// adapter is attempted independently.
    pub async fn relay(&self, kind: TransportKind, envelope: &Envelope) -> Vec<RelayResult> {
        let line = envelope.encode();
        let mut results = Vec::new();

        for adapter in self.transports.resolve(kind) {
            let name = adapter.name().to_string();
            let error = if !adapter.available() {
                Some(format!("{} transport not available", name))
            } else {
                match adapter.send(&line).await {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                }
            };

            match &error {
                None => tracing::info!("Relayed {} via {}", envelope.id, name),
                Some(e) => tracing::warn!("Relay of {} via {} failed: {}", envelope.id, name, e),
            }
            results.push(RelayResult {
                transport: name,
                error,
            });
        }

        results
    }
}
