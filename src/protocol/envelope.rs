//! Single-line wire envelopes for carrying messages over plain-text chat.
//!
//! Layout: `AIMAIL:<version>|id|from|to|type|priority|convoy|<base64 payload>`.
//! Only the payload may contain arbitrary text; it is base64 encoded so that
//! line breaks, `|` and the prefix itself survive transport untouched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::types::{Message, MessageType, Priority};

/// Marker every envelope line starts with.
pub const ENVELOPE_PREFIX: &str = "AIMAIL:";

/// Current wire version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Field separator.
pub const DELIMITER: char = '|';

/// Header fields after the version: id, from, to, type, priority, convoy, payload.
const FIELD_COUNT: usize = 7;

/// The transportable part of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub convoy: String,
    pub payload: String,
}

impl Envelope {
    /// Whether this envelope should land in `agent_id`'s inbox.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.to_agent == agent_id || self.to_agent == super::types::BROADCAST_RECIPIENT
    }

    pub fn encode(&self) -> String {
        encode(self)
    }
}

impl From<&Message> for Envelope {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            from_agent: m.from_agent.clone(),
            to_agent: m.to_agent.clone(),
            message_type: m.message_type,
            priority: m.priority,
            convoy: m.convoy.clone(),
            payload: m.payload.clone(),
        }
    }
}

/// True if a scalar field can travel unescaped.
pub fn is_wire_safe(field: &str) -> bool {
    !field.contains(DELIMITER) && !field.contains(['\n', '\r'])
}

/// Cheap check for the envelope marker.
pub fn is_envelope(line: &str) -> bool {
    line.trim_start().starts_with(ENVELOPE_PREFIX)
}

/// Serialize an envelope into one line of text.
pub fn encode(envelope: &Envelope) -> String {
    format!(
        "{prefix}{version}{d}{id}{d}{from}{d}{to}{d}{kind}{d}{priority}{d}{convoy}{d}{payload}",
        prefix = ENVELOPE_PREFIX,
        version = ENVELOPE_VERSION,
        d = DELIMITER,
        id = envelope.id,
        from = envelope.from_agent,
        to = envelope.to_agent,
        kind = envelope.message_type.as_str(),
        priority = envelope.priority.as_str(),
        convoy = envelope.convoy,
        payload = STANDARD.encode(envelope.payload.as_bytes()),
    )
}

/// Parse one line back into an envelope. Anything that is not a well-formed
/// envelope of a known version yields `None`.
pub fn decode(line: &str) -> Option<Envelope> {
    let rest = line.trim().strip_prefix(ENVELOPE_PREFIX)?;
    let (version, fields) = rest.split_once(DELIMITER)?;
    if version.parse::<u32>().ok()? != ENVELOPE_VERSION {
        tracing::debug!("Ignoring envelope with unsupported version {}", version);
        return None;
    }

    let parts: Vec<&str> = fields.split(DELIMITER).collect();
    if parts.len() != FIELD_COUNT {
        return None;
    }

    let id = parts[0];
    if id.is_empty() || parts[1].is_empty() || parts[2].is_empty() {
        return None;
    }

    let message_type = parts[3].parse::<MessageType>().ok()?;
    let priority = parts[4].parse::<Priority>().ok()?;
    let payload_bytes = STANDARD.decode(parts[6]).ok()?;
    let payload = String::from_utf8(payload_bytes).ok()?;

    Some(Envelope {
        id: id.to_string(),
        from_agent: parts[1].to_string(),
        to_agent: parts[2].to_string(),
        message_type,
        priority,
        convoy: parts[5].to_string(),
        payload,
    })
}
