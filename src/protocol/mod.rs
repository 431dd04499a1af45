//! Mailbox protocol: the stored data model and the wire envelope.
//!
//! - Typed messages (task_dispatch, status_report, discovery, request, broadcast)
//! - Priority and forward-only lifecycle status
//! - Agent roster entries
//! - A one-line envelope codec for plain-text chat transports

pub mod envelope;
pub mod types;

pub use envelope::{decode, encode, is_envelope, Envelope, ENVELOPE_PREFIX};
pub use types::{
    new_message_id, Agent, AgentStatus, Message, MessageStatus, MessageType, Priority,
    BROADCAST_RECIPIENT, NO_CONVOY,
};
