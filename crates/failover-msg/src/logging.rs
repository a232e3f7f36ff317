//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Heartbeat message model and peer links."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tracing::trace;

use crate::types::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message published towards the peer.
    Outbound,
    /// Message received from a peer or the coordinator.
    Inbound,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &Message) {
    trace!(
        message_id = %message.id,
        timestamp = %message.timestamp,
        topic = %message.topic,
        sender = %message.sender,
        kind = message.kind(),
        direction = ?direction,
        "messaging activity"
    );
}
