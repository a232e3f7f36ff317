//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Heartbeat message model and peer links."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic prefix shared by every heartbeat feed.
pub const HEARTBEAT_PREFIX: &str = "heartbeat/";

/// Topic an instance with the given identity publishes its heartbeat on.
pub fn heartbeat_topic(identity: &str) -> String {
    format!("{}{}", HEARTBEAT_PREFIX, identity)
}

/// Payload carried on a heartbeat topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Periodic liveness signal. Carries no data.
    Heartbeat,
    /// Final notice that the sender's heartbeat feed is going away.
    Reset,
}

/// Message envelope exchanged between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for tracing.
    pub id: Uuid,
    /// Topic the message was published on.
    pub topic: String,
    /// Identity of the publishing instance.
    pub sender: String,
    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Actual payload carried by the message.
    #[serde(default = "default_payload")]
    pub payload: MessagePayload,
}

fn default_payload() -> MessagePayload {
    MessagePayload::Heartbeat
}

impl Message {
    /// Construct a message on an arbitrary topic.
    pub fn new(topic: impl Into<String>, sender: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Heartbeat published by `identity` on its own heartbeat topic.
    pub fn heartbeat(identity: &str) -> Self {
        Self::new(heartbeat_topic(identity), identity, MessagePayload::Heartbeat)
    }

    /// Reset notice published by `identity` when it shuts down.
    pub fn reset(identity: &str) -> Self {
        Self::new(heartbeat_topic(identity), identity, MessagePayload::Reset)
    }

    /// Convenience accessor returning the payload kind as a static string.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            MessagePayload::Heartbeat => "heartbeat",
            MessagePayload::Reset => "reset",
        }
    }

    /// Whether the message was published on a heartbeat topic.
    pub fn is_heartbeat_topic(&self) -> bool {
        self.topic.starts_with(HEARTBEAT_PREFIX)
    }
}
