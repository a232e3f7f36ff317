//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Heartbeat message model and peer links."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Messaging channel used by failover instances to exchange heartbeats.
#![warn(missing_docs)]

pub mod logging;
pub mod tcp;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by links, connectors, and listeners.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The peer or the link to it cannot currently be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// The link was closed locally.
    #[error("link closed")]
    Closed,
    /// The remote side rejected or failed the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// An inbound frame exceeded the size limit before its terminating newline.
    #[error("frame exceeds {0} bytes")]
    FrameTooLong(usize),
    /// Wrapper for IO errors encountered during messaging operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MessagingError {
    /// Whether the error means the message did not reach the peer.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            MessagingError::Unreachable(_) | MessagingError::Closed | MessagingError::Io(_)
        )
    }
}

pub use logging::{log_message, MessageDirection};
pub use tcp::{
    handshake_tag, serve_heartbeats, Frame, HeartbeatListener, TcpConnector, TcpLink,
    MAX_FRAME_BYTES,
};
pub use transport::{
    ConnectionParams, HeartbeatLink, InMemoryBus, InMemoryConnector, InMemoryLink, LinkConnector,
};
pub use types::{heartbeat_topic, Message, MessagePayload, HEARTBEAT_PREFIX};
