//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Heartbeat message model and peer links."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use failover_common::config::{PeerAddress, ServerKey};
use tokio::sync::broadcast;

use crate::{Message, MessagingError, Result};

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Everything needed to open an outbound link to a peer instance.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Address of the remote instance.
    pub address: PeerAddress,
    /// Identity presented to the remote instance.
    pub identity: String,
    /// Key the remote instance authenticates connecting clients with.
    pub serverkey: ServerKey,
}

/// Outbound publish channel towards a peer instance.
#[async_trait]
pub trait HeartbeatLink: Send + Sync {
    /// Publish a message. Delivery failures surface as [`MessagingError::Unreachable`].
    async fn publish(&self, message: Message) -> Result<()>;
    /// Whether the link believes it is currently connected.
    fn is_connected(&self) -> bool;
    /// Tear the link down. Further publishes fail.
    async fn close(&self);
    /// Human-readable link name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Factory for outbound links, used again whenever a link has to be rebuilt.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Open a new link with the supplied parameters.
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HeartbeatLink>>;
}

/// In-process publish/subscribe bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<Message>,
}

impl InMemoryBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus retaining up to `capacity` undelivered messages per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber, returning how many received it.
    pub fn publish(&self, message: Message) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Subscribe to every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Connector producing links that deliver straight into a target bus.
///
/// Reachability can be toggled to simulate a broken network path.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    target: InMemoryBus,
    reachable: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl InMemoryConnector {
    /// Create a connector delivering into `target`.
    pub fn new(target: InMemoryBus) -> Self {
        Self {
            target,
            reachable: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every link produced by this connector reachable or unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of links opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkConnector for InMemoryConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn HeartbeatLink>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(peer = %params.address, identity = %params.identity, "opening in-memory link");
        Ok(Box::new(InMemoryLink {
            target: self.target.clone(),
            reachable: self.reachable.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Link produced by [`InMemoryConnector`].
#[derive(Debug)]
pub struct InMemoryLink {
    target: InMemoryBus,
    reachable: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl HeartbeatLink for InMemoryLink {
    async fn publish(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(MessagingError::Unreachable("in-memory peer offline".into()));
        }
        self.target.publish(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.reachable.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
