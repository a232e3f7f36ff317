//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Active/standby failover coordination."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use failover_msg::{heartbeat_topic, Message, MessagePayload};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Lowest value a countdown decays to. Anything at or below zero is dead.
const COUNTDOWN_FLOOR: i64 = -1;

/// Which heartbeat feed a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSource {
    Peer,
    Coordinator,
}

/// Boolean liveness view handed to the state machine once per pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObservedState {
    pub peer_alive: bool,
    pub coordinator_alive: bool,
}

impl ObservedState {
    pub fn new(peer_alive: bool, coordinator_alive: bool) -> Self {
        Self {
            peer_alive,
            coordinator_alive,
        }
    }
}

/// Raw countdown values, in pulse ticks remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Countdowns {
    pub peer: i64,
    pub coordinator: i64,
}

impl Countdowns {
    fn observed(&self) -> ObservedState {
        ObservedState::new(self.peer > 0, self.coordinator > 0)
    }
}

/// Decaying liveness counters for the peer and the coordinator.
///
/// Heartbeats reset a counter to the configured number of ticks and every pulse
/// decrements both. The inbound handler and the pulse task share one instance,
/// so all reads and writes go through a single lock.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout_ticks: i64,
    peer_topic: String,
    coordinator_topic: String,
    counters: Mutex<Countdowns>,
}

impl LivenessTracker {
    pub fn new(remote_id: &str, coordinator_id: &str, timeout_ticks: i64) -> Self {
        Self {
            timeout_ticks: timeout_ticks.max(1),
            peer_topic: heartbeat_topic(remote_id),
            coordinator_topic: heartbeat_topic(coordinator_id),
            counters: Mutex::new(Countdowns::default()),
        }
    }

    pub fn timeout_ticks(&self) -> i64 {
        self.timeout_ticks
    }

    /// Map a topic onto a heartbeat feed by prefix. Unknown topics yield `None`.
    pub fn classify(&self, topic: &str) -> Option<HeartbeatSource> {
        if topic.starts_with(&self.coordinator_topic) {
            Some(HeartbeatSource::Coordinator)
        } else if topic.starts_with(&self.peer_topic) {
            Some(HeartbeatSource::Peer)
        } else {
            None
        }
    }

    pub fn on_peer_heartbeat(&self) {
        self.counters.lock().peer = self.timeout_ticks;
    }

    pub fn on_coordinator_heartbeat(&self) {
        self.counters.lock().coordinator = self.timeout_ticks;
    }

    pub fn on_heartbeat(&self, source: HeartbeatSource) {
        match source {
            HeartbeatSource::Peer => self.on_peer_heartbeat(),
            HeartbeatSource::Coordinator => self.on_coordinator_heartbeat(),
        }
    }

    /// Feed an inbound message. Only heartbeat payloads on a tracked topic count.
    pub fn observe(&self, message: &Message) -> Option<HeartbeatSource> {
        let source = self.classify(&message.topic);
        match (source, message.payload) {
            (Some(source), MessagePayload::Heartbeat) => {
                self.on_heartbeat(source);
                trace!(topic = %message.topic, ?source, "heartbeat refreshed");
                Some(source)
            }
            (Some(source), MessagePayload::Reset) => {
                debug!(topic = %message.topic, sender = %message.sender, ?source, "heartbeat feed reset by sender");
                None
            }
            (None, _) => {
                trace!(topic = %message.topic, "ignoring untracked topic");
                None
            }
        }
    }

    /// Take the liveness snapshot for this pulse, then decay both counters.
    pub fn tick(&self) -> ObservedState {
        let mut counters = self.counters.lock();
        let observed = counters.observed();
        counters.peer = (counters.peer - 1).max(COUNTDOWN_FLOOR);
        counters.coordinator = (counters.coordinator - 1).max(COUNTDOWN_FLOOR);
        observed
    }

    /// Current liveness without decaying.
    pub fn snapshot(&self) -> ObservedState {
        self.counters.lock().observed()
    }

    pub fn countdowns(&self) -> Countdowns {
        *self.counters.lock()
    }
}
