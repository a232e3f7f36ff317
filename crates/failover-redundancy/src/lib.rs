//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Active/standby failover coordination."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Failover runtime for a primary/secondary pair of instances.
//!
//! Inbound heartbeats feed the [`LivenessTracker`], a pulse tick hands its
//! snapshot to the [`FailoverStateMachine`], and the [`ReconnectSupervisor`]
//! keeps this instance's own heartbeat flowing towards the peer.

mod agent;
mod liveness;
mod policy;
mod reconnect;
mod state_machine;

pub use agent::{AgentSettings, FailoverAgent, FailoverHandle};
pub use liveness::{Countdowns, HeartbeatSource, LivenessTracker, ObservedState};
pub use policy::{
    policy_for, ControlAction, CoordinatedPolicy, Decision, DesiredState, FailoverPolicy,
    PolicyError, SimplePrimaryPolicy, SimpleSecondaryPolicy,
};
pub use reconnect::{BeatOutcome, ReconnectSupervisor};
pub use state_machine::{CycleOutcome, FailoverStateMachine};
