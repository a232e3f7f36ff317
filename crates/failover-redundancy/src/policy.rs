//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Active/standby failover coordination."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use failover_common::config::{PolicyKind, Role};
use failover_control::WorkerStatus;

use crate::liveness::ObservedState;

/// State the local worker should be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Stopped => "stopped",
        }
    }
}

/// Control call needed to move the worker to its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
}

/// Outcome of one transition: where the worker should be and what to call, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub desired: DesiredState,
    pub action: Option<ControlAction>,
}

impl Decision {
    /// Compare the desired state with the reported worker status.
    ///
    /// At most one action is ever produced, so a cycle never both starts and stops.
    pub fn reconcile(desired: DesiredState, status: &WorkerStatus) -> Self {
        let action = match (desired, status.is_running()) {
            (DesiredState::Running, false) => Some(ControlAction::Start),
            (DesiredState::Stopped, true) => Some(ControlAction::Stop),
            _ => None,
        };
        Self { desired, action }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("{kind:?} policy is not supported for the {role} role")]
    Unsupported { role: Role, kind: PolicyKind },
}

/// Role-specific transition from observed liveness to the desired worker state.
pub trait FailoverPolicy: Send + Sync + fmt::Debug {
    fn role(&self) -> Role;
    fn kind(&self) -> PolicyKind;
    fn desired(&self, observed: ObservedState) -> Result<DesiredState, PolicyError>;
}

/// Primary under the heartbeat-only policy: always keeps its worker running.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimplePrimaryPolicy;

impl FailoverPolicy for SimplePrimaryPolicy {
    fn role(&self) -> Role {
        Role::Primary
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Simple
    }

    fn desired(&self, _observed: ObservedState) -> Result<DesiredState, PolicyError> {
        Ok(DesiredState::Running)
    }
}

/// Secondary under the heartbeat-only policy: runs only while the primary is silent.
///
/// Coordinator liveness is tracked but not consulted.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleSecondaryPolicy;

impl FailoverPolicy for SimpleSecondaryPolicy {
    fn role(&self) -> Role {
        Role::Secondary
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Simple
    }

    fn desired(&self, observed: ObservedState) -> Result<DesiredState, PolicyError> {
        if observed.peer_alive {
            Ok(DesiredState::Stopped)
        } else {
            Ok(DesiredState::Running)
        }
    }
}

/// Coordinator-aware policy placeholder. Never decides, so the worker is left alone.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatedPolicy {
    role: Role,
}

impl CoordinatedPolicy {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl FailoverPolicy for CoordinatedPolicy {
    fn role(&self) -> Role {
        self.role
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Coordinated
    }

    fn desired(&self, _observed: ObservedState) -> Result<DesiredState, PolicyError> {
        Err(PolicyError::Unsupported {
            role: self.role,
            kind: PolicyKind::Coordinated,
        })
    }
}

pub fn policy_for(role: Role, kind: PolicyKind) -> Arc<dyn FailoverPolicy> {
    match (role, kind) {
        (Role::Primary, PolicyKind::Simple) => Arc::new(SimplePrimaryPolicy),
        (Role::Secondary, PolicyKind::Simple) => Arc::new(SimpleSecondaryPolicy),
        (role, PolicyKind::Coordinated) => Arc::new(CoordinatedPolicy::new(role)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ObservedState; 4] = [
        ObservedState {
            peer_alive: false,
            coordinator_alive: false,
        },
        ObservedState {
            peer_alive: false,
            coordinator_alive: true,
        },
        ObservedState {
            peer_alive: true,
            coordinator_alive: false,
        },
        ObservedState {
            peer_alive: true,
            coordinator_alive: true,
        },
    ];

    #[test]
    fn secondary_stands_down_whenever_peer_is_alive() {
        let policy = policy_for(Role::Secondary, PolicyKind::Simple);
        for observed in ALL_STATES {
            let desired = policy.desired(observed).unwrap();
            if observed.peer_alive {
                assert_eq!(desired, DesiredState::Stopped, "{observed:?}");
            } else {
                assert_eq!(desired, DesiredState::Running, "{observed:?}");
            }
        }
    }

    #[test]
    fn simple_primary_always_wants_to_run() {
        let policy = policy_for(Role::Primary, PolicyKind::Simple);
        for observed in ALL_STATES {
            assert_eq!(policy.desired(observed).unwrap(), DesiredState::Running);
        }
    }

    #[test]
    fn coordinated_policy_is_unsupported_for_both_roles() {
        for role in [Role::Primary, Role::Secondary] {
            let policy = policy_for(role, PolicyKind::Coordinated);
            assert_eq!(policy.role(), role);
            let err = policy.desired(ObservedState::default()).unwrap_err();
            assert_eq!(
                err,
                PolicyError::Unsupported {
                    role,
                    kind: PolicyKind::Coordinated
                }
            );
        }
    }

    #[test]
    fn reconcile_produces_at_most_one_action() {
        let stopped = WorkerStatus::default();
        let running = WorkerStatus::running(123);
        let exited = WorkerStatus::exited(123, 1);

        assert_eq!(
            Decision::reconcile(DesiredState::Running, &stopped).action,
            Some(ControlAction::Start)
        );
        assert_eq!(
            Decision::reconcile(DesiredState::Running, &exited).action,
            Some(ControlAction::Start)
        );
        assert_eq!(Decision::reconcile(DesiredState::Running, &running).action, None);
        assert_eq!(
            Decision::reconcile(DesiredState::Stopped, &running).action,
            Some(ControlAction::Stop)
        );
        assert_eq!(Decision::reconcile(DesiredState::Stopped, &exited).action, None);
    }
}
