//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Active/standby failover coordination."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use failover_common::config::Role;
use failover_control::{ControlCommand, ControlError, ControlService, WorkerHandle, WorkerStatus};
use failover_metrics::FailoverMetrics;
use tracing::{debug, error, info, warn};

use crate::liveness::ObservedState;
use crate::policy::{ControlAction, Decision, DesiredState, FailoverPolicy, PolicyError};

/// Result of a single pulse evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Worker already matched the desired state.
    Unchanged(DesiredState),
    Started,
    Stopped,
    /// No worker handle was resolved at startup; control calls are skipped.
    Degraded(DesiredState),
    /// The selected policy does not decide.
    Unsupported(PolicyError),
    /// A control call failed. The next pulse retries from scratch.
    Failed(ControlError),
}

/// Maps liveness snapshots to worker start/stop calls for one role.
///
/// Every pulse recomputes the desired state and compares it with the live worker
/// status, so a failed or missed call is simply retried on the next pulse. The last
/// observed state only decides whether a transition is worth logging.
pub struct FailoverStateMachine {
    policy: Arc<dyn FailoverPolicy>,
    control: Arc<dyn ControlService>,
    worker: Option<WorkerHandle>,
    worker_identity: String,
    last_observed: Option<ObservedState>,
    metrics: Option<FailoverMetrics>,
}

impl FailoverStateMachine {
    pub fn new(
        policy: Arc<dyn FailoverPolicy>,
        control: Arc<dyn ControlService>,
        worker: Option<WorkerHandle>,
        worker_identity: impl Into<String>,
    ) -> Self {
        Self {
            policy,
            control,
            worker,
            worker_identity: worker_identity.into(),
            last_observed: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FailoverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn role(&self) -> Role {
        self.policy.role()
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub fn last_observed(&self) -> Option<ObservedState> {
        self.last_observed
    }

    pub async fn evaluate(&mut self, observed: ObservedState) -> CycleOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.set_liveness(observed.peer_alive, observed.coordinator_alive);
        }
        let changed = self.last_observed.replace(observed) != Some(observed);

        let desired = match self.policy.desired(observed) {
            Ok(desired) => desired,
            Err(err) => {
                if changed {
                    warn!(role = %self.role(), error = %err, "policy cannot decide; leaving worker untouched");
                }
                return CycleOutcome::Unsupported(err);
            }
        };
        if changed {
            self.announce(observed, desired);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_desired_running(desired == DesiredState::Running);
        }

        let Some(handle) = self.worker.clone() else {
            debug!(role = %self.role(), worker = %self.worker_identity, "worker handle unresolved; skipping control calls");
            return CycleOutcome::Degraded(desired);
        };

        let status = match self.control.agent_status(&handle).await {
            Ok(status) => {
                self.record(ControlCommand::Status, true);
                status
            }
            // An unknown status is not a confirmed stop.
            Err(err) if desired == DesiredState::Stopped => {
                self.record(ControlCommand::Status, false);
                warn!(role = %self.role(), worker = %self.worker_identity, error = %err, "worker status unknown; stopping anyway");
                return self.stop(&handle, None).await;
            }
            Err(err) => return self.failed(ControlCommand::Status, err),
        };

        match Decision::reconcile(desired, &status).action {
            None => CycleOutcome::Unchanged(desired),
            Some(ControlAction::Start) => self.start(&handle, &status).await,
            Some(ControlAction::Stop) => self.stop(&handle, status.pid).await,
        }
    }

    async fn start(&self, handle: &WorkerHandle, status: &WorkerStatus) -> CycleOutcome {
        info!(role = %self.role(), worker = %self.worker_identity, pid = ?status.pid, exit_code = ?status.exit_code, "starting worker");
        match self.control.start_agent(handle).await {
            Ok(()) => {
                self.record(ControlCommand::Start, true);
                CycleOutcome::Started
            }
            Err(err) => self.failed(ControlCommand::Start, err),
        }
    }

    async fn stop(&self, handle: &WorkerHandle, pid: Option<i64>) -> CycleOutcome {
        info!(role = %self.role(), worker = %self.worker_identity, ?pid, "stopping worker");
        match self.control.stop_agent(handle).await {
            Ok(()) => {
                self.record(ControlCommand::Stop, true);
                CycleOutcome::Stopped
            }
            Err(err) => self.failed(ControlCommand::Stop, err),
        }
    }

    fn failed(&self, command: ControlCommand, err: ControlError) -> CycleOutcome {
        self.record(command, false);
        error!(role = %self.role(), worker = %self.worker_identity, command = %command, error = %err, "control call failed; retrying next pulse");
        CycleOutcome::Failed(err)
    }

    fn record(&self, command: ControlCommand, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_control_call(command.as_str(), success);
        }
    }

    fn announce(&self, observed: ObservedState, desired: DesiredState) {
        let role = self.role();
        let worker = self.worker_identity.as_str();
        match (role, desired) {
            (Role::Secondary, DesiredState::Stopped) => warn!(
                %role, worker, peer_alive = observed.peer_alive, coordinator_alive = observed.coordinator_alive,
                "primary is active; stopping worker"
            ),
            (Role::Secondary, DesiredState::Running) => warn!(
                %role, worker, peer_alive = observed.peer_alive, coordinator_alive = observed.coordinator_alive,
                "primary is inactive; starting worker"
            ),
            (Role::Primary, desired) => warn!(
                %role, worker, desired = desired.as_str(), peer_alive = observed.peer_alive,
                coordinator_alive = observed.coordinator_alive, "liveness changed"
            ),
        }
    }
}
