//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Worker control service client and adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{AgentSummary, ControlCommand, ControlService, WorkerHandle, WorkerStatus};
use crate::{ControlError, Result};

const FIRST_MOCK_PID: i64 = 1000;

/// A call observed by [`MockControlService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCall {
    /// Method invoked.
    pub command: ControlCommand,
    /// Target process, absent for `list_agents`.
    pub handle: Option<WorkerHandle>,
}

#[derive(Debug, Default)]
struct MockState {
    agents: Vec<(WorkerHandle, Option<String>)>,
    statuses: HashMap<WorkerHandle, WorkerStatus>,
    calls: Vec<ControlCall>,
    failures: HashMap<ControlCommand, usize>,
    delay: Option<Duration>,
    next_pid: i64,
}

/// In-memory control service simulating a process table.
///
/// `start_agent` gives the process a fresh pid, `stop_agent` records exit code 0.
/// Clones share state, so a test can keep a handle while the runtime owns another.
#[derive(Debug, Clone)]
pub struct MockControlService {
    state: Arc<Mutex<MockState>>,
}

impl MockControlService {
    /// Empty process table.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_pid: FIRST_MOCK_PID,
                ..MockState::default()
            })),
        }
    }

    /// Builder variant of [`MockControlService::install`].
    pub fn with_agent(self, uuid: &str, identity: Option<&str>) -> Self {
        self.install(uuid, identity);
        self
    }

    /// Add a process that has never been started.
    pub fn install(&self, uuid: &str, identity: Option<&str>) {
        let mut state = self.state.lock();
        let handle = WorkerHandle::new(uuid);
        state.statuses.insert(handle.clone(), WorkerStatus::default());
        state
            .agents
            .push((handle, identity.map(|identity| identity.to_owned())));
    }

    /// Overwrite the reported status of a process.
    pub fn set_status(&self, uuid: &str, status: WorkerStatus) {
        self.state
            .lock()
            .statuses
            .insert(WorkerHandle::new(uuid), status);
    }

    /// Current status of a process, if installed.
    pub fn status_of(&self, uuid: &str) -> Option<WorkerStatus> {
        self.state
            .lock()
            .statuses
            .get(&WorkerHandle::new(uuid))
            .copied()
    }

    /// Make the next `times` calls of `command` fail with a remote error.
    pub fn fail_next(&self, command: ControlCommand, times: usize) {
        self.state.lock().failures.insert(command, times);
    }

    /// Delay every call by `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.state.lock().calls.clone()
    }

    /// Number of observed calls of `command`.
    pub fn count(&self, command: ControlCommand) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    /// Forget the observed calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    async fn enter(&self, command: ControlCommand, handle: Option<&WorkerHandle>) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(ControlCall {
                command,
                handle: handle.cloned(),
            });
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(remaining) = state.failures.get_mut(&command) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ControlError::Remote {
                    command: command.as_str(),
                    code: -32000,
                    message: "injected failure".into(),
                });
            }
        }
        if let Some(handle) = handle {
            if !state.statuses.contains_key(handle) {
                return Err(ControlError::Remote {
                    command: command.as_str(),
                    code: -32602,
                    message: format!("no agent with uuid {}", handle),
                });
            }
        }
        Ok(())
    }
}

impl Default for MockControlService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlService for MockControlService {
    async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        self.enter(ControlCommand::ListAgents, None).await?;
        let state = self.state.lock();
        Ok(state
            .agents
            .iter()
            .map(|(uuid, _)| AgentSummary {
                uuid: uuid.clone(),
                name: None,
            })
            .collect())
    }

    async fn agent_vip_identity(&self, handle: &WorkerHandle) -> Result<Option<String>> {
        self.enter(ControlCommand::AgentIdentity, Some(handle))
            .await?;
        let state = self.state.lock();
        Ok(state
            .agents
            .iter()
            .find(|(uuid, _)| uuid == handle)
            .and_then(|(_, identity)| identity.clone()))
    }

    async fn agent_status(&self, handle: &WorkerHandle) -> Result<WorkerStatus> {
        self.enter(ControlCommand::Status, Some(handle)).await?;
        let state = self.state.lock();
        Ok(state.statuses.get(handle).copied().unwrap_or_default())
    }

    async fn start_agent(&self, handle: &WorkerHandle) -> Result<()> {
        self.enter(ControlCommand::Start, Some(handle)).await?;
        let mut state = self.state.lock();
        let already_running = state
            .statuses
            .get(handle)
            .is_some_and(WorkerStatus::is_running);
        if !already_running {
            let pid = state.next_pid;
            state.next_pid += 1;
            state
                .statuses
                .insert(handle.clone(), WorkerStatus::running(pid));
        }
        Ok(())
    }

    async fn stop_agent(&self, handle: &WorkerHandle) -> Result<()> {
        self.enter(ControlCommand::Stop, Some(handle)).await?;
        let mut state = self.state.lock();
        if let Some(status) = state.statuses.get_mut(handle) {
            if status.is_running() {
                *status = WorkerStatus::exited(status.pid.unwrap_or_default(), 0);
            }
        }
        Ok(())
    }
}
