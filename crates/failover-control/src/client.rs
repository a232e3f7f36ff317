//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Worker control service client and adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Opaque id of the supervised worker as known to the control service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle(String);

impl WorkerHandle {
    /// Wrap a raw id returned by the control service.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the control service's process listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Id used to address the process in every other call.
    pub uuid: WorkerHandle,
    /// Installed package name, when reported.
    #[serde(default)]
    pub name: Option<String>,
}

/// Process status as reported by the control service: `(pid, exit code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "(Option<i64>, Option<i64>)", into = "(Option<i64>, Option<i64>)")]
pub struct WorkerStatus {
    /// Process id, absent when the worker was never started.
    pub pid: Option<i64>,
    /// Exit code, present once the process has terminated.
    pub exit_code: Option<i64>,
}

impl WorkerStatus {
    /// Status of a live process.
    pub fn running(pid: i64) -> Self {
        Self {
            pid: Some(pid),
            exit_code: None,
        }
    }

    /// Status of a process that has exited with `exit_code`.
    pub fn exited(pid: i64, exit_code: i64) -> Self {
        Self {
            pid: Some(pid),
            exit_code: Some(exit_code),
        }
    }

    /// A live process has a positive pid and no exit code.
    pub fn is_running(&self) -> bool {
        self.pid.is_some_and(|pid| pid > 0) && self.exit_code.is_none()
    }
}

impl From<(Option<i64>, Option<i64>)> for WorkerStatus {
    fn from((pid, exit_code): (Option<i64>, Option<i64>)) -> Self {
        Self { pid, exit_code }
    }
}

impl From<WorkerStatus> for (Option<i64>, Option<i64>) {
    fn from(status: WorkerStatus) -> Self {
        (status.pid, status.exit_code)
    }
}

/// Methods exposed by the control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// `list_agents`
    ListAgents,
    /// `agent_vip_identity`
    AgentIdentity,
    /// `agent_status`
    Status,
    /// `start_agent`
    Start,
    /// `stop_agent`
    Stop,
}

impl ControlCommand {
    /// Wire method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::ListAgents => "list_agents",
            ControlCommand::AgentIdentity => "agent_vip_identity",
            ControlCommand::Status => "agent_status",
            ControlCommand::Start => "start_agent",
            ControlCommand::Stop => "stop_agent",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote control surface for the supervised worker process.
///
/// Every call may fail; callers treat a failure as "not enacted yet".
#[async_trait]
pub trait ControlService: Send + Sync {
    /// List installed processes.
    async fn list_agents(&self) -> Result<Vec<AgentSummary>>;
    /// Routing identity of a process, if it has one.
    async fn agent_vip_identity(&self, handle: &WorkerHandle) -> Result<Option<String>>;
    /// Current process status.
    async fn agent_status(&self, handle: &WorkerHandle) -> Result<WorkerStatus>;
    /// Start the process.
    async fn start_agent(&self, handle: &WorkerHandle) -> Result<()>;
    /// Stop the process.
    async fn stop_agent(&self, handle: &WorkerHandle) -> Result<()>;
}

#[async_trait]
impl<S> ControlService for Arc<S>
where
    S: ControlService + ?Sized,
{
    async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        (**self).list_agents().await
    }

    async fn agent_vip_identity(&self, handle: &WorkerHandle) -> Result<Option<String>> {
        (**self).agent_vip_identity(handle).await
    }

    async fn agent_status(&self, handle: &WorkerHandle) -> Result<WorkerStatus> {
        (**self).agent_status(handle).await
    }

    async fn start_agent(&self, handle: &WorkerHandle) -> Result<()> {
        (**self).start_agent(handle).await
    }

    async fn stop_agent(&self, handle: &WorkerHandle) -> Result<()> {
        (**self).stop_agent(handle).await
    }
}

/// Find the process whose routing identity equals `identity`.
///
/// The listing is walked in order and the last match wins. Identity lookups that fail
/// for individual entries are logged and skipped; only a failed listing is an error.
pub async fn resolve_worker_handle<S>(service: &S, identity: &str) -> Result<Option<WorkerHandle>>
where
    S: ControlService + ?Sized,
{
    let agents = service.list_agents().await?;
    let mut resolved = None;
    for agent in agents {
        match service.agent_vip_identity(&agent.uuid).await {
            Ok(Some(candidate)) if candidate == identity => {
                debug!(uuid = %agent.uuid, identity, "matched worker identity");
                resolved = Some(agent.uuid);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(uuid = %agent.uuid, error = %err, "unable to read identity of installed agent");
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_requires_positive_pid_and_no_exit_code() {
        assert!(WorkerStatus::running(123).is_running());
        assert!(!WorkerStatus::exited(123, 0).is_running());
        assert!(!WorkerStatus::from((Some(0), None)).is_running());
        assert!(!WorkerStatus::default().is_running());
    }

    #[test]
    fn status_decodes_from_pair() {
        let status: WorkerStatus = serde_json::from_str("[4242, null]").unwrap();
        assert_eq!(status, WorkerStatus::running(4242));
        let never: WorkerStatus = serde_json::from_str("[null, null]").unwrap();
        assert_eq!(never, WorkerStatus::default());
    }

    #[test]
    fn agent_summary_tolerates_extra_fields() {
        let summary: AgentSummary =
            serde_json::from_str(r#"{"uuid":"abc","name":"historian-1.0","priority":"50"}"#)
                .unwrap();
        assert_eq!(summary.uuid.as_str(), "abc");
        assert_eq!(summary.name.as_deref(), Some("historian-1.0"));
    }
}
