//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Worker control service client and adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{AgentSummary, ControlCommand, ControlService, WorkerHandle, WorkerStatus};
use crate::{ControlError, Result};

/// Bounds every call of the wrapped service. An elapsed call yields [`ControlError::Timeout`].
#[derive(Debug, Clone)]
pub struct TimedControl<S> {
    inner: S,
    timeout: Duration,
}

impl<S> TimedControl<S> {
    /// Wrap `inner`, bounding each call by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Access the wrapped service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        command: ControlCommand,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout {
                command: command.as_str(),
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl<S> ControlService for TimedControl<S>
where
    S: ControlService,
{
    async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        self.bounded(ControlCommand::ListAgents, self.inner.list_agents())
            .await
    }

    async fn agent_vip_identity(&self, handle: &WorkerHandle) -> Result<Option<String>> {
        self.bounded(
            ControlCommand::AgentIdentity,
            self.inner.agent_vip_identity(handle),
        )
        .await
    }

    async fn agent_status(&self, handle: &WorkerHandle) -> Result<WorkerStatus> {
        self.bounded(ControlCommand::Status, self.inner.agent_status(handle))
            .await
    }

    async fn start_agent(&self, handle: &WorkerHandle) -> Result<()> {
        self.bounded(ControlCommand::Start, self.inner.start_agent(handle))
            .await
    }

    async fn stop_agent(&self, handle: &WorkerHandle) -> Result<()> {
        self.bounded(ControlCommand::Stop, self.inner.stop_agent(handle))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockControlService;

    #[tokio::test(start_paused = true)]
    async fn slow_call_becomes_timeout() {
        let mock = MockControlService::new().with_agent("uuid-1", Some("platform.historian"));
        mock.set_delay(Some(Duration::from_secs(30)));
        let timed = TimedControl::new(mock, Duration::from_secs(5));

        let err = timed
            .agent_status(&WorkerHandle::new("uuid-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ControlError::Timeout {
                command: "agent_status",
                after: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fast_call_passes_through() {
        let mock = MockControlService::new().with_agent("uuid-1", Some("platform.historian"));
        let timed = TimedControl::new(mock, Duration::from_secs(5));
        timed.start_agent(&WorkerHandle::new("uuid-1")).await.unwrap();
        let status = timed
            .agent_status(&WorkerHandle::new("uuid-1"))
            .await
            .unwrap();
        assert!(status.is_running());
    }
}
