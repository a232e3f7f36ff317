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
use std::time::{Duration, Instant};

use failover_common::time::Clock;
use failover_metrics::FailoverMetrics;
use failover_msg::{
    log_message, ConnectionParams, HeartbeatLink, LinkConnector, Message, MessageDirection,
    MessagingError,
};
use tracing::{debug, info, warn};

/// What happened to one outbound heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatOutcome {
    Published,
    /// Delivery failed and the link was left as is.
    Failed,
    /// Delivery failed and the link was rebuilt.
    Reconnected,
}

/// Owns the outbound heartbeat link and rebuilds it when the peer stops accepting.
///
/// A rebuild happens at most once per `timeout` window: after each rebuild the
/// publish timestamp is reset as if the new link had already delivered.
pub struct ReconnectSupervisor {
    connector: Arc<dyn LinkConnector>,
    params: ConnectionParams,
    agent_id: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    link: Option<Box<dyn HeartbeatLink>>,
    last_publish: Instant,
    metrics: Option<FailoverMetrics>,
}

impl ReconnectSupervisor {
    /// Open the initial link. A failed connect is logged and retried by later beats.
    pub async fn connect(
        connector: Arc<dyn LinkConnector>,
        params: ConnectionParams,
        agent_id: impl Into<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let link = open(connector.as_ref(), &params).await;
        if let Some(link) = &link {
            debug!(peer = %params.address, link = link.name(), connected = link.is_connected(), "heartbeat link opened");
        }
        let last_publish = clock.now();
        Self {
            connector,
            params,
            agent_id: agent_id.into(),
            timeout,
            clock,
            link,
            last_publish,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FailoverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    pub fn last_publish(&self) -> Instant {
        self.last_publish
    }

    /// Publish one heartbeat, rebuilding the link if the peer has been unreachable too long.
    pub async fn beat(&mut self) -> BeatOutcome {
        let message = Message::heartbeat(&self.agent_id);
        let result = match &self.link {
            Some(link) => {
                log_message(MessageDirection::Outbound, &message);
                link.publish(message).await
            }
            None => Err(MessagingError::Unreachable("no heartbeat link".into())),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat(result.is_ok());
        }

        match result {
            Ok(()) => {
                self.last_publish = self.clock.now();
                BeatOutcome::Published
            }
            Err(err) if err.is_delivery_failure() => {
                let now = self.clock.now();
                let silent_for = now.saturating_duration_since(self.last_publish);
                if silent_for < self.timeout {
                    debug!(peer = %self.params.address, error = %err, ?silent_for, "heartbeat not delivered");
                    return BeatOutcome::Failed;
                }
                info!(peer = %self.params.address, error = %err, ?silent_for, "rebuilding heartbeat link");
                self.rebuild().await;
                self.last_publish = now;
                BeatOutcome::Reconnected
            }
            Err(err) => {
                warn!(peer = %self.params.address, error = %err, "heartbeat publish failed");
                BeatOutcome::Failed
            }
        }
    }

    async fn rebuild(&mut self) {
        if let Some(old) = self.link.take() {
            old.close().await;
        }
        self.link = open(self.connector.as_ref(), &self.params).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_reconnect();
        }
    }

    /// Announce that this instance's heartbeat feed is going away, then close the link.
    pub async fn shutdown(mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let reset = Message::reset(&self.agent_id);
        log_message(MessageDirection::Outbound, &reset);
        if let Err(err) = link.publish(reset).await {
            debug!(peer = %self.params.address, error = %err, "reset notice not delivered");
        }
        link.close().await;
    }
}

async fn open(
    connector: &dyn LinkConnector,
    params: &ConnectionParams,
) -> Option<Box<dyn HeartbeatLink>> {
    match connector.connect(params).await {
        Ok(link) => Some(link),
        Err(err) => {
            warn!(peer = %params.address, error = %err, "unable to open heartbeat link");
            None
        }
    }
}
