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
use std::time::Duration;

use anyhow::{Context, Result};
use failover_common::config::{FailoverConfig, PolicyKind, Role};
use failover_common::time::{Clock, SystemClock};
use failover_control::{resolve_worker_handle, ControlService, WorkerHandle};
use failover_metrics::FailoverMetrics;
use failover_msg::{
    log_message, ConnectionParams, InMemoryBus, LinkConnector, Message, MessageDirection,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::liveness::{LivenessTracker, ObservedState};
use crate::policy::policy_for;
use crate::reconnect::{BeatOutcome, ReconnectSupervisor};
use crate::state_machine::{CycleOutcome, FailoverStateMachine};

/// Static runtime parameters of one failover instance.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_id: String,
    pub remote_id: String,
    pub coordinator_id: String,
    /// Routing identity of the supervised worker.
    pub worker_identity: String,
    pub role: Role,
    pub policy: PolicyKind,
    pub heartbeat_period: Duration,
    pub tick_interval: Duration,
    pub timeout: Duration,
    pub timeout_ticks: i64,
}

impl AgentSettings {
    pub fn from_config(config: &FailoverConfig) -> Result<Self> {
        let (role, policy) = config.role_selection()?;
        Ok(Self {
            agent_id: config.agent_id.clone(),
            remote_id: config.remote_id.clone(),
            coordinator_id: config.coordinator_id.clone(),
            worker_identity: config.agent_vip_identity.clone(),
            role,
            policy,
            heartbeat_period: config.heartbeat_period,
            tick_interval: config.tick_interval,
            timeout: config.timeout,
            timeout_ticks: config.timeout_ticks(),
        })
    }

    /// Parameters for the outbound heartbeat link towards the configured peer.
    pub fn connection_params(config: &FailoverConfig) -> ConnectionParams {
        ConnectionParams {
            address: config.remote_vip.clone(),
            identity: config.agent_id.clone(),
            serverkey: config.remote_serverkey.clone(),
        }
    }
}

/// Failover instance ready to be started.
pub struct FailoverAgent {
    settings: AgentSettings,
    params: ConnectionParams,
    control: Arc<dyn ControlService>,
    connector: Arc<dyn LinkConnector>,
    inbound: InMemoryBus,
    clock: Arc<dyn Clock>,
    metrics: Option<FailoverMetrics>,
}

impl FailoverAgent {
    /// `inbound` is the local bus peer and coordinator heartbeats arrive on.
    pub fn new(
        settings: AgentSettings,
        params: ConnectionParams,
        control: Arc<dyn ControlService>,
        connector: Arc<dyn LinkConnector>,
        inbound: InMemoryBus,
    ) -> Self {
        Self {
            settings,
            params,
            control,
            connector,
            inbound,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: FailoverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve the worker, open the heartbeat link, and spawn the periodic tasks.
    pub async fn start(self) -> FailoverHandle {
        let settings = self.settings;
        let worker = resolve_worker(self.control.as_ref(), &settings.worker_identity).await;

        let tracker = Arc::new(LivenessTracker::new(
            &settings.remote_id,
            &settings.coordinator_id,
            settings.timeout_ticks,
        ));
        let mut state_machine = FailoverStateMachine::new(
            policy_for(settings.role, settings.policy),
            self.control,
            worker.clone(),
            settings.worker_identity.clone(),
        );
        let mut reconnect = ReconnectSupervisor::connect(
            self.connector,
            self.params,
            settings.agent_id.clone(),
            settings.timeout,
            self.clock,
        )
        .await;
        if let Some(metrics) = self.metrics {
            state_machine = state_machine.with_metrics(metrics.clone());
            reconnect = reconnect.with_metrics(metrics);
        }

        let (shutdown, _) = broadcast::channel(4);
        // Subscribe before spawning so nothing published during startup is missed.
        let inbox = self.inbound.subscribe();
        let inbound_task = spawn_inbound_task(
            settings.agent_id.clone(),
            tracker.clone(),
            inbox,
            shutdown.subscribe(),
        );
        let pulse_task = spawn_pulse_task(
            settings.agent_id.clone(),
            settings.tick_interval,
            tracker.clone(),
            state_machine,
            shutdown.subscribe(),
        );
        let heartbeat_task = spawn_heartbeat_task(
            settings.agent_id.clone(),
            settings.heartbeat_period,
            reconnect,
            shutdown.subscribe(),
        );

        info!(
            agent = %settings.agent_id,
            role = %settings.role,
            policy = ?settings.policy,
            peer = %settings.remote_id,
            timeout_ticks = settings.timeout_ticks,
            "failover agent started"
        );

        FailoverHandle {
            settings,
            worker,
            tracker,
            shutdown,
            pulse_task,
            heartbeat_task,
            inbound_task,
        }
    }
}

async fn resolve_worker(control: &dyn ControlService, identity: &str) -> Option<WorkerHandle> {
    match resolve_worker_handle(control, identity).await {
        Ok(Some(handle)) => {
            info!(worker = identity, uuid = %handle, "resolved worker handle");
            Some(handle)
        }
        Ok(None) => {
            error!(worker = identity, "worker is not installed; control calls disabled");
            None
        }
        Err(err) => {
            error!(worker = identity, error = %err, "unable to list installed workers; control calls disabled");
            None
        }
    }
}

fn spawn_inbound_task(
    agent_id: String,
    tracker: Arc<LivenessTracker>,
    mut inbox: broadcast::Receiver<Message>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(agent = %agent_id, "inbound handler shutdown received");
                    break;
                }
                received = inbox.recv() => {
                    match received {
                        Ok(message) => {
                            log_message(MessageDirection::Inbound, &message);
                            tracker.observe(&message);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(agent = %agent_id, skipped, "inbound handler lagged behind the bus");
                        }
                        Err(RecvError::Closed) => {
                            debug!(agent = %agent_id, "inbound bus closed");
                            break;
                        }
                    }
                }
            }
        }
    })
}

fn spawn_pulse_task(
    agent_id: String,
    tick_interval: Duration,
    tracker: Arc<LivenessTracker>,
    mut state_machine: FailoverStateMachine,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First pulse one interval after start so an already-running peer can be heard.
        let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pulses: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(agent = %agent_id, pulses, "pulse shutdown received");
                    break;
                }
                _ = ticker.tick() => {
                    pulses += 1;
                    let observed: ObservedState = tracker.tick();
                    match state_machine.evaluate(observed).await {
                        CycleOutcome::Started | CycleOutcome::Stopped => {
                            debug!(agent = %agent_id, pulse = pulses, ?observed, "worker control enacted");
                        }
                        outcome => {
                            debug!(agent = %agent_id, pulse = pulses, ?observed, ?outcome, "pulse evaluated");
                        }
                    }
                }
            }
        }
    })
}

fn spawn_heartbeat_task(
    agent_id: String,
    heartbeat_period: Duration,
    mut reconnect: ReconnectSupervisor,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<ReconnectSupervisor> {
    tokio::spawn(async move {
        let mut ticker = interval(heartbeat_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(agent = %agent_id, "heartbeat shutdown received");
                    break;
                }
                _ = ticker.tick() => {
                    if reconnect.beat().await == BeatOutcome::Reconnected {
                        info!(agent = %agent_id, connected = reconnect.is_connected(), "heartbeat link rebuilt");
                    }
                }
            }
        }
        reconnect
    })
}

/// Running failover instance.
pub struct FailoverHandle {
    settings: AgentSettings,
    worker: Option<WorkerHandle>,
    tracker: Arc<LivenessTracker>,
    shutdown: broadcast::Sender<()>,
    pulse_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<ReconnectSupervisor>,
    inbound_task: JoinHandle<()>,
}

impl FailoverHandle {
    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn role(&self) -> Role {
        self.settings.role
    }

    /// Worker handle resolved at startup, `None` when running degraded.
    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub fn tracker(&self) -> Arc<LivenessTracker> {
        self.tracker.clone()
    }

    pub fn observed(&self) -> ObservedState {
        self.tracker.snapshot()
    }

    /// Stop the periodic tasks, then publish a final reset notice and close the link.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.pulse_task.await.context("pulse task panicked")?;
        self.inbound_task.await.context("inbound task panicked")?;
        let reconnect = self
            .heartbeat_task
            .await
            .context("heartbeat task panicked")?;
        reconnect.shutdown().await;
        info!(agent = %self.settings.agent_id, role = %self.settings.role, "failover agent stopped");
        Ok(())
    }
}
