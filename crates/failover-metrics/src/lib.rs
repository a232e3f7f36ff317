//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use prometheus;

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the failover agent.
#[derive(Clone, Debug)]
pub struct FailoverMetrics {
    registry: SharedRegistry,
    control_calls: IntCounterVec,
    heartbeats_published: IntCounterVec,
    reconnects: IntCounter,
    liveness: IntGaugeVec,
    worker_desired_running: IntGauge,
}

impl FailoverMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let control_calls = IntCounterVec::new(
            Opts::new(
                "failover_control_calls_total",
                "Control service calls issued by the failover state machine",
            ),
            &["command", "outcome"],
        )?;
        registry.register(Box::new(control_calls.clone()))?;

        let heartbeats_published = IntCounterVec::new(
            Opts::new(
                "failover_heartbeats_published_total",
                "Outbound heartbeat publish attempts",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(heartbeats_published.clone()))?;

        let reconnects = IntCounter::with_opts(Opts::new(
            "failover_reconnects_total",
            "Times the outbound heartbeat connection was rebuilt",
        ))?;
        registry.register(Box::new(reconnects.clone()))?;

        let liveness = IntGaugeVec::new(
            Opts::new(
                "failover_liveness",
                "Whether the peer or coordinator is currently considered alive",
            ),
            &["source"],
        )?;
        registry.register(Box::new(liveness.clone()))?;

        let worker_desired_running = IntGauge::with_opts(Opts::new(
            "failover_worker_desired_running",
            "Whether the local worker should be running (1) or stopped (0)",
        ))?;
        registry.register(Box::new(worker_desired_running.clone()))?;

        Ok(Self {
            registry,
            control_calls,
            heartbeats_published,
            reconnects,
            liveness,
            worker_desired_running,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_control_call(&self, command: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        self.control_calls
            .with_label_values(&[command, outcome])
            .inc();
    }

    pub fn record_heartbeat(&self, delivered: bool) {
        let outcome = if delivered { "delivered" } else { "failed" };
        self.heartbeats_published.with_label_values(&[outcome]).inc();
    }

    pub fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    pub fn set_liveness(&self, peer_alive: bool, coordinator_alive: bool) {
        self.liveness
            .with_label_values(&["peer"])
            .set(i64::from(peer_alive));
        self.liveness
            .with_label_values(&["coordinator"])
            .set(i64::from(coordinator_alive));
    }

    pub fn set_desired_running(&self, running: bool) {
        self.worker_desired_running.set(i64::from(running));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, name: &str, label: (&str, &str)) -> Option<f64> {
        registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)?
            .get_metric()
            .iter()
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == label.0 && pair.get_value() == label.1)
            })
            .map(|metric| metric.get_counter().get_value())
    }

    #[test]
    fn failover_metrics_register_and_record() {
        let registry = new_registry();
        let metrics = FailoverMetrics::new(registry.clone()).unwrap();
        metrics.record_control_call("start_agent", true);
        metrics.record_control_call("start_agent", false);
        metrics.record_heartbeat(false);
        metrics.record_reconnect();
        metrics.set_liveness(true, false);
        metrics.set_desired_running(true);

        assert_eq!(
            counter_value(&registry, "failover_heartbeats_published_total", ("outcome", "failed")),
            Some(1.0)
        );
        assert_eq!(
            counter_value(&registry, "failover_control_calls_total", ("outcome", "error")),
            Some(1.0)
        );
        assert_eq!(metrics.reconnects.get(), 1);
        assert_eq!(metrics.worker_desired_running.get(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        FailoverMetrics::new(registry.clone()).unwrap();
        assert!(FailoverMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let metrics = FailoverMetrics::new(registry.clone()).unwrap();
        metrics.record_reconnect();

        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        let url = format!("http://{}/metrics", server.addr());
        let response = reqwest::get(url).await.unwrap();
        assert!(response.status().is_success());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        assert_eq!(content_type.as_deref(), Some(prometheus::TEXT_FORMAT));
        let body = response.text().await.unwrap();
        assert!(body.contains("failover_reconnects_total 1"));
        server.shutdown().await.unwrap();
    }
}
