//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the failover daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use failover_common::config::{FailoverConfig, Role};
use failover_common::logging::init_tracing;
use failover_control::{HttpControlService, TimedControl};
use failover_metrics::{new_registry, spawn_http_server, FailoverMetrics};
use failover_msg::{HeartbeatListener, InMemoryBus, TcpConnector};
use failover_redundancy::{AgentSettings, FailoverAgent};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Active/standby failover daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the role derived from configuration")]
    role: Option<CliRole>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRole {
    Primary,
    Secondary,
}

impl From<CliRole> for Role {
    fn from(value: CliRole) -> Self {
        match value {
            CliRole::Primary => Role::Primary,
            CliRole::Secondary => Role::Secondary,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the failover agent")]
    Run,
    #[command(about = "Validate configuration and print the resolved role")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/failover.toml"));
    candidates.push(PathBuf::from("/etc/failover/failover.toml"));

    let loaded = FailoverConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(role) = cli.role {
        config.role = Some(role.into());
        config.validate()?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let (role, policy) = config.role_selection()?;
            println!(
                "Config: {}\nAgent: {}\nRole: {}\nPolicy: {:?}\nPeer: {} ({})\nTimeout ticks: {}",
                loaded.source.display(),
                config.agent_id,
                role,
                policy,
                config.remote_id,
                config.remote_vip,
                config.timeout_ticks()
            );
        }
        Commands::Run => {
            init_tracing("failoverd", &config.logging)?;
            info!(config_path = %loaded.source.display(), agent = %config.agent_id, "configuration loaded");
            run_daemon(config).await?;
        }
    }

    Ok(())
}

async fn run_daemon(config: FailoverConfig) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        let registry = new_registry();
        let metrics = FailoverMetrics::new(registry.clone())?;
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some((spawn_http_server(registry, config.metrics.listen)?, metrics))
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let inbound = InMemoryBus::new();
    let (listener_shutdown, _) = broadcast::channel(1);
    let listener_task = match (&config.listen_vip, &config.serverkey) {
        (Some(address), Some(serverkey)) => {
            let listener = HeartbeatListener::bind(&address.authority(), serverkey.clone(), inbound.clone())
                .await
                .with_context(|| format!("failed to bind heartbeat listener {}", address))?;
            info!(address = %address, "heartbeat listener bound");
            Some(tokio::spawn(listener.serve(listener_shutdown.subscribe())))
        }
        _ => {
            warn!("no listen_vip configured; peer heartbeats will not be received");
            None
        }
    };

    let http = HttpControlService::new(&config.control_url)
        .with_context(|| format!("invalid control_url {}", config.control_url))?;
    let control = Arc::new(TimedControl::new(http, config.control_timeout));
    let settings = AgentSettings::from_config(&config)?;
    let params = AgentSettings::connection_params(&config);

    let mut agent = FailoverAgent::new(
        settings,
        params,
        control,
        Arc::new(TcpConnector::new()),
        inbound,
    );
    if let Some((_, metrics)) = &metrics_server {
        agent = agent.with_metrics(metrics.clone());
    }
    let handle = agent.start().await;

    info!(role = %handle.role(), degraded = handle.worker().is_none(), "daemon running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await?;

    let _ = listener_shutdown.send(());
    if let Some(task) = listener_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "heartbeat listener failed"),
            Err(err) => error!(error = %err, "heartbeat listener task panicked"),
        }
    }

    if let Some((server, _)) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
