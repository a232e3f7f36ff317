//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the failover runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

/// Length in bytes of a decoded server key.
pub const SERVER_KEY_LEN: usize = 32;

const SIMPLE_PREFIX: &str = "simple_";

/// Identity whose `heartbeat/<id>` topic counts as the coordinator signal.
pub const DEFAULT_COORDINATOR_ID: &str = "VolttronCentralAgent";

fn default_coordinator_id() -> String {
    DEFAULT_COORDINATOR_ID.to_owned()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_control_url() -> String {
    "http://127.0.0.1:8720/control".to_owned()
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_file_logging() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Static configuration of one failover instance.
///
/// Keys without a `serde(default)` are required; a missing key aborts startup.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Identity this instance publishes heartbeats under.
    pub agent_id: String,
    /// Identity of the peer instance whose heartbeats we track.
    pub remote_id: String,
    /// Address of the peer instance (`tcp://host:port`).
    #[serde_as(as = "DisplayFromStr")]
    pub remote_vip: PeerAddress,
    /// Key the peer instance expects connecting clients to hold.
    #[serde_as(as = "DisplayFromStr")]
    pub remote_serverkey: ServerKey,
    /// Routing identity of the supervised worker process.
    pub agent_vip_identity: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_period: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub policy: Option<PolicyKind>,
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,
    #[serde(rename = "tick_interval_ms", default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_control_url")]
    pub control_url: String,
    #[serde(rename = "control_timeout_ms", default = "default_control_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub control_timeout: Duration,
    /// Local address accepting heartbeat connections from peer and coordinator.
    #[serde(default)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub listen_vip: Option<PeerAddress>,
    /// Key inbound clients must prove knowledge of.
    #[serde(default)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub serverkey: Option<ServerKey>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`FailoverConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedFailoverConfig {
    pub config: FailoverConfig,
    pub source: PathBuf,
}

impl FailoverConfig {
    pub const ENV_CONFIG_PATH: &str = "FAILOVER_CONFIG";

    /// Load configuration from disk, respecting the `FAILOVER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedFailoverConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedFailoverConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedFailoverConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a configuration file. Files ending in `.json` are read as JSON, all others as TOML.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str::<FailoverConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            toml::from_str::<FailoverConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("agent_id", &self.agent_id),
            ("remote_id", &self.remote_id),
            ("agent_vip_identity", &self.agent_vip_identity),
            ("coordinator_id", &self.coordinator_id),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("configuration key '{}' must not be empty", key));
            }
        }
        if self.agent_id == self.remote_id {
            return Err(anyhow!(
                "agent_id and remote_id must differ (both are '{}')",
                self.agent_id
            ));
        }
        if self.heartbeat_period.is_zero() {
            return Err(anyhow!("heartbeat_period must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be greater than zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick_interval_ms must be greater than zero"));
        }
        if self.control_timeout.is_zero() {
            return Err(anyhow!("control_timeout_ms must be greater than zero"));
        }
        Url::parse(&self.control_url)
            .with_context(|| format!("invalid control_url '{}'", self.control_url))?;
        if self.listen_vip.is_some() && self.serverkey.is_none() {
            return Err(anyhow!("listen_vip requires a serverkey"));
        }
        self.role_selection()?;
        Ok(())
    }

    /// Resolve the role and policy of this instance.
    ///
    /// Explicit `role`/`policy` keys take precedence; otherwise both are derived from
    /// an `agent_id` of the form `[simple_]primary` or `[simple_]secondary`.
    pub fn role_selection(&self) -> Result<(Role, PolicyKind)> {
        let (derived_role, derived_policy) = match self.agent_id.strip_prefix(SIMPLE_PREFIX) {
            Some(rest) => (rest.parse::<Role>().ok(), Some(PolicyKind::Simple)),
            None => match self.agent_id.parse::<Role>() {
                Ok(role) => (Some(role), Some(PolicyKind::Coordinated)),
                Err(_) => (None, None),
            },
        };
        let role = self.role.or(derived_role).ok_or_else(|| {
            anyhow!(
                "unable to determine role: set 'role' or use an agent_id like 'simple_primary' (got '{}')",
                self.agent_id
            )
        })?;
        let policy = self
            .policy
            .or(derived_policy)
            .unwrap_or(PolicyKind::Simple);
        Ok((role, policy))
    }

    /// Number of pulse ticks a heartbeat keeps its source alive.
    pub fn timeout_ticks(&self) -> i64 {
        let tick = self.tick_interval.as_millis().max(1);
        let ticks = self.timeout.as_millis().div_ceil(tick);
        i64::try_from(ticks).unwrap_or(i64::MAX).max(1)
    }
}

impl FromStr for FailoverConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: FailoverConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Role of an instance within the failover pair. Fixed for the process lifetime.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Role::Primary),
            "secondary" => Ok(Role::Secondary),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Decision policy family used by the state machine.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Heartbeat-only policy: primary always runs, secondary runs while the primary is silent.
    #[default]
    Simple,
    /// Coordinator-aware policy. Selecting it leaves the worker untouched.
    Coordinated,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(PolicyKind::Simple),
            "coordinated" => Ok(PolicyKind::Coordinated),
            other => Err(format!("unknown policy: {}", other)),
        }
    }
}

/// Network address of a failover instance, written as `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by socket APIs.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.authority())
    }
}

impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim()).with_context(|| format!("invalid address '{}'", s))?;
        if url.scheme() != "tcp" {
            return Err(anyhow!(
                "address '{}' must use the tcp:// scheme (got '{}')",
                s,
                url.scheme()
            ));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("address '{}' is missing a host", s))?;
        let port = url
            .port()
            .ok_or_else(|| anyhow!("address '{}' is missing a port", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }
}

/// Shared secret identifying an instance, stored as base64 text in configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerKey {
    encoded: String,
    bytes: Vec<u8>,
}

impl ServerKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerKey(<redacted>)")
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for ServerKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let encoded = s.trim();
        let bytes = [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD]
            .iter()
            .find_map(|engine| engine.decode(encoded).ok())
            .ok_or_else(|| anyhow!("server key is not valid base64"))?;
        if bytes.len() != SERVER_KEY_LEN {
            return Err(anyhow!(
                "server key must decode to {} bytes (got {})",
                SERVER_KEY_LEN,
                bytes.len()
            ));
        }
        Ok(Self {
            encoded: encoded.to_owned(),
            bytes,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_file_logging")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: default_file_logging(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_KEY: &str = "L_wdBjh--Lt6NDErbGw_aRVQaEUIw85-44iTdaGNb6A";

    fn sample(agent_id: &str, extra: &str) -> String {
        format!(
            r#"
agent_id = "{agent_id}"
remote_id = "other"
remote_vip = "tcp://10.0.0.2:22916"
remote_serverkey = "{PEER_KEY}"
agent_vip_identity = "platform.historian"
heartbeat_period = 5
timeout = 3
{extra}
"#
        )
    }

    #[test]
    fn parses_required_keys_and_defaults() {
        let config: FailoverConfig = sample("simple_primary", "").parse().unwrap();
        assert_eq!(config.remote_vip.host(), "10.0.0.2");
        assert_eq!(config.remote_vip.port(), 22916);
        assert_eq!(config.heartbeat_period, Duration::from_secs(5));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.coordinator_id, "VolttronCentralAgent");
        assert_eq!(config.remote_serverkey.as_bytes().len(), SERVER_KEY_LEN);
        assert_eq!(config.timeout_ticks(), 3);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let content = sample("simple_primary", "").replace("timeout = 3", "");
        let err = content.parse::<FailoverConfig>().unwrap_err();
        assert!(format!("{:#}", err).contains("timeout"));
    }

    #[test]
    fn role_and_policy_derive_from_agent_id() {
        let simple: FailoverConfig = sample("simple_secondary", "").parse().unwrap();
        assert_eq!(
            simple.role_selection().unwrap(),
            (Role::Secondary, PolicyKind::Simple)
        );

        let coordinated: FailoverConfig = sample("primary", "").parse().unwrap();
        assert_eq!(
            coordinated.role_selection().unwrap(),
            (Role::Primary, PolicyKind::Coordinated)
        );
    }

    #[test]
    fn explicit_role_overrides_agent_id() {
        let config: FailoverConfig = sample("site-b", "role = \"secondary\"").parse().unwrap();
        assert_eq!(
            config.role_selection().unwrap(),
            (Role::Secondary, PolicyKind::Simple)
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(sample("site-b", "").parse::<FailoverConfig>().is_err());
    }

    #[test]
    fn invalid_addresses_and_keys_are_rejected() {
        let bad_vip = sample("simple_primary", "").replace("tcp://10.0.0.2:22916", "10.0.0.2");
        assert!(bad_vip.parse::<FailoverConfig>().is_err());

        let no_port = sample("simple_primary", "").replace(":22916", "");
        assert!(no_port.parse::<FailoverConfig>().is_err());

        let short_key = sample("simple_primary", "").replace(PEER_KEY, "LXEWQrcmsEQBYnyp+6wy9Q==");
        assert!(short_key.parse::<FailoverConfig>().is_err());
    }

    #[test]
    fn listener_requires_serverkey() {
        let content = sample("simple_primary", "listen_vip = \"tcp://0.0.0.0:22916\"");
        assert!(content.parse::<FailoverConfig>().is_err());
    }

    #[test]
    fn timeout_ticks_round_up() {
        let config: FailoverConfig = sample("simple_primary", "tick_interval_ms = 400")
            .parse()
            .unwrap();
        assert_eq!(config.timeout_ticks(), 8);
    }

    #[test]
    fn server_key_debug_is_redacted() {
        let key: ServerKey = PEER_KEY.parse().unwrap();
        assert_eq!(format!("{:?}", key), "ServerKey(<redacted>)");
        assert_eq!(key.to_string(), PEER_KEY);
    }

    #[test]
    fn peer_address_round_trips_through_display() {
        let address: PeerAddress = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.authority(), "[::1]:9000");
        assert_eq!(address.to_string(), "tcp://[::1]:9000");
    }
}
