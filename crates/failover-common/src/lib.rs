//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the failover runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the failover coordinator workspace.
//! This crate exposes configuration loading, logging setup, and the clock
//! abstraction consumed by the redundancy runtime.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    FailoverConfig, LoadedFailoverConfig, LoggingConfig, MetricsConfig, PeerAddress, PolicyKind,
    Role, ServerKey,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, ManualClock, SystemClock};
