//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Worker control service client and adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Client side of the control service that owns the supervised worker process.
//!
//! The failover state machine only ever talks to [`ControlService`]; the HTTP
//! adapter, the timeout wrapper, and the in-memory mock all implement it.
#![warn(missing_docs)]

pub mod client;
pub mod http;
pub mod mock;
pub mod timed;

use std::time::Duration;

/// Shared result type for control calls.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Failure of a single control call. None of these are fatal to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    /// The control service answered with an error object.
    #[error("remote error {code} calling {command}: {message}")]
    Remote {
        /// Method that failed.
        command: &'static str,
        /// Error code reported by the service.
        code: i64,
        /// Error message reported by the service.
        message: String,
    },
    /// The call did not complete within the configured bound.
    #[error("{command} timed out after {after:?}")]
    Timeout {
        /// Method that timed out.
        command: &'static str,
        /// Configured bound.
        after: Duration,
    },
    /// The request could not be delivered or the response not read.
    #[error("transport failure calling {command}: {reason}")]
    Transport {
        /// Method being called.
        command: &'static str,
        /// Underlying failure description.
        reason: String,
    },
    /// The response did not have the expected shape.
    #[error("unexpected response to {command}: {reason}")]
    Protocol {
        /// Method being called.
        command: &'static str,
        /// What was wrong with the response.
        reason: String,
    },
}

impl ControlError {
    /// Method name the failed call was addressed to.
    pub fn command(&self) -> &'static str {
        match self {
            ControlError::Remote { command, .. }
            | ControlError::Timeout { command, .. }
            | ControlError::Transport { command, .. }
            | ControlError::Protocol { command, .. } => command,
        }
    }
}

pub use client::{
    resolve_worker_handle, AgentSummary, ControlCommand, ControlService, WorkerHandle,
    WorkerStatus,
};
pub use http::HttpControlService;
pub use mock::{ControlCall, MockControlService};
pub use timed::TimedControl;
