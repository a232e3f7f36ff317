//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Worker control service client and adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::client::{AgentSummary, ControlCommand, ControlService, WorkerHandle, WorkerStatus};
use crate::{ControlError, Result};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP client for the control endpoint.
#[derive(Debug)]
pub struct HttpControlService {
    client: reqwest::Client,
    endpoint: Url,
    next_id: AtomicU64,
}

impl HttpControlService {
    /// Build a client posting to `endpoint`.
    pub fn new(endpoint: &str) -> std::result::Result<Self, url::ParseError> {
        Ok(Self::with_client(reqwest::Client::new(), Url::parse(endpoint)?))
    }

    /// Build a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
        }
    }

    /// Endpoint requests are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, command: ControlCommand, params: Value) -> Result<T> {
        let method = command.as_str();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, endpoint = %self.endpoint, "control call");

        let transport = |err: reqwest::Error| ControlError::Transport {
            command: method,
            reason: err.to_string(),
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        let decoded: RpcResponse = response.json().await.map_err(|err| ControlError::Protocol {
            command: method,
            reason: err.to_string(),
        })?;

        if let Some(error) = decoded.error {
            return Err(ControlError::Remote {
                command: method,
                code: error.code,
                message: error.message,
            });
        }
        let result = decoded.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|err| ControlError::Protocol {
            command: method,
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl ControlService for HttpControlService {
    async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        self.call(ControlCommand::ListAgents, json!([])).await
    }

    async fn agent_vip_identity(&self, handle: &WorkerHandle) -> Result<Option<String>> {
        self.call(ControlCommand::AgentIdentity, json!([handle.as_str()]))
            .await
    }

    async fn agent_status(&self, handle: &WorkerHandle) -> Result<WorkerStatus> {
        self.call(ControlCommand::Status, json!([handle.as_str()]))
            .await
    }

    async fn start_agent(&self, handle: &WorkerHandle) -> Result<()> {
        let _: Value = self
            .call(ControlCommand::Start, json!([handle.as_str()]))
            .await?;
        Ok(())
    }

    async fn stop_agent(&self, handle: &WorkerHandle) -> Result<()> {
        let _: Value = self
            .call(ControlCommand::Stop, json!([handle.as_str()]))
            .await?;
        Ok(())
    }
}
