//! Narrow RPC interface to the agent runtime.
//!
//! The runtime is an external collaborator: the engine only knows
//! `execute`, `run_validation` and `reset_context`. Everything else about
//! how a model actually runs stays behind this trait, which also gives the
//! executor tests a seam for a scripted double.

use crate::{config::RuntimeConfig, models::ModelTier, FleetError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
pub mod mock;

/// Which runtime endpoint an attempt should land on. `Remote` is the
/// larger local-style endpoint used by phase 2 of the retry ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub task_id: String,
    pub agent_id: String,
    pub description: String,
    pub model_tier: ModelTier,
    pub use_hosted: bool,
    pub context_window: Option<u32>,
    pub language: Option<String>,
    #[serde(skip)]
    pub target: ExecutionTarget,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub credits_used: f64,
    #[serde(default)]
    pub duration_ms: u64,
    /// Step trace of what the agent did during the attempt. Persisted to
    /// the execution log and consumed by the post-hoc complexity score.
    #[serde(default)]
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_index: i64,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub action_input: Option<String>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub is_loop: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationRequest {
    pub command: String,
    pub language: Option<String>,
    #[serde(skip)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResponse {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: i32,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// One agent-facing attempt. Deadline exceeded is reported as an error;
    /// there is no mid-call cancellation, the stuck-task sweeper owns that.
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse>;

    /// Run a task's declared validation command.
    async fn run_validation(&self, request: ValidationRequest) -> Result<ValidationResponse>;

    /// Clear the runtime's in-memory context for an agent.
    async fn reset_context(&self, agent_id: &str) -> Result<()>;

    /// Whether a remote local-style endpoint is configured (phase 2).
    fn has_remote(&self) -> bool;
}

/// HTTP implementation speaking the runtime's JSON wire format.
#[derive(Debug, Clone)]
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
    remote_base_url: Option<String>,
    rpc_timeout: Duration,
}

impl HttpAgentRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            remote_base_url: config
                .remote_base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
        }
    }

    fn base_for(&self, target: ExecutionTarget) -> &str {
        match target {
            ExecutionTarget::Remote => self
                .remote_base_url
                .as_deref()
                .unwrap_or(self.base_url.as_str()),
            ExecutionTarget::Local => self.base_url.as_str(),
        }
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let url = format!("{}/execute", self.base_for(request.target));
        debug!(task_id = %request.task_id, url = %url, "dispatching execute RPC");

        let response = self
            .client
            .post(&url)
            .timeout(self.rpc_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| FleetError::AgentRpc {
                message: format!("execute RPC failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(FleetError::AgentRpc {
                message: format!("execute RPC returned {}", response.status()),
            });
        }

        response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| FleetError::AgentRpc {
                message: format!("execute RPC returned malformed body: {e}"),
            })
    }

    async fn run_validation(&self, request: ValidationRequest) -> Result<ValidationResponse> {
        let url = format!("{}/validate", self.base_url);
        let timeout = Duration::from_millis(request.timeout_ms);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| FleetError::ValidationRpc {
                message: format!("validation RPC failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(FleetError::ValidationRpc {
                message: format!("validation RPC returned {}", response.status()),
            });
        }

        response
            .json::<ValidationResponse>()
            .await
            .map_err(|e| FleetError::ValidationRpc {
                message: format!("validation RPC returned malformed body: {e}"),
            })
    }

    async fn reset_context(&self, agent_id: &str) -> Result<()> {
        let url = format!("{}/agents/{}/reset", self.base_url, agent_id);
        let response = self
            .client
            .post(&url)
            .timeout(self.rpc_timeout)
            .send()
            .await
            .map_err(|e| FleetError::AgentRpc {
                message: format!("reset RPC failed: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(FleetError::AgentRpc {
                message: format!("reset RPC returned {}", response.status()),
            });
        }
        Ok(())
    }

    fn has_remote(&self) -> bool {
        self.remote_base_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_for(server: &mockito::Server) -> HttpAgentRuntime {
        HttpAgentRuntime::new(&RuntimeConfig {
            base_url: server.url(),
            remote_base_url: None,
            rpc_timeout_ms: 2_000,
            ..RuntimeConfig::default()
        })
    }

    fn execute_request() -> ExecuteRequest {
        ExecuteRequest {
            task_id: "t1".to_string(),
            agent_id: "a1".to_string(),
            description: "add two numbers".to_string(),
            model_tier: ModelTier::Ollama,
            use_hosted: false,
            context_window: Some(16_384),
            language: Some("python".to_string()),
            target: ExecutionTarget::Local,
        }
    }

    #[tokio::test]
    async fn execute_parses_success_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/execute")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": true, "output": {"code": "def add(a,b): return a+b"}, "duration_ms": 1200}"#)
            .create_async()
            .await;

        let runtime = runtime_for(&server);
        let response = runtime.execute(execute_request()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.duration_ms, 1200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn execute_maps_http_error_to_agent_rpc() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/execute")
            .with_status(503)
            .create_async()
            .await;

        let runtime = runtime_for(&server);
        let error = runtime.execute(execute_request()).await.unwrap_err();
        assert!(matches!(error, FleetError::AgentRpc { .. }));
    }

    #[tokio::test]
    async fn validation_reports_exit_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/validate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": false, "output": "AssertionError", "exit_code": 1}"#)
            .create_async()
            .await;

        let runtime = runtime_for(&server);
        let response = runtime
            .run_validation(ValidationRequest {
                command: "python -m pytest".to_string(),
                language: Some("python".to_string()),
                timeout_ms: 2_000,
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.exit_code, 1);
    }

    #[tokio::test]
    async fn unreachable_validator_is_validation_rpc_error() {
        let runtime = HttpAgentRuntime::new(&RuntimeConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            rpc_timeout_ms: 200,
            ..RuntimeConfig::default()
        });
        let error = runtime
            .run_validation(ValidationRequest {
                command: "true".to_string(),
                language: None,
                timeout_ms: 200,
            })
            .await
            .unwrap_err();
        assert!(matches!(error, FleetError::ValidationRpc { .. }));
    }

    #[test]
    fn remote_endpoint_selection() {
        let runtime = HttpAgentRuntime::new(&RuntimeConfig {
            base_url: "http://local:1".to_string(),
            remote_base_url: Some("http://remote:2/".to_string()),
            ..RuntimeConfig::default()
        });
        assert!(runtime.has_remote());
        assert_eq!(runtime.base_for(ExecutionTarget::Local), "http://local:1");
        assert_eq!(runtime.base_for(ExecutionTarget::Remote), "http://remote:2");
    }
}
