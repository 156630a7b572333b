//! Scripted runtime double for executor and ladder tests.

use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Queue-driven [`AgentRuntime`] double. Push outcomes in the order the
/// code under test will consume them; unscripted calls fall back to a
/// generic success.
#[derive(Default)]
pub struct MockRuntime {
    pub execute_outcomes: Mutex<VecDeque<Result<ExecuteResponse>>>,
    pub validation_outcomes: Mutex<VecDeque<Result<ValidationResponse>>>,
    pub execute_calls: Mutex<Vec<ExecuteRequest>>,
    pub validation_calls: Mutex<Vec<ValidationRequest>>,
    pub reset_calls: Mutex<Vec<String>>,
    pub remote_configured: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self) -> Self {
        self.remote_configured = true;
        self
    }

    pub fn push_execute(&self, outcome: Result<ExecuteResponse>) {
        self.execute_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_validation(&self, outcome: Result<ValidationResponse>) {
        self.validation_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_validation_success(&self) {
        self.push_validation(Ok(ValidationResponse {
            success: true,
            output: "ok".to_string(),
            exit_code: 0,
        }));
    }

    pub fn push_validation_failure(&self, output: &str) {
        self.push_validation(Ok(ValidationResponse {
            success: false,
            output: output.to_string(),
            exit_code: 1,
        }));
    }

    pub fn success_response(output: serde_json::Value) -> ExecuteResponse {
        ExecuteResponse {
            success: true,
            output,
            metrics: None,
            credits_used: 0.0,
            duration_ms: 100,
            steps: Vec::new(),
        }
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        self.execute_calls.lock().unwrap().push(request);
        self.execute_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::success_response(serde_json::json!({"success": true}))))
    }

    async fn run_validation(&self, request: ValidationRequest) -> Result<ValidationResponse> {
        self.validation_calls.lock().unwrap().push(request);
        self.validation_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ValidationResponse {
                    success: true,
                    output: "ok".to_string(),
                    exit_code: 0,
                })
            })
    }

    async fn reset_context(&self, agent_id: &str) -> Result<()> {
        self.reset_calls.lock().unwrap().push(agent_id.to_string());
        Ok(())
    }

    fn has_remote(&self) -> bool {
        self.remote_configured
    }
}
