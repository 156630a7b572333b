//! Auto-retry ladder: local -> remote -> paid fallback.
//!
//! Runs before a completion is finalized, only for tasks that declare a
//! validation command. Each phase re-reads the task's output file (a retry
//! may have overwritten it) and retries with a description enriched by the
//! current validation error. A hard cap bounds total retries across phases
//! regardless of per-phase budgets.

use crate::{
    config::RetryConfig,
    constants,
    events::{EventBridge, EventKind},
    models::{Agent, ModelTier, Task},
    router::ComplexityRouter,
    runtime::{AgentRuntime, ExecuteRequest, ExecuteResponse, ExecutionTarget, ValidationRequest},
    workspace::WorkspaceStore,
};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LadderOutcome {
    pub validated: bool,
    pub phase: Option<String>,
    pub attempts: u32,
    pub final_error: Option<String>,
    #[serde(skip)]
    pub final_response: Option<ExecuteResponse>,
}

struct PhaseSpec {
    name: &'static str,
    budget: u32,
    tier: ModelTier,
    target: ExecutionTarget,
    use_hosted: bool,
}

pub struct RetryLadder<'a> {
    pub runtime: &'a dyn AgentRuntime,
    pub events: &'a EventBridge,
    pub workspace: &'a WorkspaceStore,
    pub config: &'a RetryConfig,
}

impl RetryLadder<'_> {
    /// Validate the current state of the task's code, treating a dead
    /// validator the same as a failing validation.
    async fn validate(&self, task: &Task, command: &str) -> (bool, String) {
        let request = ValidationRequest {
            command: command.to_string(),
            language: task.language.clone(),
            timeout_ms: self.config.validation_timeout_ms,
        };
        match self.runtime.run_validation(request).await {
            Ok(response) => (response.success, response.output),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "validator unavailable, counting as failure");
                (false, e.to_string())
            }
        }
    }

    /// Current on-disk output for enrichment, falling back to the last
    /// in-memory response when no file exists yet.
    async fn read_current_code(&self, task: &Task, fallback: &ExecuteResponse) -> String {
        let path = self
            .workspace
            .base_dir()
            .join(WorkspaceStore::output_file_name(task));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => fallback.output.to_string(),
        }
    }

    fn enriched_description(task: &Task, code_dump: &str, validation_error: &str) -> String {
        format!(
            "{}\n\n--- Previous attempt produced ---\n{}\n\n--- Validation failed with ---\n{}\n\n\
             Fix the code so the validation command passes without changing its intent.",
            task.description, code_dump, validation_error
        )
    }

    fn phases(&self) -> Vec<PhaseSpec> {
        vec![
            PhaseSpec {
                name: "phase1",
                budget: self.config.max_ollama_retries,
                tier: ModelTier::Ollama,
                target: ExecutionTarget::Local,
                use_hosted: false,
            },
            PhaseSpec {
                name: "phase2",
                budget: if self.runtime.has_remote() {
                    self.config.max_remote_retries
                } else {
                    0
                },
                tier: ModelTier::Ollama,
                target: ExecutionTarget::Remote,
                use_hosted: false,
            },
            PhaseSpec {
                name: "phase3",
                budget: self.config.max_haiku_retries,
                tier: ModelTier::Haiku,
                target: ExecutionTarget::Local,
                use_hosted: true,
            },
        ]
    }

    /// Drive the full ladder for one completion. `initial_response` is the
    /// attempt that just finished and is about to be declared successful.
    pub async fn run(
        &self,
        task: &Task,
        agent: &Agent,
        initial_response: &ExecuteResponse,
    ) -> LadderOutcome {
        let Some(command) = task.validation_command.as_deref() else {
            return LadderOutcome {
                validated: true,
                phase: None,
                attempts: 0,
                final_error: None,
                final_response: None,
            };
        };

        let complexity = task
            .complexity
            .unwrap_or_else(|| ComplexityRouter::heuristic_complexity(task).0);
        let context_window = if complexity >= constants::DEFAULT_COMPLEXITY_THRESHOLD {
            constants::LOCAL_CONTEXT_LARGE
        } else {
            constants::LOCAL_CONTEXT_DEFAULT
        };

        // Phase 0: the happy path is just a passing validation.
        let (passed, mut current_error) = self.validate(task, command).await;
        self.events.emit(
            EventKind::AutoRetryValidation,
            serde_json::json!({
                "task_id": task.id,
                "phase": "phase0",
                "success": passed,
            }),
        );
        if passed {
            return LadderOutcome {
                validated: true,
                phase: Some("phase0".to_string()),
                attempts: 0,
                final_error: None,
                final_response: None,
            };
        }

        let mut attempts: u32 = 0;
        let mut last_response = initial_response.clone();

        for phase in self.phases() {
            if phase.budget == 0 {
                continue;
            }
            // Each retry may have rewritten the file; re-read before
            // building the next enrichment.
            let code_dump = self.read_current_code(task, &last_response).await;

            for _ in 0..phase.budget {
                if attempts >= self.config.max_total_retries {
                    debug!(task_id = %task.id, attempts, "retry hard cap reached");
                    break;
                }
                attempts += 1;
                self.events.emit(
                    EventKind::AutoRetryAttempt,
                    serde_json::json!({
                        "task_id": task.id,
                        "phase": phase.name,
                        "attempt": attempts,
                        "tier": phase.tier,
                    }),
                );

                let request = ExecuteRequest {
                    task_id: task.id.clone(),
                    agent_id: agent.id.clone(),
                    description: Self::enriched_description(task, &code_dump, &current_error),
                    model_tier: phase.tier,
                    use_hosted: phase.use_hosted,
                    context_window: (phase.tier == ModelTier::Ollama).then_some(context_window),
                    language: task.language.clone(),
                    target: phase.target,
                };

                match self.runtime.execute(request).await {
                    Ok(response) => {
                        last_response = response;
                        let (passed, error) = self.validate(task, command).await;
                        self.events.emit(
                            EventKind::AutoRetryValidation,
                            serde_json::json!({
                                "task_id": task.id,
                                "phase": phase.name,
                                "success": passed,
                            }),
                        );
                        if passed {
                            info!(
                                task_id = %task.id,
                                phase = phase.name,
                                attempts,
                                "retry ladder validated"
                            );
                            let outcome = LadderOutcome {
                                validated: true,
                                phase: Some(phase.name.to_string()),
                                attempts,
                                final_error: None,
                                final_response: Some(last_response.clone()),
                            };
                            self.emit_result(task, &outcome);
                            return outcome;
                        }
                        current_error = error;
                    }
                    Err(e) => {
                        // Retry-level execution failures stay inside the
                        // ladder; the next attempt or phase gets its shot.
                        warn!(task_id = %task.id, phase = phase.name, error = %e, "retry execution failed");
                        current_error = e.to_string();
                    }
                }
            }
            if attempts >= self.config.max_total_retries {
                break;
            }
        }

        let outcome = LadderOutcome {
            validated: false,
            phase: None,
            attempts,
            final_error: Some(current_error),
            final_response: Some(last_response),
        };
        self.emit_result(task, &outcome);
        outcome
    }

    fn emit_result(&self, task: &Task, outcome: &LadderOutcome) {
        self.events.emit(
            EventKind::AutoRetryResult,
            serde_json::json!({
                "task_id": task.id,
                "validated": outcome.validated,
                "phase": outcome.phase,
                "attempts": outcome.attempts,
                "final_error": outcome.final_error,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, TaskType};
    use crate::runtime::mock::MockRuntime;

    fn task_with_validation() -> Task {
        Task::new("t", "do the thing", TaskType::Code)
            .with_validation_command("python -m pytest")
    }

    fn fixture(config: RetryConfig) -> (MockRuntime, EventBridge, tempfile::TempDir, RetryConfig) {
        (
            MockRuntime::new(),
            EventBridge::new(None),
            tempfile::tempdir().unwrap(),
            config,
        )
    }

    #[tokio::test]
    async fn phase0_pass_returns_without_retries() {
        let (runtime, events, dir, config) = fixture(RetryConfig::default());
        runtime.push_validation_success();
        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };

        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;

        assert!(outcome.validated);
        assert_eq!(outcome.phase.as_deref(), Some("phase0"));
        assert_eq!(outcome.attempts, 0);
        assert!(runtime.execute_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalates_to_hosted_phase() {
        // Scenario S3: fails phase 0 and the single phase-1 retry, no remote
        // endpoint, succeeds on the hosted-cheap phase.
        let config = RetryConfig {
            max_ollama_retries: 1,
            max_remote_retries: 0,
            max_haiku_retries: 1,
            max_total_retries: 3,
            ..RetryConfig::default()
        };
        let (runtime, events, dir, config) = fixture(config);
        runtime.push_validation_failure("AssertionError: add(2,3) == 4"); // phase 0
        runtime.push_validation_failure("AssertionError: add(2,3) == 4"); // after phase 1 retry
        runtime.push_validation_success(); // after phase 3 retry

        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };

        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;

        assert!(outcome.validated);
        assert_eq!(outcome.phase.as_deref(), Some("phase3"));
        assert_eq!(outcome.attempts, 2);

        let calls = runtime.execute_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model_tier, ModelTier::Ollama);
        assert!(!calls[0].use_hosted);
        assert_eq!(calls[1].model_tier, ModelTier::Haiku);
        assert!(calls[1].use_hosted);
        // Retry descriptions carry the validation error forward.
        assert!(calls[0].description.contains("AssertionError"));
    }

    #[tokio::test]
    async fn hard_cap_bounds_total_retries() {
        let config = RetryConfig {
            max_ollama_retries: 5,
            max_remote_retries: 5,
            max_haiku_retries: 5,
            max_total_retries: 3,
            ..RetryConfig::default()
        };
        let (runtime, events, dir, config) = fixture(config);
        // Every validation fails.
        for _ in 0..16 {
            runtime.push_validation_failure("still broken");
        }

        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };

        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;

        assert!(!outcome.validated);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.final_error.as_deref(), Some("still broken"));
        assert_eq!(runtime.execute_calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn remote_phase_runs_only_when_configured() {
        let config = RetryConfig {
            max_ollama_retries: 0,
            max_remote_retries: 1,
            max_haiku_retries: 0,
            max_total_retries: 3,
            ..RetryConfig::default()
        };

        // Without a remote endpoint the ladder has nothing to try.
        let (runtime, events, dir, config) = fixture(config);
        runtime.push_validation_failure("broken");
        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };
        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;
        assert!(!outcome.validated);
        assert_eq!(outcome.attempts, 0);

        // With one, the retry targets the remote endpoint.
        let runtime = MockRuntime::new().with_remote();
        runtime.push_validation_failure("broken");
        runtime.push_validation_success();
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };
        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;
        assert!(outcome.validated);
        assert_eq!(outcome.phase.as_deref(), Some("phase2"));
        let calls = runtime.execute_calls.lock().unwrap();
        assert_eq!(calls[0].target, ExecutionTarget::Remote);
    }

    #[tokio::test]
    async fn tasks_without_validation_command_skip_the_ladder() {
        let (runtime, events, dir, config) = fixture(RetryConfig::default());
        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };

        let task = Task::new("t", "no validation here", TaskType::Code);
        let outcome = ladder
            .run(
                &task,
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;
        assert!(outcome.validated);
        assert!(outcome.phase.is_none());
        assert!(runtime.validation_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_validator_counts_as_failing_validation() {
        let config = RetryConfig {
            max_ollama_retries: 1,
            max_remote_retries: 0,
            max_haiku_retries: 0,
            max_total_retries: 3,
            ..RetryConfig::default()
        };
        let (runtime, events, dir, config) = fixture(config);
        runtime.push_validation(Err(crate::FleetError::ValidationRpc {
            message: "validator unreachable".to_string(),
        }));
        runtime.push_validation_failure("still broken");

        let workspace = WorkspaceStore::new(dir.path());
        let ladder = RetryLadder {
            runtime: &runtime,
            events: &events,
            workspace: &workspace,
            config: &config,
        };
        let outcome = ladder
            .run(
                &task_with_validation(),
                &Agent::new("dev", AgentType::Coder),
                &MockRuntime::success_response(serde_json::json!({})),
            )
            .await;

        assert!(!outcome.validated);
        assert_eq!(outcome.attempts, 1);
        // The retry description embedded the RPC failure as the error.
        let calls = runtime.execute_calls.lock().unwrap();
        assert!(calls[0].description.contains("validator unreachable"));
    }
}
