//! Task Executor: owns the `assigned -> in_progress -> terminal` stretch of
//! the task lifecycle.
//!
//! Every terminal path (completion, retry exhaustion, abort, stuck
//! recovery) releases the task's file locks and resource slot exactly once;
//! the lock manager and pool tolerate double releases so the sweeps stay
//! idempotent. Events are emitted after the state writes they describe.

pub mod complexity;
pub mod retry;

use crate::{
    config::{RetryConfig, RuntimeConfig},
    events::{AlertSeverity, EventBridge, EventKind},
    locks::FileLockManager,
    models::{
        Agent, AgentState, ComplexitySource, ErrorCategory, ExecutionStatus, ModelTier,
        ResourceType, Task, TaskExecution, TaskStatus,
    },
    queue::TaskAssigner,
    resources::ResourcePool,
    review::ReviewGate,
    router::ComplexityRouter,
    runtime::{AgentRuntime, ExecuteRequest, ExecuteResponse, ExecutionTarget},
    store::{agents, executions, tasks, Store},
    workspace::WorkspaceStore,
    FleetError, Result,
};
use chrono::Utc;
use rand::Rng;
use retry::RetryLadder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct TaskExecutor {
    store: Store,
    locks: FileLockManager,
    resources: ResourcePool,
    events: EventBridge,
    runtime: Arc<dyn AgentRuntime>,
    workspace: WorkspaceStore,
    review: Arc<ReviewGate>,
    assigner: Arc<TaskAssigner>,
    retry_config: RetryConfig,
    runtime_config: RuntimeConfig,
    local_executions: Arc<Mutex<HashMap<String, u64>>>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        locks: FileLockManager,
        resources: ResourcePool,
        events: EventBridge,
        runtime: Arc<dyn AgentRuntime>,
        workspace: WorkspaceStore,
        review: Arc<ReviewGate>,
        assigner: Arc<TaskAssigner>,
        retry_config: RetryConfig,
        runtime_config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            locks,
            resources,
            events,
            runtime,
            workspace,
            review,
            assigner,
            retry_config,
            runtime_config,
            local_executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn effective_complexity(task: &Task) -> f64 {
        task.complexity
            .unwrap_or_else(|| ComplexityRouter::heuristic_complexity(task).0)
    }

    /// The `assigned -> in_progress` transition. Idempotent per iteration:
    /// re-entering for an iteration that already has an attempt row is a
    /// no-op returning the current task.
    pub async fn handle_task_start(&self, task_id: &str) -> Result<Task> {
        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        let agent_id = task.assigned_agent_id.clone().ok_or_else(|| {
            FleetError::Conflict(format!("task {task_id} has no assigned agent"))
        })?;

        if task.status == TaskStatus::InProgress {
            if executions::get_execution_for_iteration(
                self.store.pool(),
                task_id,
                task.current_iteration,
            )
            .await?
            .is_some()
            {
                return Ok(task);
            }
        } else if task.status != TaskStatus::Assigned {
            return Err(FleetError::Conflict(format!(
                "task {task_id} is {}, cannot start",
                task.status
            )));
        }

        let resource_type = self
            .resources
            .resource_for_complexity(Self::effective_complexity(&task));
        if !self.resources.acquire(resource_type, &task.id) {
            return Err(FleetError::ResourceBusy(format!(
                "no free {resource_type} slot for task {task_id}"
            )));
        }

        let now = Utc::now();
        if task.status == TaskStatus::Assigned {
            task.status = TaskStatus::InProgress;
            task.current_iteration += 1;
            task.updated_at = now;

            let mut tx = self.store.pool().begin().await?;
            let claimed = tasks::transition_status_conn(
                &mut tx,
                &task.id,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                now,
            )
            .await?;
            if claimed == 0 {
                drop(tx);
                let latest = tasks::get_task(self.store.pool(), task_id)
                    .await?
                    .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
                if !latest.status.holds_locks() {
                    // The task is no longer runnable; give back the slot.
                    self.resources.release(&task.id);
                }
                return Err(FleetError::Conflict(format!(
                    "task {task_id} changed state during start"
                )));
            }
            tasks::update_task_conn(&mut tx, &task).await?;
            tx.commit().await?;
        } else {
            task.updated_at = now;
            tasks::update_task(self.store.pool(), &task).await?;
        }

        let execution = TaskExecution {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            agent_id,
            iteration: task.current_iteration,
            status: ExecutionStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            metrics: None,
            input: Some(task.description.clone()),
            output: None,
            error: None,
        };
        executions::insert_execution(self.store.pool(), &execution).await?;

        info!(
            task_id = %task.id,
            iteration = task.current_iteration,
            "task started"
        );
        self.events.emit_task(EventKind::TaskUpdated, &task);
        Ok(task)
    }

    /// Persist the attempt's step trace into the execution log and fan the
    /// steps out as events. Log persistence failures never fail the task.
    async fn record_steps(&self, task_id: &str, response: &ExecuteResponse) {
        if response.steps.is_empty() {
            return;
        }
        let execution_id = match executions::get_active_execution(self.store.pool(), task_id).await
        {
            Ok(Some(active)) => active.id,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id, error = %e, "could not resolve active execution for step trace");
                return;
            }
        };
        for step in &response.steps {
            let entry = crate::models::ExecutionLogEntry {
                id: Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                execution_id: execution_id.clone(),
                step_index: step.step_index,
                thought: step.thought.clone(),
                action: step.action.clone(),
                action_input: step.action_input.clone(),
                observation: step.observation.clone(),
                duration_ms: step.duration_ms,
                is_loop: step.is_loop,
            };
            if let Err(e) = executions::insert_log_entry(self.store.pool(), &entry).await {
                warn!(task_id, error = %e, "failed to persist execution step");
                break;
            }
            self.events.emit(
                EventKind::ExecutionStep,
                serde_json::json!({
                    "task_id": task_id,
                    "step_index": step.step_index,
                    "action": step.action,
                    "is_loop": step.is_loop,
                }),
            );
        }
    }

    /// Masked-failure check on an agent result that claims success. Agents
    /// sometimes report success while their own test run failed; the output
    /// payload gives it away.
    fn masked_failure(result: &serde_json::Value) -> Option<String> {
        let output = result.get("output").and_then(|v| v.as_str())?;
        let parsed: serde_json::Value = serde_json::from_str(output).ok()?;

        if parsed.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let reason = parsed
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("agent output reports success=false");
            return Some(reason.to_string());
        }
        if let Some(test_results) = parsed.get("test_results").and_then(|v| v.as_str()) {
            if let Some(after) = test_results.split("FAILURE").nth(1) {
                if after.contains("FAILED") || after.contains("ERRORS") {
                    return Some(format!("tests failed: {}", test_results.trim()));
                }
            }
        }
        None
    }

    /// Rest the agent after a local-tier execution and clear its runtime
    /// context every Nth run. Errors here never affect the task outcome.
    async fn cooldown(&self, agent_id: &str, resource_type: Option<ResourceType>) {
        if resource_type != Some(ResourceType::Ollama) {
            return;
        }
        let delay_ms = {
            let min = self.runtime_config.rest_delay_min_ms;
            let max = self.runtime_config.rest_delay_max_ms.max(min);
            if max == 0 {
                0
            } else {
                rand::thread_rng().gen_range(min..=max)
            }
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let reset_due = {
            let mut counts = self.local_executions.lock().expect("cooldown mutex poisoned");
            let count = counts.entry(agent_id.to_string()).or_insert(0);
            *count += 1;
            self.runtime_config.reset_interval > 0
                && *count % self.runtime_config.reset_interval == 0
        };
        if reset_due {
            if let Err(e) = self.runtime.reset_context(agent_id).await {
                warn!(agent_id, error = %e, "context reset failed");
            }
        }
    }

    /// Finalize a successful attempt. The ladder has already run by the
    /// time this is called; `result` is the attempt's opaque output blob.
    pub async fn handle_task_completion(
        &self,
        task_id: &str,
        response: ExecuteResponse,
    ) -> Result<Task> {
        // Safety net first: an agent claiming success whose own test output
        // says otherwise goes down the failure path instead.
        if let Some(reason) = Self::masked_failure(&response.output) {
            warn!(task_id, reason = %reason, "completion redirected to failure");
            return self.handle_task_failure(task_id, &reason).await;
        }

        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;

        let held_resource = self.resources.holder_of(&task.id);
        self.locks.release_file_locks(&task.id).await?;
        self.resources.release(&task.id);

        let output_text = response
            .output
            .get("output")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| response.output.to_string());
        if let Err(e) = self.workspace.persist_output(&task, &output_text).await {
            warn!(task_id, error = %e, "failed to persist task output");
        }

        let logs = executions::list_logs_for_task(self.store.pool(), &task.id).await?;
        let attempts = executions::list_executions_for_task(self.store.pool(), &task.id).await?;
        let actual = complexity::actual_complexity(&logs, &attempts);

        let agent_id = task.assigned_agent_id.clone();
        if let Some(agent_id) = &agent_id {
            self.cooldown(agent_id, held_resource).await;
        }

        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.result = Some(sqlx::types::Json(response.output.clone()));
        task.completed_at = Some(now);
        task.complexity = Some(actual);
        task.complexity_source = Some(ComplexitySource::Actual);
        task.api_credits_used += response.credits_used;
        task.time_spent_ms += response.duration_ms as i64;
        task.error = None;
        task.error_category = None;
        task.updated_at = now;

        let mut agent = match &agent_id {
            Some(agent_id) => agents::get_agent(self.store.pool(), agent_id).await?,
            None => None,
        };

        let mut tx = self.store.pool().begin().await?;
        let claimed = tasks::transition_status_conn(
            &mut tx,
            &task.id,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            now,
        )
        .await?;
        if claimed == 0 {
            // Another finalizer (the stuck sweep, or a duplicate call) won
            // the race; its terminal write stands and this one is skipped.
            drop(tx);
            warn!(task_id, "task was finalized elsewhere, completion skipped");
            return tasks::get_task(self.store.pool(), task_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")));
        }
        tasks::update_task_conn(&mut tx, &task).await?;
        if let Some(agent) = agent.as_mut() {
            agent.status = AgentState::Idle;
            agent.current_task_id = None;
            agent.tasks_completed += 1;
            agent.total_api_credits += response.credits_used;
            agent.total_time_ms += response.duration_ms as i64;
            agent.updated_at = now;
            agents::update_agent_conn(&mut tx, agent).await?;
        }
        tx.commit().await?;

        if let Some(active) = executions::get_active_execution(self.store.pool(), &task.id).await? {
            executions::finish_execution(
                self.store.pool(),
                &active.id,
                ExecutionStatus::Completed,
                now,
                Some(&output_text),
                None,
            )
            .await?;
        }

        info!(task_id = %task.id, actual_complexity = actual, "task completed");
        self.events
            .publish_task(EventKind::TaskCompleted, &task)
            .await;
        self.events.emit_task(EventKind::TaskUpdated, &task);
        if let Some(agent) = &agent {
            self.events.emit_agent(agent);
        }

        // Review sampling runs in the background; its failures are its own.
        let executed_tier = match held_resource {
            Some(ResourceType::Ollama) | None => ModelTier::Ollama,
            Some(ResourceType::Claude) => ModelTier::Haiku,
        };
        let review = self.review.clone();
        let review_task = task.clone();
        tokio::spawn(async move {
            if let Err(e) = review.maybe_review(&review_task, executed_tier).await {
                error!(task_id = %review_task.id, error = %e, "code review failed");
            }
        });

        // Best-effort pickup of the next task for the now-idle agent.
        if let Some(agent) = &agent {
            if let Err(e) = self.assigner.assign_next_task(&agent.id).await {
                warn!(agent_id = %agent.id, error = %e, "auto-assign after completion failed");
            }
        }

        Ok(task)
    }

    /// Record a failed attempt: retry while the iteration budget allows,
    /// abort once it is spent.
    pub async fn handle_task_failure(&self, task_id: &str, error_text: &str) -> Result<Task> {
        let now = Utc::now();
        if let Some(active) = executions::get_active_execution(self.store.pool(), task_id).await? {
            executions::finish_execution(
                self.store.pool(),
                &active.id,
                ExecutionStatus::Failed,
                now,
                None,
                Some(error_text),
            )
            .await?;
        }

        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;

        if task.current_iteration < task.max_iterations {
            // Locks stay held and the agent stays busy; whoever launched the
            // execution schedules the retry.
            task.status = TaskStatus::Assigned;
            task.error = Some(error_text.to_string());
            task.updated_at = now;
            let mut tx = self.store.pool().begin().await?;
            let claimed = tasks::transition_status_conn(
                &mut tx,
                &task.id,
                TaskStatus::InProgress,
                TaskStatus::Assigned,
                now,
            )
            .await?;
            if claimed == 0 {
                drop(tx);
                warn!(task_id, "task was finalized elsewhere, retry re-arm skipped");
                return tasks::get_task(self.store.pool(), task_id)
                    .await?
                    .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")));
            }
            tasks::update_task_conn(&mut tx, &task).await?;
            tx.commit().await?;
            info!(
                task_id = %task.id,
                iteration = task.current_iteration,
                max = task.max_iterations,
                "attempt failed, retry scheduled"
            );
            self.events.emit_task(EventKind::TaskUpdated, &task);
            Ok(task)
        } else {
            self.abort_task(task_id, error_text).await
        }
    }

    /// Terminal failure: release everything, categorize, abort.
    pub async fn abort_task(&self, task_id: &str, error_text: &str) -> Result<Task> {
        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        if task.status.is_terminal() {
            warn!(task_id, status = %task.status, "abort of a terminal task is a no-op");
            return Ok(task);
        }
        let from_status = task.status;

        let held_resource = self.resources.holder_of(&task.id);
        self.locks.release_file_locks(&task.id).await?;
        self.resources.release(&task.id);

        let logs = executions::list_logs_for_task(self.store.pool(), &task.id).await?;
        let attempts = executions::list_executions_for_task(self.store.pool(), &task.id).await?;
        let actual = complexity::actual_complexity(&logs, &attempts);

        let now = Utc::now();
        if let Some(active) = executions::get_active_execution(self.store.pool(), &task.id).await? {
            executions::finish_execution(
                self.store.pool(),
                &active.id,
                ExecutionStatus::Failed,
                now,
                None,
                Some(error_text),
            )
            .await?;
        }

        let agent_id = task.assigned_agent_id.clone();
        if let Some(agent_id) = &agent_id {
            self.cooldown(agent_id, held_resource).await;
        }

        task.status = TaskStatus::Aborted;
        task.error = Some(error_text.to_string());
        task.error_category = Some(categorize_error(error_text));
        task.complexity = Some(actual);
        task.complexity_source = Some(ComplexitySource::Actual);
        task.updated_at = now;

        let mut agent = match &agent_id {
            Some(agent_id) => agents::get_agent(self.store.pool(), agent_id).await?,
            None => None,
        };

        let mut tx = self.store.pool().begin().await?;
        let claimed = tasks::transition_status_conn(
            &mut tx,
            &task.id,
            from_status,
            TaskStatus::Aborted,
            now,
        )
        .await?;
        if claimed == 0 {
            drop(tx);
            warn!(task_id, "task was finalized elsewhere, abort skipped");
            return tasks::get_task(self.store.pool(), task_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")));
        }
        tasks::update_task_conn(&mut tx, &task).await?;
        if let Some(agent) = agent.as_mut() {
            agent.status = AgentState::Idle;
            agent.current_task_id = None;
            agent.tasks_failed += 1;
            agent.updated_at = now;
            agents::update_agent_conn(&mut tx, agent).await?;
        }
        tx.commit().await?;

        warn!(task_id = %task.id, error = %error_text, "task aborted");
        self.events.publish_task(EventKind::TaskFailed, &task).await;
        self.events.emit_task(EventKind::TaskUpdated, &task);
        if let Some(agent) = &agent {
            self.events.emit_agent(agent);
        }
        self.events.alert(
            AlertSeverity::Error,
            format!("task {} aborted: {error_text}", task.short_id()),
        );

        Ok(task)
    }

    /// Park a blocked task for a human decision. Locks stay held and the
    /// agent stays pinned so an approval can resume in place.
    pub async fn mark_needs_human(&self, task_id: &str, reason: &str) -> Result<Task> {
        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(FleetError::Conflict(format!(
                "task {task_id} is {}, cannot escalate to human",
                task.status
            )));
        }
        let from_status = task.status;
        let now = Utc::now();
        task.status = TaskStatus::NeedsHuman;
        task.error = Some(reason.to_string());
        task.updated_at = now;

        let mut tx = self.store.pool().begin().await?;
        let claimed = tasks::transition_status_conn(
            &mut tx,
            &task.id,
            from_status,
            TaskStatus::NeedsHuman,
            now,
        )
        .await?;
        if claimed == 0 {
            drop(tx);
            return Err(FleetError::Conflict(format!(
                "task {task_id} changed state during escalation"
            )));
        }
        tasks::update_task_conn(&mut tx, &task).await?;
        tx.commit().await?;

        self.events
            .publish_task(EventKind::TaskNeedsHumanReview, &task)
            .await;
        Ok(task)
    }

    /// Human verdict on a parked task: approval re-arms the assignment,
    /// rejection aborts.
    pub async fn resolve_human(&self, task_id: &str, approve: bool) -> Result<Task> {
        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::NeedsHuman {
            return Err(FleetError::Conflict(format!(
                "task {task_id} is {}, not awaiting a human",
                task.status
            )));
        }
        if approve {
            let now = Utc::now();
            task.status = TaskStatus::Assigned;
            task.error = None;
            task.updated_at = now;

            let mut tx = self.store.pool().begin().await?;
            let claimed = tasks::transition_status_conn(
                &mut tx,
                &task.id,
                TaskStatus::NeedsHuman,
                TaskStatus::Assigned,
                now,
            )
            .await?;
            if claimed == 0 {
                drop(tx);
                return Err(FleetError::Conflict(format!(
                    "task {task_id} changed state during approval"
                )));
            }
            tasks::update_task_conn(&mut tx, &task).await?;
            tx.commit().await?;

            self.events.emit_task(EventKind::TaskUpdated, &task);
            Ok(task)
        } else {
            self.abort_task(task_id, "rejected by human review").await
        }
    }

    /// Drive one agent-facing attempt cycle to a stable state: start, run,
    /// validate through the ladder, then finalize. Retries allowed by the
    /// iteration budget are executed in place.
    pub async fn run_attempt(&self, task_id: &str) -> Result<Task> {
        loop {
            let task = self.handle_task_start(task_id).await?;
            let agent_id = task
                .assigned_agent_id
                .clone()
                .ok_or_else(|| FleetError::Conflict(format!("task {task_id} has no agent")))?;
            let agent = agents::get_agent(self.store.pool(), &agent_id)
                .await?
                .ok_or_else(|| FleetError::NotFound(format!("agent {agent_id}")))?;

            let outcome = self.execute_once(&task, &agent).await?;
            if outcome.status != TaskStatus::Assigned {
                return Ok(outcome);
            }
            // Failure left the task re-armed for another iteration.
        }
    }

    async fn execute_once(&self, task: &Task, agent: &Agent) -> Result<Task> {
        let complexity = Self::effective_complexity(task);
        let (tier, _, context_window) = ComplexityRouter::tier_for(complexity, task.task_type);
        let tier = task.preferred_model.unwrap_or(tier);
        let use_hosted = tier.is_hosted() || agent.always_use_hosted;

        let mut description = task.description.clone();
        if let Some(context) = &task.review_context {
            description = format!("{description}\n\n--- Prior review findings ---\n{context}");
        }

        let request = ExecuteRequest {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            description,
            model_tier: tier,
            use_hosted,
            context_window,
            language: task.language.clone(),
            target: ExecutionTarget::Local,
        };

        match self.runtime.execute(request).await {
            Ok(response) if response.success => {
                self.record_steps(&task.id, &response).await;
                if self.retry_config.enabled && task.validation_command.is_some() {
                    let ladder = RetryLadder {
                        runtime: self.runtime.as_ref(),
                        events: &self.events,
                        workspace: &self.workspace,
                        config: &self.retry_config,
                    };
                    let outcome = ladder.run(task, agent, &response).await;
                    if outcome.validated {
                        let final_response = outcome.final_response.unwrap_or(response);
                        self.handle_task_completion(&task.id, final_response).await
                    } else {
                        let reason = outcome
                            .final_error
                            .unwrap_or_else(|| "validation failed".to_string());
                        self.handle_task_failure(&task.id, &reason).await
                    }
                } else {
                    self.handle_task_completion(&task.id, response).await
                }
            }
            Ok(response) => {
                self.record_steps(&task.id, &response).await;
                let reason = response
                    .output
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported failure")
                    .to_string();
                self.handle_task_failure(&task.id, &reason).await
            }
            Err(e @ FleetError::AgentRpc { .. }) => {
                self.handle_task_failure(&task.id, &e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Coarse error taxonomy for aborted tasks, derived from the error text.
pub fn categorize_error(error_text: &str) -> ErrorCategory {
    let lower = error_text.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorCategory::Timeout
    } else if lower.contains("syntax") {
        ErrorCategory::Syntax
    } else if lower.contains("import") || lower.contains("module not found") {
        ErrorCategory::ImportError
    } else {
        ErrorCategory::Other
    }
}
