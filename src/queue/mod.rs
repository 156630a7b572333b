//! Task Assigner: picks the next task for an agent, picks an agent for a
//! task, and owns the `pending -> assigned` transition.
//!
//! The assigner is the sole writer for assignment state. Lock acquisition,
//! the task row update and the agent row update share one transaction, so a
//! failure anywhere rolls the whole assignment back and no events are
//! emitted.

use crate::{
    events::{EventBridge, EventKind},
    locks::FileLockManager,
    models::{Agent, AgentState, RouteDecision, Task, TaskStatus},
    resources::ResourcePool,
    router::ComplexityRouter,
    store::{agents, tasks, Store},
    FleetError, Result,
};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct TaskAssigner {
    store: Store,
    locks: FileLockManager,
    resources: ResourcePool,
    router: ComplexityRouter,
    events: EventBridge,
}

impl TaskAssigner {
    pub fn new(
        store: Store,
        locks: FileLockManager,
        resources: ResourcePool,
        router: ComplexityRouter,
        events: EventBridge,
    ) -> Self {
        Self {
            store,
            locks,
            resources,
            router,
            events,
        }
    }

    fn conflicts(task: &Task, locked: &HashSet<String>) -> bool {
        task.locked_files.0.iter().any(|path| locked.contains(path))
    }

    /// Select and assign the next eligible task for an idle agent.
    /// Candidates are considered in `(priority DESC, created_at ASC)` order;
    /// tasks whose declared files intersect the locked set are skipped.
    /// Returns `None` when the agent is not idle or nothing is eligible.
    pub async fn assign_next_task(&self, agent_id: &str) -> Result<Option<Task>> {
        let agent = agents::get_agent(self.store.pool(), agent_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("agent {agent_id}")))?;
        if agent.status != AgentState::Idle {
            debug!(agent_id, status = %agent.status, "agent not idle, nothing assigned");
            return Ok(None);
        }

        let locked = self.locks.locked_paths().await?;
        let Some(best) =
            tasks::find_best_pending(self.store.pool(), agent.agent_type, None).await?
        else {
            return Ok(None);
        };

        let chosen = if !Self::conflicts(&best, &locked) {
            best
        } else {
            // The best candidate is blocked on files; take the next one in
            // the same ordering that is not.
            let candidates = tasks::list_pending(self.store.pool()).await?;
            let alternative = candidates.into_iter().find(|task| {
                task.id != best.id
                    && task
                        .required_agent
                        .map(|required| required == agent.agent_type)
                        .unwrap_or(true)
                    && !Self::conflicts(task, &locked)
            });
            match alternative {
                Some(task) => task,
                None => return Ok(None),
            }
        };
        let assigned = self.assign_task(&chosen.id, agent_id).await?;
        Ok(Some(assigned))
    }

    /// The `pending -> assigned` transition. Also accepts a task already in
    /// `assigned` (human resume re-pins it to an agent).
    pub async fn assign_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut task = tasks::get_task(self.store.pool(), task_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id}")))?;
        let mut agent = agents::get_agent(self.store.pool(), agent_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("agent {agent_id}")))?;

        if agent.status != AgentState::Idle {
            return Err(FleetError::Conflict(format!(
                "agent {} is {}",
                agent.name, agent.status
            )));
        }
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Assigned) {
            return Err(FleetError::Conflict(format!(
                "task {} is {}, not pending",
                task.id, task.status
            )));
        }

        let now = Utc::now();
        let from_status = task.status;
        task.status = TaskStatus::Assigned;
        task.assigned_agent_id = Some(agent.id.clone());
        task.assigned_at = Some(now);
        task.updated_at = now;
        agent.status = AgentState::Busy;
        agent.current_task_id = Some(task.id.clone());
        agent.updated_at = now;

        // Locks and both row updates commit or roll back together. The
        // status guard claims the transition; losing it to a concurrent
        // assigner rolls everything back.
        let mut tx = self.store.pool().begin().await?;
        self.locks
            .lock_files_conn(&mut tx, &task.id, &agent.id, &task.locked_files.0)
            .await?;
        let claimed =
            tasks::transition_status_conn(&mut tx, &task.id, from_status, TaskStatus::Assigned, now)
                .await?;
        if claimed == 0 {
            return Err(FleetError::Conflict(format!(
                "task {} changed state during assignment",
                task.id
            )));
        }
        tasks::update_task_conn(&mut tx, &task).await?;
        agents::update_agent_conn(&mut tx, &agent).await?;
        tx.commit().await?;

        info!(task_id = %task.id, agent = %agent.name, "task assigned");
        self.events.emit_task(EventKind::TaskUpdated, &task);
        self.events.emit_agent(&agent);
        self.events
            .publish_task(EventKind::TaskAssigned, &task)
            .await;

        Ok(task)
    }

    /// Router-driven assignment: route the best eligible pending task and
    /// assign it to the proposed agent.
    pub async fn smart_assign(&self) -> Result<Option<(Task, RouteDecision)>> {
        let locked = self.locks.locked_paths().await?;
        let candidates = tasks::list_pending(self.store.pool()).await?;

        for task in candidates {
            if Self::conflicts(&task, &locked) {
                continue;
            }
            let decision = self.router.route_task(&task).await?;
            let assigned = self.assign_task(&task.id, &decision.agent_id).await?;
            return Ok(Some((assigned, decision)));
        }
        Ok(None)
    }

    /// Resource-driven fan-out: walk the pending queue in priority order
    /// and take the first task that clears file locks, a free resource slot
    /// and an idle agent of the right type. On resource exhaustion nothing
    /// is mutated and `None` comes back.
    pub async fn parallel_assign(&self) -> Result<Option<Task>> {
        let locked = self.locks.locked_paths().await?;
        let candidates = tasks::list_pending(self.store.pool()).await?;

        for task in candidates {
            if Self::conflicts(&task, &locked) {
                debug!(task_id = %task.id, "skipped: file conflict");
                continue;
            }

            let (complexity, _) = ComplexityRouter::heuristic_complexity(&task);
            let resource_type = self.resources.resource_for_complexity(complexity);
            if !self.resources.can_acquire(resource_type) {
                debug!(task_id = %task.id, resource = %resource_type, "skipped: no free slot");
                continue;
            }

            let (_, preferred_type, _) =
                ComplexityRouter::tier_for(complexity, task.task_type);
            let target_type = task.required_agent.unwrap_or(preferred_type);
            let Some(agent) =
                agents::find_idle_by_type(self.store.pool(), target_type).await?
            else {
                debug!(task_id = %task.id, agent_type = %target_type, "skipped: no idle agent");
                continue;
            };

            if !self.resources.acquire(resource_type, &task.id) {
                continue;
            }
            match self.assign_task(&task.id, &agent.id).await {
                Ok(assigned) => return Ok(Some(assigned)),
                Err(e) => {
                    // The slot must not leak when the assignment fails.
                    self.resources.release(&task.id);
                    warn!(task_id = %task.id, error = %e, "parallel assign candidate failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Snapshot for the queue endpoint: pending work, active work and the
    /// idle roster.
    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let pending = tasks::list_pending(self.store.pool()).await?;
        let active = tasks::list_tasks(
            self.store.pool(),
            &tasks::TaskFilter {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .await?;
        let assigned = tasks::list_tasks(
            self.store.pool(),
            &tasks::TaskFilter {
                status: Some(TaskStatus::Assigned),
                ..Default::default()
            },
        )
        .await?;
        let idle_agents = agents::list_idle(self.store.pool()).await?;
        Ok(QueueSnapshot {
            pending,
            assigned,
            active,
            idle_agents,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<Task>,
    pub assigned: Vec<Task>,
    pub active: Vec<Task>,
    pub idle_agents: Vec<Agent>,
}
