//! Stuck-Task Recovery: periodic sweep reclaiming timed-out work.
//!
//! A task is stuck once it has sat in `in_progress` past the configured
//! timeout. The sweep releases its locks and slot, aborts it with a timeout
//! category, and frees the agent. Re-running the sweep over an already
//! reclaimed task is a no-op because terminal tasks never match the scan.

use crate::{
    config::RecoveryConfig,
    events::{AlertSeverity, EventBridge, EventKind},
    locks::FileLockManager,
    models::{AgentState, ErrorCategory, ExecutionStatus, TaskStatus},
    resources::ResourcePool,
    store::{agents, executions, tasks, Store},
    Result,
};
use chrono::{Duration, Utc};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct StuckTaskSweeper {
    store: Store,
    locks: FileLockManager,
    resources: ResourcePool,
    events: EventBridge,
    config: RecoveryConfig,
}

impl StuckTaskSweeper {
    pub fn new(
        store: Store,
        locks: FileLockManager,
        resources: ResourcePool,
        events: EventBridge,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            locks,
            resources,
            events,
            config,
        }
    }

    /// Periodic sweep loop. Spawned once at startup; lives for the process.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("stuck-task recovery disabled");
            return;
        }
        info!(
            interval_ms = self.config.check_interval_ms,
            timeout_ms = self.config.timeout_ms,
            "stuck-task recovery started"
        );
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.check_interval_ms));
        loop {
            interval.tick().await;
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(reclaimed) => info!(reclaimed, "stuck tasks reclaimed"),
                Err(e) => error!(error = %e, "stuck-task sweep failed"),
            }
        }
    }

    /// One pass over the stuck set. Returns how many tasks were reclaimed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let timeout = Duration::milliseconds(self.config.timeout_ms as i64);
        let cutoff = Utc::now() - timeout;
        let stuck = tasks::list_stuck(self.store.pool(), cutoff).await?;
        let timeout_minutes = self.config.timeout_ms / 60_000;

        let mut reclaimed = 0;
        for mut task in stuck {
            let now = Utc::now();
            let agent_id = task.assigned_agent_id.clone();
            task.status = TaskStatus::Aborted;
            task.error = Some(format!("Task timed out after {timeout_minutes} minutes"));
            task.error_category = Some(ErrorCategory::Timeout);
            task.updated_at = now;

            let mut agent = match &agent_id {
                Some(agent_id) => agents::get_agent(self.store.pool(), agent_id).await?,
                None => None,
            };

            // Claim the transition before touching anything the task holds;
            // a task whose completion lands mid-sweep keeps its outcome.
            let mut tx = self.store.pool().begin().await?;
            let claimed = tasks::transition_status_conn(
                &mut tx,
                &task.id,
                TaskStatus::InProgress,
                TaskStatus::Aborted,
                now,
            )
            .await?;
            if claimed == 0 {
                drop(tx);
                warn!(task_id = %task.id, "task moved out of in_progress mid-sweep, skipped");
                continue;
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

            warn!(
                task_id = %task.id,
                assigned_at = ?task.assigned_at,
                "reclaiming stuck task"
            );
            self.locks.release_file_locks(&task.id).await?;
            self.resources.release(&task.id);

            if let Some(active) =
                executions::get_active_execution(self.store.pool(), &task.id).await?
            {
                executions::finish_execution(
                    self.store.pool(),
                    &active.id,
                    ExecutionStatus::Failed,
                    now,
                    None,
                    Some("stuck-task recovery timeout"),
                )
                .await?;
            }

            self.events.publish_task(EventKind::TaskFailed, &task).await;
            if let Some(agent) = &agent {
                self.events.emit_agent(agent);
            }
            self.events.alert(
                AlertSeverity::Warning,
                format!(
                    "task {} reclaimed after {timeout_minutes} minute timeout",
                    task.short_id()
                ),
            );
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::constants;
    use crate::events::EventKind;
    use crate::models::{Agent, AgentType, ResourceType, Task, TaskType};
    use crate::store::locks as lock_queries;

    struct Fixture {
        sweeper: StuckTaskSweeper,
        store: Store,
        resources: ResourcePool,
        events: EventBridge,
    }

    async fn fixture() -> Fixture {
        let store = Store::connect_in_memory().await.unwrap();
        let locks = FileLockManager::new(store.clone());
        let resources = ResourcePool::new(
            &ResourceConfig::default(),
            constants::DEFAULT_COMPLEXITY_THRESHOLD,
        );
        let events = EventBridge::new(None);
        let sweeper = StuckTaskSweeper::new(
            store.clone(),
            locks,
            resources.clone(),
            events.clone(),
            RecoveryConfig {
                enabled: true,
                timeout_ms: 600_000,
                check_interval_ms: 60_000,
            },
        );
        Fixture {
            sweeper,
            store,
            resources,
            events,
        }
    }

    async fn seed_stuck(fixture: &Fixture, minutes_ago: i64) -> (Task, Agent) {
        let mut agent = Agent::new("a2", AgentType::Coder);
        agent.status = AgentState::Busy;
        let mut task = Task::new("t4", "d", TaskType::Code)
            .with_locked_files(vec!["src/stuck.rs".to_string()]);
        agent.current_task_id = Some(task.id.clone());
        task.status = TaskStatus::InProgress;
        task.assigned_agent_id = Some(agent.id.clone());
        task.assigned_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        task.current_iteration = 1;

        agents::insert_agent(fixture.store.pool(), &agent).await.unwrap();
        tasks::insert_task(fixture.store.pool(), &task).await.unwrap();

        // Give it a lock and a slot, like a real in-flight task.
        let mut conn = fixture.store.pool().acquire().await.unwrap();
        lock_queries::upsert_lock_conn(
            &mut conn,
            "src/stuck.rs",
            &agent.id,
            &task.id,
            Utc::now(),
            Some(Utc::now() + Duration::minutes(30)),
        )
        .await
        .unwrap();
        drop(conn);
        assert!(fixture.resources.acquire(ResourceType::Ollama, &task.id));

        (task, agent)
    }

    #[tokio::test]
    async fn reclaims_timed_out_task() {
        // Scenario S4: 11 minutes in progress against a 10 minute timeout.
        let fixture = fixture().await;
        let (task, agent) = seed_stuck(&fixture, 11).await;
        let mut rx = fixture.events.subscribe();

        let reclaimed = fixture.sweeper.sweep_once().await.unwrap();
        assert_eq!(reclaimed, 1);

        let task = tasks::get_task(fixture.store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.error_category, Some(ErrorCategory::Timeout));
        assert!(task.error.as_deref().unwrap().contains("timed out after 10 minutes"));

        let agent = agents::get_agent(fixture.store.pool(), &agent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.status, AgentState::Idle);
        assert!(agent.current_task_id.is_none());
        assert_eq!(agent.tasks_failed, 1);

        assert!(fixture.resources.holder_of(&task.id).is_none());
        assert!(lock_queries::active_locks(fixture.store.pool(), Utc::now())
            .await
            .unwrap()
            .is_empty());

        // One task_failed plus one warning alert.
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push((event.kind, event.payload));
        }
        assert!(kinds.iter().any(|(k, _)| *k == EventKind::TaskFailed));
        let alert = kinds
            .iter()
            .find(|(k, _)| *k == EventKind::Alert)
            .expect("alert emitted");
        assert_eq!(
            alert.1.get("severity").and_then(|v| v.as_str()),
            Some("warning")
        );
    }

    #[tokio::test]
    async fn fresh_tasks_are_left_alone() {
        let fixture = fixture().await;
        let (task, _) = seed_stuck(&fixture, 5).await;

        let reclaimed = fixture.sweeper.sweep_once().await.unwrap();
        assert_eq!(reclaimed, 0);
        let task = tasks::get_task(fixture.store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn sweeping_twice_is_idempotent() {
        let fixture = fixture().await;
        let (task, agent) = seed_stuck(&fixture, 11).await;

        assert_eq!(fixture.sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(fixture.sweeper.sweep_once().await.unwrap(), 0);

        let agent = agents::get_agent(fixture.store.pool(), &agent.id)
            .await
            .unwrap()
            .unwrap();
        // The failure is counted exactly once.
        assert_eq!(agent.tasks_failed, 1);
        let task = tasks::get_task(fixture.store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Aborted);
    }
}
