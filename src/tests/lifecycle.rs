//! Full-stack lifecycle tests: every service wired together against an
//! in-memory store and a scripted runtime.

use crate::config::{Config, RuntimeConfig};
use crate::events::{EventBridge, EventKind};
use crate::executor::TaskExecutor;
use crate::locks::FileLockManager;
use crate::models::*;
use crate::queue::TaskAssigner;
use crate::recovery::StuckTaskSweeper;
use crate::resources::ResourcePool;
use crate::review::ReviewGate;
use crate::router::ComplexityRouter;
use crate::runtime::mock::MockRuntime;
use crate::store::{agents, tasks, Store};
use crate::workspace::WorkspaceStore;
use std::sync::Arc;

struct Engine {
    store: Store,
    events: EventBridge,
    assigner: Arc<TaskAssigner>,
    executor: Arc<TaskExecutor>,
    sweeper: StuckTaskSweeper,
    resources: ResourcePool,
    locks: FileLockManager,
    runtime: Arc<MockRuntime>,
    _workspace_dir: tempfile::TempDir,
}

async fn engine() -> Engine {
    let config = Config::default();
    let store = Store::connect_in_memory().await.unwrap();
    let events = EventBridge::new(None);
    let locks = FileLockManager::new(store.clone());
    let resources = ResourcePool::new(&config.resources, config.router.complexity_threshold);
    let router = ComplexityRouter::new(store.clone(), None, config.router.clone());
    let assigner = Arc::new(TaskAssigner::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        router,
        events.clone(),
    ));
    let review = Arc::new(ReviewGate::new(
        store.clone(),
        events.clone(),
        None,
        config.review.clone(),
    ));
    let workspace_dir = tempfile::tempdir().unwrap();
    let workspace = WorkspaceStore::new(workspace_dir.path());
    let runtime = Arc::new(MockRuntime::new());
    let executor = Arc::new(TaskExecutor::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        events.clone(),
        runtime.clone(),
        workspace,
        review,
        assigner.clone(),
        config.retry.clone(),
        RuntimeConfig {
            rest_delay_min_ms: 0,
            rest_delay_max_ms: 0,
            reset_interval: 0,
            ..config.runtime.clone()
        },
    ));
    let sweeper = StuckTaskSweeper::new(
        store.clone(),
        locks.clone(),
        resources.clone(),
        events.clone(),
        config.recovery.clone(),
    );

    Engine {
        store,
        events,
        assigner,
        executor,
        sweeper,
        resources,
        locks,
        runtime,
        _workspace_dir: workspace_dir,
    }
}

fn status_rank(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Assigned => 1,
        TaskStatus::InProgress | TaskStatus::NeedsHuman => 2,
        TaskStatus::Completed | TaskStatus::Aborted | TaskStatus::Failed => 3,
    }
}

#[tokio::test]
async fn submit_assign_execute_complete() {
    let engine = engine().await;
    let mut rx = engine.events.subscribe();

    let agent = Agent::new("dev-1", AgentType::Coder);
    agents::insert_agent(engine.store.pool(), &agent).await.unwrap();
    let task = Task::new("add", "Create a simple function to add two numbers", TaskType::Code)
        .with_locked_files(vec!["tasks/add.py".to_string()])
        .with_validation_command("python -m pytest tasks/test_add.py");
    tasks::insert_task(engine.store.pool(), &task).await.unwrap();

    // Parallel assignment clears locks, slots and idle-agent checks.
    let assigned = engine.assigner.parallel_assign().await.unwrap().unwrap();
    assert_eq!(assigned.id, task.id);
    assert_eq!(assigned.status, TaskStatus::Assigned);

    let done = engine.executor.run_attempt(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.current_iteration, 1);

    // Everything the task held is free again.
    assert!(engine.locks.locked_paths().await.unwrap().is_empty());
    assert!(engine.resources.holder_of(&task.id).is_none());
    let agent = agents::get_agent(engine.store.pool(), &agent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.status, AgentState::Idle);
    assert_eq!(agent.tasks_completed, 1);

    // Observed per-task statuses only ever advance, modulo the retry edge.
    let mut last_rank = 0;
    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::TaskCompleted {
            saw_completed = true;
        }
        if event.kind == EventKind::TaskUpdated {
            if let Some(status) = event
                .payload
                .get("status")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<TaskStatus>().ok())
            {
                let rank = status_rank(status);
                assert!(rank >= last_rank, "status went backwards: {status}");
                last_rank = rank;
            }
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn failed_attempts_retry_then_abort_and_recover_resources() {
    let engine = engine().await;

    let agent = Agent::new("dev-1", AgentType::Coder);
    agents::insert_agent(engine.store.pool(), &agent).await.unwrap();
    let mut task = Task::new("doomed", "always fails", TaskType::Code)
        .with_locked_files(vec!["src/doomed.rs".to_string()]);
    task.max_iterations = 2;
    tasks::insert_task(engine.store.pool(), &task).await.unwrap();

    for _ in 0..4 {
        engine.runtime.push_execute(Err(crate::FleetError::AgentRpc {
            message: "model crashed".to_string(),
        }));
    }

    engine.assigner.assign_task(&task.id, &agent.id).await.unwrap();
    let done = engine.executor.run_attempt(&task.id).await.unwrap();

    assert_eq!(done.status, TaskStatus::Aborted);
    assert_eq!(done.current_iteration, 2);
    assert!(engine.locks.locked_paths().await.unwrap().is_empty());
    assert!(engine.resources.holder_of(&task.id).is_none());

    let agent = agents::get_agent(engine.store.pool(), &agent.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.status, AgentState::Idle);
    assert_eq!(agent.tasks_failed, 1);
}

#[tokio::test]
async fn sweeper_ignores_terminal_tasks() {
    let engine = engine().await;

    let agent = Agent::new("dev-1", AgentType::Coder);
    agents::insert_agent(engine.store.pool(), &agent).await.unwrap();
    let task = Task::new("done", "d", TaskType::Code);
    tasks::insert_task(engine.store.pool(), &task).await.unwrap();
    engine.assigner.assign_task(&task.id, &agent.id).await.unwrap();
    engine.executor.run_attempt(&task.id).await.unwrap();

    // Running the sweeper over a store with only terminal work is a no-op.
    assert_eq!(engine.sweeper.sweep_once().await.unwrap(), 0);
    let after = tasks::get_task(engine.store.pool(), &task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
}

#[tokio::test]
async fn lock_pairing_holds_across_mixed_outcomes() {
    // Safety invariant: every lock_files is paired with a release on every
    // terminal path, so after any mix of outcomes the lock table is empty.
    let engine = engine().await;
    let agent = Agent::new("dev-1", AgentType::Coder);
    agents::insert_agent(engine.store.pool(), &agent).await.unwrap();

    for (i, fail) in [(0, false), (1, true), (2, false)] {
        let mut task = Task::new(format!("t{i}"), "d", TaskType::Code)
            .with_locked_files(vec![format!("src/f{i}.rs")]);
        task.max_iterations = 1;
        tasks::insert_task(engine.store.pool(), &task).await.unwrap();
        if fail {
            engine.runtime.push_execute(Err(crate::FleetError::AgentRpc {
                message: "boom".to_string(),
            }));
        }
        // Auto-assign from the previous completion may have grabbed it.
        let _ = engine.assigner.assign_task(&task.id, &agent.id).await;
        let current = tasks::get_task(engine.store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        if current.status == TaskStatus::Assigned {
            engine.executor.run_attempt(&task.id).await.unwrap();
        }
    }

    assert!(engine.locks.locked_paths().await.unwrap().is_empty());
    let status = engine.resources.status();
    assert!(status.holders.is_empty());
    assert!(status.slots.iter().all(|s| s.active_slots == 0));
}
