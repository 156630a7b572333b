//! Query functions for `task_executions` and `execution_logs`.

use crate::{
    models::{ExecutionLogEntry, ExecutionStatus, TaskExecution},
    Result,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

const EXECUTION_COLUMNS: &str = "id, task_id, agent_id, iteration, status, started_at, \
     completed_at, metrics, input, output, error";

pub async fn insert_execution(pool: &SqlitePool, execution: &TaskExecution) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_executions (id, task_id, agent_id, iteration, status, started_at, \
         completed_at, metrics, input, output, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&execution.id)
    .bind(&execution.task_id)
    .bind(&execution.agent_id)
    .bind(execution.iteration)
    .bind(execution.status)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.metrics)
    .bind(&execution.input)
    .bind(&execution.output)
    .bind(&execution.error)
    .execute(pool)
    .await?;
    Ok(())
}

/// The attempt row for (task, iteration), if any. Used to keep
/// `handle_task_start` idempotent per iteration.
pub async fn get_execution_for_iteration(
    pool: &SqlitePool,
    task_id: &str,
    iteration: i64,
) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM task_executions \
         WHERE task_id = ? AND iteration = ?"
    ))
    .bind(task_id)
    .bind(iteration)
    .fetch_optional(pool)
    .await?;
    Ok(execution)
}

/// The still-active (started) attempt for a task, newest iteration first.
pub async fn get_active_execution(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM task_executions \
         WHERE task_id = ? AND status = 'started' \
         ORDER BY iteration DESC LIMIT 1"
    ))
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    Ok(execution)
}

/// Terminal update of an attempt row. Attempts are never mutated again once
/// they leave `started`, so the WHERE clause pins the current status.
pub async fn finish_execution(
    pool: &SqlitePool,
    execution_id: &str,
    status: ExecutionStatus,
    completed_at: DateTime<Utc>,
    output: Option<&str>,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = ?, completed_at = ?, output = COALESCE(?, output), \
             error = COALESCE(?, error) \
         WHERE id = ? AND status = 'started'",
    )
    .bind(status)
    .bind(completed_at)
    .bind(output)
    .bind(error)
    .bind(execution_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_executions_for_task(
    pool: &SqlitePool,
    task_id: &str,
) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM task_executions \
         WHERE task_id = ? ORDER BY iteration ASC"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(executions)
}

pub async fn insert_log_entry(pool: &SqlitePool, entry: &ExecutionLogEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO execution_logs (id, task_id, execution_id, step_index, thought, action, \
         action_input, observation, duration_ms, is_loop) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.task_id)
    .bind(&entry.execution_id)
    .bind(entry.step_index)
    .bind(&entry.thought)
    .bind(&entry.action)
    .bind(&entry.action_input)
    .bind(&entry.observation)
    .bind(entry.duration_ms)
    .bind(entry.is_loop)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_logs_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<ExecutionLogEntry>> {
    let entries = sqlx::query_as::<_, ExecutionLogEntry>(
        "SELECT id, task_id, execution_id, step_index, thought, action, action_input, \
         observation, duration_ms, is_loop \
         FROM execution_logs WHERE task_id = ? ORDER BY step_index ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskType};
    use crate::store::{tasks, Store};
    use uuid::Uuid;

    fn execution(task_id: &str, iteration: i64) -> TaskExecution {
        TaskExecution {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            agent_id: "agent-1".to_string(),
            iteration,
            status: ExecutionStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            metrics: None,
            input: Some("do the thing".to_string()),
            output: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn attempt_rows_are_terminal_once() {
        let store = Store::connect_in_memory().await.unwrap();
        let task = Task::new("t", "d", TaskType::Code);
        tasks::insert_task(store.pool(), &task).await.unwrap();

        let attempt = execution(&task.id, 1);
        insert_execution(store.pool(), &attempt).await.unwrap();

        let finished = finish_execution(
            store.pool(),
            &attempt.id,
            ExecutionStatus::Completed,
            Utc::now(),
            Some("done"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(finished, 1);

        // A second terminal write must not touch the row.
        let again = finish_execution(
            store.pool(),
            &attempt.id,
            ExecutionStatus::Failed,
            Utc::now(),
            None,
            Some("late error"),
        )
        .await
        .unwrap();
        assert_eq!(again, 0);

        let rows = list_executions_for_task(store.pool(), &task.id).await.unwrap();
        assert_eq!(rows[0].status, ExecutionStatus::Completed);
        assert_eq!(rows[0].output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn active_execution_picks_latest_started() {
        let store = Store::connect_in_memory().await.unwrap();
        let task = Task::new("t", "d", TaskType::Code);
        tasks::insert_task(store.pool(), &task).await.unwrap();

        let first = execution(&task.id, 1);
        insert_execution(store.pool(), &first).await.unwrap();
        finish_execution(
            store.pool(),
            &first.id,
            ExecutionStatus::Failed,
            Utc::now(),
            None,
            Some("nope"),
        )
        .await
        .unwrap();

        let second = execution(&task.id, 2);
        insert_execution(store.pool(), &second).await.unwrap();

        let active = get_active_execution(store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.iteration, 2);
    }

    #[tokio::test]
    async fn log_entries_come_back_in_step_order() {
        let store = Store::connect_in_memory().await.unwrap();
        let task = Task::new("t", "d", TaskType::Code);
        tasks::insert_task(store.pool(), &task).await.unwrap();
        let attempt = execution(&task.id, 1);
        insert_execution(store.pool(), &attempt).await.unwrap();

        for (index, action) in [(2i64, "write"), (0, "read"), (1, "think")] {
            let entry = ExecutionLogEntry {
                id: Uuid::new_v4().to_string(),
                task_id: task.id.clone(),
                execution_id: attempt.id.clone(),
                step_index: index,
                thought: None,
                action: Some(action.to_string()),
                action_input: None,
                observation: None,
                duration_ms: 10,
                is_loop: false,
            };
            insert_log_entry(store.pool(), &entry).await.unwrap();
        }

        let entries = list_logs_for_task(store.pool(), &task.id).await.unwrap();
        let actions: Vec<_> = entries.iter().filter_map(|e| e.action.as_deref()).collect();
        assert_eq!(actions, vec!["read", "think", "write"]);
    }
}
