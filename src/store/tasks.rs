//! Query functions for the `tasks` table.

use crate::{
    models::{AgentType, Task, TaskStatus, TaskType},
    Result,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

const TASK_COLUMNS: &str = "id, mission_id, title, description, task_type, priority, \
     max_iterations, current_iteration, locked_files, validation_command, language, \
     required_agent, preferred_model, complexity, complexity_source, complexity_reasoning, \
     assigned_agent_id, assigned_at, status, error, error_category, result, \
     needs_human_review, review_context, api_credits_used, time_spent_ms, \
     created_at, updated_at, completed_at";

pub async fn insert_task(pool: &SqlitePool, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (id, mission_id, title, description, task_type, priority, \
         max_iterations, current_iteration, locked_files, validation_command, language, \
         required_agent, preferred_model, complexity, complexity_source, complexity_reasoning, \
         assigned_agent_id, assigned_at, status, error, error_category, result, \
         needs_human_review, review_context, api_credits_used, time_spent_ms, \
         created_at, updated_at, completed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id)
    .bind(&task.mission_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.task_type)
    .bind(task.priority)
    .bind(task.max_iterations)
    .bind(task.current_iteration)
    .bind(&task.locked_files)
    .bind(&task.validation_command)
    .bind(&task.language)
    .bind(task.required_agent)
    .bind(task.preferred_model)
    .bind(task.complexity)
    .bind(task.complexity_source)
    .bind(&task.complexity_reasoning)
    .bind(&task.assigned_agent_id)
    .bind(task.assigned_at)
    .bind(task.status)
    .bind(&task.error)
    .bind(task.error_category)
    .bind(&task.result)
    .bind(task.needs_human_review)
    .bind(&task.review_context)
    .bind(task.api_credits_used)
    .bind(task.time_spent_ms)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(task)
}

/// Full-row update. The caller owns the state-machine rules; this function
/// only makes the row match the struct.
pub async fn update_task(pool: &SqlitePool, task: &Task) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    update_task_conn(&mut conn, task).await
}

pub async fn update_task_conn(conn: &mut SqliteConnection, task: &Task) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET mission_id = ?, title = ?, description = ?, task_type = ?, \
         priority = ?, max_iterations = ?, current_iteration = ?, locked_files = ?, \
         validation_command = ?, language = ?, required_agent = ?, preferred_model = ?, \
         complexity = ?, complexity_source = ?, complexity_reasoning = ?, \
         assigned_agent_id = ?, assigned_at = ?, status = ?, error = ?, error_category = ?, \
         result = ?, needs_human_review = ?, review_context = ?, api_credits_used = ?, \
         time_spent_ms = ?, updated_at = ?, completed_at = ? \
         WHERE id = ?",
    )
    .bind(&task.mission_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.task_type)
    .bind(task.priority)
    .bind(task.max_iterations)
    .bind(task.current_iteration)
    .bind(&task.locked_files)
    .bind(&task.validation_command)
    .bind(&task.language)
    .bind(task.required_agent)
    .bind(task.preferred_model)
    .bind(task.complexity)
    .bind(task.complexity_source)
    .bind(&task.complexity_reasoning)
    .bind(&task.assigned_agent_id)
    .bind(task.assigned_at)
    .bind(task.status)
    .bind(&task.error)
    .bind(task.error_category)
    .bind(&task.result)
    .bind(task.needs_human_review)
    .bind(&task.review_context)
    .bind(task.api_credits_used)
    .bind(task.time_spent_ms)
    .bind(task.updated_at)
    .bind(task.completed_at)
    .bind(&task.id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Optimistic status transition: the row is only updated when its current
/// status matches `from`. Returns rows affected (0 means the task moved
/// under us). Every writer that changes a task's status claims the edge
/// through this guard before overwriting the rest of the row, so two
/// concurrent finalizers cannot both land a terminal write.
pub async fn transition_status(
    pool: &SqlitePool,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    transition_status_conn(&mut conn, task_id, from, to, now).await
}

pub async fn transition_status_conn(
    conn: &mut SqliteConnection,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(task_id)
    .bind(from)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Filters for the task listing endpoint.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_agent_id: Option<String>,
    pub task_type: Option<TaskType>,
    pub mission_id: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_tasks(pool: &SqlitePool, filter: &TaskFilter) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE (?1 IS NULL OR status = ?1) \
           AND (?2 IS NULL OR assigned_agent_id = ?2) \
           AND (?3 IS NULL OR task_type = ?3) \
           AND (?4 IS NULL OR mission_id = ?4) \
         ORDER BY created_at DESC \
         LIMIT ?5"
    ))
    .bind(filter.status)
    .bind(&filter.assigned_agent_id)
    .bind(filter.task_type)
    .bind(&filter.mission_id)
    .bind(filter.limit.unwrap_or(500))
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

/// Pending tasks in selection order: priority DESC, then oldest first.
pub async fn list_pending(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' \
         ORDER BY priority DESC, created_at ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

/// The single best pending task an agent of `agent_type` may serve. Tasks
/// with a `required_agent` of a different type are excluded; `exclude_id`
/// skips a candidate already rejected for file conflicts.
pub async fn find_best_pending(
    pool: &SqlitePool,
    agent_type: AgentType,
    exclude_id: Option<&str>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE status = 'pending' \
           AND (required_agent IS NULL OR required_agent = ?1) \
           AND (?2 IS NULL OR id != ?2) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 1"
    ))
    .bind(agent_type)
    .bind(exclude_id)
    .fetch_optional(pool)
    .await?;
    Ok(task)
}

/// Tasks stuck in `in_progress` since before `cutoff`.
pub async fn list_stuck(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE status = 'in_progress' AND assigned_at IS NOT NULL AND assigned_at < ? \
         ORDER BY assigned_at ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(tasks)
}

pub async fn delete_task(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
