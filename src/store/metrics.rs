//! Aggregate queries backing the metrics endpoints.

use crate::{constants, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsOverview {
    pub total_tasks: i64,
    pub pending: i64,
    pub assigned: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub aborted: i64,
    pub failed: i64,
    pub needs_human: i64,
    pub total_api_credits: f64,
    pub total_time_ms: i64,
}

pub async fn overview(pool: &SqlitePool) -> Result<MetricsOverview> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut out = MetricsOverview::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => out.pending = *count,
            "assigned" => out.assigned = *count,
            "in_progress" => out.in_progress = *count,
            "completed" => out.completed = *count,
            "aborted" => out.aborted = *count,
            "failed" => out.failed = *count,
            "needs_human" => out.needs_human = *count,
            _ => {}
        }
        out.total_tasks += count;
    }

    let totals: (f64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(api_credits_used), 0), COALESCE(SUM(time_spent_ms), 0) FROM tasks",
    )
    .fetch_one(pool)
    .await?;
    out.total_api_credits = totals.0;
    out.total_time_ms = totals.1;
    Ok(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub day: String,
    pub completed: i64,
    pub failed: i64,
}

/// Per-day terminal outcomes over the trailing window.
pub async fn timeline(pool: &SqlitePool, days: Option<i64>) -> Result<Vec<TimelinePoint>> {
    let days = days.unwrap_or(constants::METRICS_TIMELINE_DAYS);
    let since = Utc::now() - Duration::days(days);
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT date(updated_at) AS day, \
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), \
                SUM(CASE WHEN status IN ('aborted', 'failed') THEN 1 ELSE 0 END) \
         FROM tasks \
         WHERE status IN ('completed', 'aborted', 'failed') AND updated_at >= ? \
         GROUP BY day ORDER BY day ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(day, completed, failed)| TimelinePoint {
            day,
            completed,
            failed,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeCount {
    pub task_type: String,
    pub count: i64,
}

pub async fn distribution_by_type(pool: &SqlitePool) -> Result<Vec<TypeCount>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT task_type, COUNT(*) FROM tasks GROUP BY task_type ORDER BY task_type")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(task_type, count)| TypeCount { task_type, count })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessRate {
    pub completed: i64,
    pub failed: i64,
    pub rate: f64,
}

pub async fn success_rate(pool: &SqlitePool) -> Result<SuccessRate> {
    let (completed, failed): (i64, i64) = sqlx::query_as(
        "SELECT SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), \
                SUM(CASE WHEN status IN ('aborted', 'failed') THEN 1 ELSE 0 END) \
         FROM tasks",
    )
    .fetch_optional(pool)
    .await?
    .map(|(c, f): (Option<i64>, Option<i64>)| (c.unwrap_or(0), f.unwrap_or(0)))
    .unwrap_or((0, 0));

    let total = completed + failed;
    let rate = if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64
    };
    Ok(SuccessRate {
        completed,
        failed,
        rate,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSuccessRate {
    pub agent_id: String,
    pub agent_name: String,
    pub completed: i64,
    pub failed: i64,
    pub rate: f64,
}

pub async fn success_rate_by_agent(pool: &SqlitePool) -> Result<Vec<AgentSuccessRate>> {
    let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
        "SELECT id, name, tasks_completed, tasks_failed FROM agents ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(agent_id, agent_name, completed, failed)| {
            let total = completed + failed;
            AgentSuccessRate {
                agent_id,
                agent_name,
                completed,
                failed,
                rate: if total == 0 {
                    0.0
                } else {
                    completed as f64 / total as f64
                },
            }
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityBucket {
    pub bucket: i64,
    pub count: i64,
}

/// Scored tasks bucketed by integer complexity 1..=10.
pub async fn complexity_distribution(pool: &SqlitePool) -> Result<Vec<ComplexityBucket>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT CAST(MIN(MAX(ROUND(complexity), 1), 10) AS INTEGER) AS bucket, COUNT(*) \
         FROM tasks WHERE complexity IS NOT NULL \
         GROUP BY bucket ORDER BY bucket ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(bucket, count)| ComplexityBucket { bucket, count })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskStatus, TaskType};
    use crate::store::{tasks, Store};

    async fn seed_with_status(pool: &SqlitePool, status: TaskStatus, complexity: Option<f64>) {
        let mut task = Task::new("t", "d", TaskType::Code);
        task.status = status;
        task.complexity = complexity;
        tasks::insert_task(pool, &task).await.unwrap();
    }

    #[tokio::test]
    async fn overview_counts_by_status() {
        let store = Store::connect_in_memory().await.unwrap();
        seed_with_status(store.pool(), TaskStatus::Pending, None).await;
        seed_with_status(store.pool(), TaskStatus::Completed, Some(3.0)).await;
        seed_with_status(store.pool(), TaskStatus::Completed, Some(8.2)).await;
        seed_with_status(store.pool(), TaskStatus::Aborted, None).await;

        let out = overview(store.pool()).await.unwrap();
        assert_eq!(out.total_tasks, 4);
        assert_eq!(out.pending, 1);
        assert_eq!(out.completed, 2);
        assert_eq!(out.aborted, 1);
    }

    #[tokio::test]
    async fn success_rate_handles_empty_store() {
        let store = Store::connect_in_memory().await.unwrap();
        let rate = success_rate(store.pool()).await.unwrap();
        assert_eq!(rate.completed, 0);
        assert_eq!(rate.rate, 0.0);
    }

    #[tokio::test]
    async fn complexity_buckets_clamp_to_scale() {
        let store = Store::connect_in_memory().await.unwrap();
        seed_with_status(store.pool(), TaskStatus::Completed, Some(3.4)).await;
        seed_with_status(store.pool(), TaskStatus::Completed, Some(3.2)).await;
        seed_with_status(store.pool(), TaskStatus::Completed, Some(9.9)).await;

        let buckets = complexity_distribution(store.pool()).await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket, 3);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].bucket, 10);
    }
}
