//! Query functions for the `file_locks` table.
//!
//! The UNIQUE primary key on `file_path` is what makes lock acquisition
//! linearizable: the conditional upsert below either takes the row or
//! touches nothing, and rows_affected tells the caller which happened.

use crate::{models::FileLock, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

/// Conditional upsert of one lock. Succeeds when the path is unlocked,
/// already held by this task, or held by an expired lock. Returns rows
/// affected; 0 means another task holds an unexpired lock on the path.
pub async fn upsert_lock_conn(
    conn: &mut SqliteConnection,
    file_path: &str,
    agent_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO file_locks (file_path, agent_id, task_id, locked_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(file_path) DO UPDATE SET \
             agent_id = excluded.agent_id, \
             task_id = excluded.task_id, \
             locked_at = excluded.locked_at, \
             expires_at = excluded.expires_at \
         WHERE file_locks.task_id = excluded.task_id \
            OR (file_locks.expires_at IS NOT NULL AND file_locks.expires_at <= ?4)",
    )
    .bind(file_path)
    .bind(agent_id)
    .bind(task_id)
    .bind(now)
    .bind(expires_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn release_locks_for_task(pool: &SqlitePool, task_id: &str) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    release_locks_for_task_conn(&mut conn, task_id).await
}

pub async fn release_locks_for_task_conn(
    conn: &mut SqliteConnection,
    task_id: &str,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM file_locks WHERE task_id = ?")
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// All locks whose expiry is open-ended or in the future. Expired rows are
/// treated as absent; no background sweep is needed for correctness.
pub async fn active_locks(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<FileLock>> {
    let locks = sqlx::query_as::<_, FileLock>(
        "SELECT file_path, agent_id, task_id, locked_at, expires_at \
         FROM file_locks \
         WHERE expires_at IS NULL OR expires_at > ? \
         ORDER BY file_path ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(locks)
}

pub async fn locks_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<FileLock>> {
    let locks = sqlx::query_as::<_, FileLock>(
        "SELECT file_path, agent_id, task_id, locked_at, expires_at \
         FROM file_locks WHERE task_id = ? ORDER BY file_path ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(locks)
}

/// Emergency release of a single path, regardless of holder.
pub async fn delete_lock_by_path(pool: &SqlitePool, file_path: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM file_locks WHERE file_path = ?")
        .bind(file_path)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
