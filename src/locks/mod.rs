//! File Lock Manager: at most one writer per path.
//!
//! The store's UNIQUE constraint on `file_path` plus the conditional upsert
//! make acquisition linearizable. Expired locks count as absent; nothing
//! sweeps them because every read path filters on expiry.

use crate::{
    constants,
    models::FileLock,
    store::{locks, Store},
    FleetError, Result,
};
use chrono::{Duration, Utc};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::debug;

#[derive(Clone)]
pub struct FileLockManager {
    store: Store,
}

impl FileLockManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claim every path for a task, inside the caller's transaction. Each
    /// entry gets `expires_at = now + 30 min`. Fails with `Conflict` on the
    /// first path held by a different task whose lock has not expired; the
    /// caller's transaction rollback then undoes the partial claims.
    pub async fn lock_files_conn(
        &self,
        conn: &mut SqliteConnection,
        task_id: &str,
        agent_id: &str,
        paths: &[String],
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = Some(now + Duration::minutes(constants::FILE_LOCK_TTL_MINUTES));
        for path in paths {
            let claimed =
                locks::upsert_lock_conn(conn, path, agent_id, task_id, now, expires_at).await?;
            if claimed == 0 {
                return Err(FleetError::Conflict(format!(
                    "file {path} is locked by another task"
                )));
            }
        }
        if !paths.is_empty() {
            debug!(task_id, count = paths.len(), "file locks claimed");
        }
        Ok(())
    }

    /// Pool-level variant for paths that do not share a wider transaction.
    pub async fn lock_files(&self, task_id: &str, agent_id: &str, paths: &[String]) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        self.lock_files_conn(&mut tx, task_id, agent_id, paths).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop every lock a task holds. Safe to call on every terminal path;
    /// a task without locks is a no-op.
    pub async fn release_file_locks(&self, task_id: &str) -> Result<u64> {
        let released = locks::release_locks_for_task(self.store.pool(), task_id).await?;
        if released > 0 {
            debug!(task_id, released, "file locks released");
        }
        Ok(released)
    }

    /// Paths currently locked, expired entries excluded.
    pub async fn locked_paths(&self) -> Result<HashSet<String>> {
        let locks = locks::active_locks(self.store.pool(), Utc::now()).await?;
        Ok(locks.into_iter().map(|l| l.file_path).collect())
    }

    /// Active lock rows for the observability endpoint.
    pub async fn active_locks(&self) -> Result<Vec<FileLock>> {
        locks::active_locks(self.store.pool(), Utc::now()).await
    }

    /// Emergency release of a single path, regardless of holder.
    pub async fn force_release_path(&self, path: &str) -> Result<bool> {
        Ok(locks::delete_lock_by_path(self.store.pool(), path).await? > 0)
    }
}
