//! Typed access over the relational store.
//!
//! The pool lives in [`Store`]; query functions are free functions over the
//! pool (or a connection, for the few paths that must share a transaction),
//! one module per table family.

use crate::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tracing::info;

pub mod agents;
pub mod executions;
pub mod locks;
pub mod metrics;
pub mod reviews;
pub mod tasks;

const SCHEMA: &str = include_str!("schema.sql");

/// Shared handle over the SQLite pool. Cheap to clone; constructed once at
/// startup and passed explicitly to every service.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the configured database and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Connected to store at {}", url);
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same ephemeral database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::models::{Agent, AgentType, Task, TaskType};

    #[tokio::test]
    async fn schema_applies_twice_without_error() {
        let store = Store::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn task_and_agent_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();

        let agent = Agent::new("dev-1", AgentType::Coder);
        agents::insert_agent(store.pool(), &agent).await.unwrap();
        let loaded = agents::get_agent(store.pool(), &agent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.name, "dev-1");
        assert_eq!(loaded.agent_type, AgentType::Coder);

        let task = Task::new("add", "Create a simple function", TaskType::Code)
            .with_locked_files(vec!["src/x.rs".to_string()]);
        tasks::insert_task(store.pool(), &task).await.unwrap();
        let loaded = tasks::get_task(store.pool(), &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "add");
        assert_eq!(loaded.locked_files.0, vec!["src/x.rs".to_string()]);
        assert!(loaded.completed_at.is_none());
    }
}
