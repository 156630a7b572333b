//! Query functions for the `agents` table.

use crate::{
    models::{Agent, AgentState, AgentType},
    Result,
};
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

const AGENT_COLUMNS: &str = "id, name, agent_type, status, current_task_id, tasks_completed, \
     tasks_failed, total_api_credits, total_time_ms, preferred_model, always_use_hosted, \
     max_context_tokens, created_at, updated_at";

pub async fn insert_agent(pool: &SqlitePool, agent: &Agent) -> Result<()> {
    sqlx::query(
        "INSERT INTO agents (id, name, agent_type, status, current_task_id, tasks_completed, \
         tasks_failed, total_api_credits, total_time_ms, preferred_model, always_use_hosted, \
         max_context_tokens, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(agent.agent_type)
    .bind(agent.status)
    .bind(&agent.current_task_id)
    .bind(agent.tasks_completed)
    .bind(agent.tasks_failed)
    .bind(agent.total_api_credits)
    .bind(agent.total_time_ms)
    .bind(agent.preferred_model)
    .bind(agent.always_use_hosted)
    .bind(agent.max_context_tokens)
    .bind(agent.created_at)
    .bind(agent.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_agent(pool: &SqlitePool, id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(agent)
}

pub async fn get_agent_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(agent)
}

pub async fn list_agents(pool: &SqlitePool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents ORDER BY name ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(agents)
}

pub async fn list_idle(pool: &SqlitePool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE status = 'idle' ORDER BY name ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(agents)
}

pub async fn find_idle_by_type(pool: &SqlitePool, agent_type: AgentType) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE status = 'idle' AND agent_type = ? \
         ORDER BY tasks_completed ASC LIMIT 1"
    ))
    .bind(agent_type)
    .fetch_optional(pool)
    .await?;
    Ok(agent)
}

pub async fn update_agent(pool: &SqlitePool, agent: &Agent) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    update_agent_conn(&mut conn, agent).await
}

pub async fn update_agent_conn(conn: &mut SqliteConnection, agent: &Agent) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents SET name = ?, agent_type = ?, status = ?, current_task_id = ?, \
         tasks_completed = ?, tasks_failed = ?, total_api_credits = ?, total_time_ms = ?, \
         preferred_model = ?, always_use_hosted = ?, max_context_tokens = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&agent.name)
    .bind(agent.agent_type)
    .bind(agent.status)
    .bind(&agent.current_task_id)
    .bind(agent.tasks_completed)
    .bind(agent.tasks_failed)
    .bind(agent.total_api_credits)
    .bind(agent.total_time_ms)
    .bind(agent.preferred_model)
    .bind(agent.always_use_hosted)
    .bind(agent.max_context_tokens)
    .bind(agent.updated_at)
    .bind(&agent.id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Admin reset: every agent back to idle with no current task.
pub async fn reset_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents SET status = 'idle', current_task_id = NULL, updated_at = ?",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Startup seeding: make sure every configured roster entry exists. Existing
/// agents keep their stats; only missing ones are inserted.
pub async fn ensure_roster(
    pool: &SqlitePool,
    roster: &[crate::config::RosterEntry],
) -> Result<Vec<Agent>> {
    let mut ensured = Vec::with_capacity(roster.len());
    for entry in roster {
        match get_agent_by_name(pool, &entry.name).await? {
            Some(existing) => ensured.push(existing),
            None => {
                let agent = Agent::new(entry.name.clone(), entry.agent_type);
                insert_agent(pool, &agent).await?;
                ensured.push(agent);
            }
        }
    }
    Ok(ensured)
}
