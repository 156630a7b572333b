//! HTTP API server and endpoints.
//!
//! Thin adapter over the engine services: handlers parse and validate,
//! call one service operation, and map `FleetError` kinds onto REST status
//! codes. No business rules live here.

mod ws;

use crate::{
    config::{ApiConfig, Config},
    events::{EventBridge, EventKind},
    executor::TaskExecutor,
    locks::FileLockManager,
    models::{Agent, AgentType, ModelTier, Task, TaskStatus, TaskType},
    queue::TaskAssigner,
    resources::ResourcePool,
    review::ReviewGate,
    router::ComplexityRouter,
    store::{agents, metrics, tasks, Store},
    workspace::WorkspaceStore,
    FleetError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use validator::Validate;

const SERVICE_NAME: &str = "fleet-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_QUEUE: &str = "/queue";
const ROUTE_QUEUE_ASSIGN: &str = "/queue/assign";
const ROUTE_QUEUE_AUTO_ASSIGN: &str = "/queue/auto-assign";
const ROUTE_QUEUE_SMART_ASSIGN: &str = "/queue/smart-assign";
const ROUTE_QUEUE_PARALLEL_ASSIGN: &str = "/queue/parallel-assign";
const ROUTE_QUEUE_ROUTE_PREVIEW: &str = "/queue/{task_id}/route";
const ROUTE_QUEUE_LOCKS: &str = "/queue/locks";
const ROUTE_QUEUE_LOCK_BY_PATH: &str = "/queue/locks/{*path}";
const ROUTE_QUEUE_RESOURCES: &str = "/queue/resources";
const ROUTE_QUEUE_RESOURCES_CLEAR: &str = "/queue/resources/clear";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_BY_ID: &str = "/agents/{agent_id}";
const ROUTE_AGENTS_RESET_ALL: &str = "/agents/reset-all";
const ROUTE_EXECUTE: &str = "/execute";
const ROUTE_METRICS_OVERVIEW: &str = "/metrics/overview";
const ROUTE_METRICS_TIMELINE: &str = "/metrics/timeline";
const ROUTE_METRICS_DISTRIBUTION: &str = "/metrics/distribution";
const ROUTE_METRICS_SUCCESS_RATE: &str = "/metrics/success-rate";
const ROUTE_METRICS_SUCCESS_BY_AGENT: &str = "/metrics/success-rate/by-agent";
const ROUTE_METRICS_COMPLEXITY: &str = "/metrics/complexity-distribution";
const ROUTE_REVIEW_COUNTERS: &str = "/reviews/counters";
const ROUTE_REVIEW_COUNTERS_RESET: &str = "/reviews/counters/reset";
const ROUTE_WORKSPACES: &str = "/workspaces";
const ROUTE_WS: &str = "/ws";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    store: Store,
    assigner: Arc<TaskAssigner>,
    executor: Arc<TaskExecutor>,
    router: ComplexityRouter,
    resources: ResourcePool,
    locks: FileLockManager,
    events: EventBridge,
    review: Arc<ReviewGate>,
    workspace: WorkspaceStore,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn error_response(error: FleetError) -> ApiError {
    let status = match &error {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::Conflict(_) => StatusCode::CONFLICT,
        FleetError::Validation(_) => StatusCode::BAD_REQUEST,
        FleetError::ResourceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %error, "internal error surfaced to API");
    }
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal server error".to_string()
    } else {
        error.to_string()
    };
    (
        status,
        Json(ErrorResponse {
            error: message,
            details: None,
        }),
    )
}

fn validation_response(errors: validator::ValidationErrors) -> ApiError {
    let details = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |e| FieldError {
                field: field.to_string(),
                message: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            })
        })
        .collect();
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "validation failed".to_string(),
            details: Some(details),
        }),
    )
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 20_000))]
    pub description: String,
    pub task_type: TaskType,
    #[validate(range(min = 1, max = 10))]
    pub priority: Option<i64>,
    #[validate(range(min = 1, max = 10))]
    pub max_iterations: Option<i64>,
    pub locked_files: Option<Vec<String>>,
    pub validation_command: Option<String>,
    pub language: Option<String>,
    pub required_agent: Option<AgentType>,
    pub mission_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateTaskRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    #[validate(length(min = 1, max = 20_000))]
    pub description: Option<String>,
    #[validate(range(min = 1, max = 10))]
    pub priority: Option<i64>,
    #[validate(range(min = 1, max = 10))]
    pub max_iterations: Option<i64>,
    pub locked_files: Option<Vec<String>>,
    pub validation_command: Option<String>,
    pub language: Option<String>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
    pub task_type: Option<TaskType>,
    pub mission_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ManualAssignRequest {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AutoAssignRequest {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteTaskRequest {
    pub task_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAgentRequest {
    pub preferred_model: Option<ModelTier>,
    pub always_use_hosted: Option<bool>,
    #[validate(range(min = 1024, max = 262_144))]
    pub max_context_tokens: Option<i64>,
    pub status: Option<crate::models::AgentState>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineParams {
    pub days: Option<i64>,
}

impl ApiServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        store: Store,
        assigner: Arc<TaskAssigner>,
        executor: Arc<TaskExecutor>,
        router: ComplexityRouter,
        resources: ResourcePool,
        locks: FileLockManager,
        events: EventBridge,
        review: Arc<ReviewGate>,
        workspace: WorkspaceStore,
    ) -> Self {
        Self {
            config: config.api.clone(),
            store,
            assigner,
            executor,
            router,
            resources,
            locks,
            events,
            review,
            workspace,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| FleetError::Internal(e.into()))?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .await
            .map_err(|e| FleetError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(
                ROUTE_TASK_BY_ID,
                get(get_task).patch(update_task).delete(delete_task),
            )
            .route(ROUTE_QUEUE, get(get_queue))
            .route(ROUTE_QUEUE_ASSIGN, post(manual_assign))
            .route(ROUTE_QUEUE_AUTO_ASSIGN, post(auto_assign))
            .route(ROUTE_QUEUE_SMART_ASSIGN, post(smart_assign))
            .route(ROUTE_QUEUE_PARALLEL_ASSIGN, post(parallel_assign))
            .route(ROUTE_QUEUE_ROUTE_PREVIEW, get(route_preview))
            .route(ROUTE_QUEUE_LOCKS, get(list_locks))
            .route(ROUTE_QUEUE_LOCK_BY_PATH, delete(force_release_lock))
            .route(ROUTE_QUEUE_RESOURCES, get(resource_status))
            .route(ROUTE_QUEUE_RESOURCES_CLEAR, post(clear_resources))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_AGENT_BY_ID, get(get_agent).patch(update_agent))
            .route(ROUTE_AGENTS_RESET_ALL, post(reset_all_agents))
            .route(ROUTE_EXECUTE, post(execute_task))
            .route(ROUTE_METRICS_OVERVIEW, get(metrics_overview))
            .route(ROUTE_METRICS_TIMELINE, get(metrics_timeline))
            .route(ROUTE_METRICS_DISTRIBUTION, get(metrics_distribution))
            .route(ROUTE_METRICS_SUCCESS_RATE, get(metrics_success_rate))
            .route(ROUTE_METRICS_SUCCESS_BY_AGENT, get(metrics_success_by_agent))
            .route(ROUTE_METRICS_COMPLEXITY, get(metrics_complexity))
            .route(ROUTE_REVIEW_COUNTERS, get(review_counters))
            .route(ROUTE_REVIEW_COUNTERS_RESET, post(reset_review_counters))
            .route(ROUTE_WORKSPACES, get(list_workspaces))
            .route(ROUTE_WS, get(ws::event_stream))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn create_task(
    State(server): State<ApiServer>,
    Json(request): Json<CreateTaskRequest>,
) -> std::result::Result<(StatusCode, Json<Task>), ApiError> {
    request.validate().map_err(validation_response)?;

    let mut task = Task::new(request.title, request.description, request.task_type);
    if let Some(priority) = request.priority {
        task.priority = priority;
    }
    if let Some(max_iterations) = request.max_iterations {
        task.max_iterations = max_iterations;
    }
    if let Some(locked_files) = request.locked_files {
        task.locked_files = sqlx::types::Json(locked_files);
    }
    task.validation_command = request.validation_command;
    task.language = request.language;
    task.required_agent = request.required_agent;
    task.mission_id = request.mission_id;

    tasks::insert_task(server.store.pool(), &task)
        .await
        .map_err(error_response)?;
    info!(task_id = %task.id, "task created");
    server.events.publish_task(EventKind::TaskCreated, &task).await;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(server): State<ApiServer>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<Vec<Task>> {
    let filter = tasks::TaskFilter {
        status: params.status,
        assigned_agent_id: params.agent,
        task_type: params.task_type,
        mission_id: params.mission_id,
        limit: params.limit,
    };
    tasks::list_tasks(server.store.pool(), &filter)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    tasks::get_task(server.store.pool(), &task_id)
        .await
        .map_err(error_response)?
        .map(Json)
        .ok_or_else(|| error_response(FleetError::NotFound(format!("task {task_id}"))))
}

async fn update_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(request): Json<UpdateTaskRequest>,
) -> ApiResult<Task> {
    request.validate().map_err(validation_response)?;

    // Status changes ride the executor's state machine helpers.
    if let Some(status) = request.status {
        let task = tasks::get_task(server.store.pool(), &task_id)
            .await
            .map_err(error_response)?
            .ok_or_else(|| error_response(FleetError::NotFound(format!("task {task_id}"))))?;
        let updated = match (task.status, status) {
            (TaskStatus::NeedsHuman, TaskStatus::Assigned) => {
                server.executor.resolve_human(&task_id, true).await
            }
            (TaskStatus::NeedsHuman, TaskStatus::Aborted) => {
                server.executor.resolve_human(&task_id, false).await
            }
            (TaskStatus::Assigned | TaskStatus::InProgress, TaskStatus::NeedsHuman) => {
                server.executor.mark_needs_human(&task_id, "escalated via API").await
            }
            (from, to) => Err(FleetError::Conflict(format!(
                "unsupported status transition {from} -> {to}"
            ))),
        }
        .map_err(error_response)?;
        return Ok(Json(updated));
    }

    let mut task = tasks::get_task(server.store.pool(), &task_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(FleetError::NotFound(format!("task {task_id}"))))?;
    if task.status.is_terminal() {
        return Err(error_response(FleetError::Conflict(format!(
            "task {task_id} is {}, fields are frozen",
            task.status
        ))));
    }

    if let Some(title) = request.title {
        task.title = title;
    }
    if let Some(description) = request.description {
        task.description = description;
    }
    if let Some(priority) = request.priority {
        task.priority = priority;
    }
    if let Some(max_iterations) = request.max_iterations {
        task.max_iterations = max_iterations;
    }
    if let Some(locked_files) = request.locked_files {
        task.locked_files = sqlx::types::Json(locked_files);
    }
    if request.validation_command.is_some() {
        task.validation_command = request.validation_command;
    }
    if request.language.is_some() {
        task.language = request.language;
    }
    task.updated_at = chrono::Utc::now();
    tasks::update_task(server.store.pool(), &task)
        .await
        .map_err(error_response)?;
    server.events.emit_task(EventKind::TaskUpdated, &task);
    Ok(Json(task))
}

async fn delete_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let task = tasks::get_task(server.store.pool(), &task_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(FleetError::NotFound(format!("task {task_id}"))))?;

    // Admin delete reclaims whatever the task still holds.
    server
        .locks
        .release_file_locks(&task_id)
        .await
        .map_err(error_response)?;
    server.resources.release(&task_id);
    tasks::delete_task(server.store.pool(), &task_id)
        .await
        .map_err(error_response)?;
    server.events.emit_task(EventKind::TaskDeleted, &task);
    Ok(Json(serde_json::json!({"deleted": task_id})))
}

async fn get_queue(State(server): State<ApiServer>) -> ApiResult<crate::queue::QueueSnapshot> {
    server
        .assigner
        .queue_snapshot()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn manual_assign(
    State(server): State<ApiServer>,
    Json(request): Json<ManualAssignRequest>,
) -> ApiResult<Task> {
    server
        .assigner
        .assign_task(&request.task_id, &request.agent_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn auto_assign(
    State(server): State<ApiServer>,
    Json(request): Json<AutoAssignRequest>,
) -> ApiResult<serde_json::Value> {
    let assigned = server
        .assigner
        .assign_next_task(&request.agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "assigned": assigned })))
}

async fn smart_assign(State(server): State<ApiServer>) -> ApiResult<serde_json::Value> {
    let outcome = server.assigner.smart_assign().await.map_err(error_response)?;
    match outcome {
        Some((task, decision)) => Ok(Json(serde_json::json!({
            "assigned": task,
            "decision": decision,
        }))),
        None => Ok(Json(serde_json::json!({ "assigned": null }))),
    }
}

async fn parallel_assign(State(server): State<ApiServer>) -> ApiResult<serde_json::Value> {
    let assigned = server.assigner.parallel_assign().await.map_err(error_response)?;
    Ok(Json(serde_json::json!({ "assigned": assigned })))
}

async fn route_preview(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
) -> ApiResult<crate::models::RouteDecision> {
    let task = tasks::get_task(server.store.pool(), &task_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(FleetError::NotFound(format!("task {task_id}"))))?;
    server
        .router
        .route_task(&task)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn list_locks(State(server): State<ApiServer>) -> ApiResult<Vec<crate::models::FileLock>> {
    server
        .locks
        .active_locks()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn force_release_lock(
    State(server): State<ApiServer>,
    Path(path): Path<String>,
) -> ApiResult<serde_json::Value> {
    let released = server
        .locks
        .force_release_path(&path)
        .await
        .map_err(error_response)?;
    if !released {
        return Err(error_response(FleetError::NotFound(format!(
            "no lock on {path}"
        ))));
    }
    warn!(path = %path, "file lock force released");
    Ok(Json(serde_json::json!({"released": path})))
}

async fn resource_status(
    State(server): State<ApiServer>,
) -> Json<crate::resources::ResourceStatus> {
    Json(server.resources.status())
}

async fn clear_resources(State(server): State<ApiServer>) -> Json<serde_json::Value> {
    server.resources.clear();
    Json(serde_json::json!({"cleared": true}))
}

async fn list_agents(State(server): State<ApiServer>) -> ApiResult<Vec<Agent>> {
    agents::list_agents(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_agent(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
) -> ApiResult<Agent> {
    agents::get_agent(server.store.pool(), &agent_id)
        .await
        .map_err(error_response)?
        .map(Json)
        .ok_or_else(|| error_response(FleetError::NotFound(format!("agent {agent_id}"))))
}

async fn update_agent(
    State(server): State<ApiServer>,
    Path(agent_id): Path<String>,
    Json(request): Json<UpdateAgentRequest>,
) -> ApiResult<Agent> {
    request.validate().map_err(validation_response)?;
    let mut agent = agents::get_agent(server.store.pool(), &agent_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(FleetError::NotFound(format!("agent {agent_id}"))))?;

    if request.preferred_model.is_some() {
        agent.preferred_model = request.preferred_model;
    }
    if let Some(always_use_hosted) = request.always_use_hosted {
        agent.always_use_hosted = always_use_hosted;
    }
    if let Some(max_context_tokens) = request.max_context_tokens {
        agent.max_context_tokens = max_context_tokens;
    }
    if let Some(status) = request.status {
        agent.status = status;
    }
    agent.updated_at = chrono::Utc::now();
    agents::update_agent(server.store.pool(), &agent)
        .await
        .map_err(error_response)?;
    server.events.emit_agent(&agent);
    Ok(Json(agent))
}

async fn reset_all_agents(State(server): State<ApiServer>) -> ApiResult<serde_json::Value> {
    let reset = agents::reset_all(server.store.pool())
        .await
        .map_err(error_response)?;
    info!(reset, "all agents reset to idle");
    Ok(Json(serde_json::json!({"reset": reset})))
}

async fn execute_task(
    State(server): State<ApiServer>,
    Json(request): Json<ExecuteTaskRequest>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // Fail fast on a missing task, then run the attempt in the background;
    // agent RPCs can take minutes.
    tasks::get_task(server.store.pool(), &request.task_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| {
            error_response(FleetError::NotFound(format!("task {}", request.task_id)))
        })?;

    let executor = server.executor.clone();
    let task_id = request.task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.run_attempt(&task_id).await {
            error!(task_id = %task_id, error = %e, "attempt failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"task_id": request.task_id, "status": "started"})),
    ))
}

async fn metrics_overview(State(server): State<ApiServer>) -> ApiResult<metrics::MetricsOverview> {
    metrics::overview(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn metrics_timeline(
    State(server): State<ApiServer>,
    Query(params): Query<TimelineParams>,
) -> ApiResult<Vec<metrics::TimelinePoint>> {
    metrics::timeline(server.store.pool(), params.days)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn metrics_distribution(
    State(server): State<ApiServer>,
) -> ApiResult<Vec<metrics::TypeCount>> {
    metrics::distribution_by_type(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn metrics_success_rate(State(server): State<ApiServer>) -> ApiResult<metrics::SuccessRate> {
    metrics::success_rate(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn metrics_success_by_agent(
    State(server): State<ApiServer>,
) -> ApiResult<Vec<metrics::AgentSuccessRate>> {
    metrics::success_rate_by_agent(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn metrics_complexity(
    State(server): State<ApiServer>,
) -> ApiResult<Vec<metrics::ComplexityBucket>> {
    metrics::complexity_distribution(server.store.pool())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn review_counters(
    State(server): State<ApiServer>,
) -> Json<crate::review::ReviewCounters> {
    Json(server.review.counters())
}

async fn reset_review_counters(State(server): State<ApiServer>) -> Json<serde_json::Value> {
    server.review.reset_counters();
    Json(serde_json::json!({"reset": true}))
}

async fn list_workspaces(
    State(server): State<ApiServer>,
) -> ApiResult<Vec<crate::workspace::WorkspaceFile>> {
    server
        .workspace
        .list_files()
        .await
        .map(Json)
        .map_err(error_response)
}
