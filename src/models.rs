use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants;

/// Error returned when parsing an invalid enum string from a request or row.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[sqlx(type_name = "text", rename_all = "snake_case")]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $text,)+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Position of a task in its lifecycle state machine.
    ///
    /// `Failed` is reachable only through the code-review escalation path;
    /// the executor itself terminates tasks in `Completed` or `Aborted`.
    TaskStatus {
        Pending => "pending",
        Assigned => "assigned",
        InProgress => "in_progress",
        Completed => "completed",
        Aborted => "aborted",
        NeedsHuman => "needs_human",
        Failed => "failed",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    /// True while the task owns its declared file locks.
    pub fn holds_locks(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::NeedsHuman)
    }
}

text_enum! {
    /// Roles in the fleet. Coders serve the local tier only, qa agents the
    /// hosted tiers, and the cto is the escalation actor reserved for the
    /// top tier and decomposition work.
    AgentType {
        Coder => "coder",
        Qa => "qa",
        Cto => "cto",
    }
}

text_enum! {
    AgentState {
        Idle => "idle",
        Busy => "busy",
        Stuck => "stuck",
        Offline => "offline",
    }
}

text_enum! {
    TaskType {
        Code => "code",
        Test => "test",
        Review => "review",
        Debug => "debug",
        Refactor => "refactor",
        Decomposition => "decomposition",
    }
}

impl TaskType {
    /// Base difficulty contribution used by the complexity heuristic.
    pub fn complexity_weight(&self) -> f64 {
        match self {
            Self::Code => 1.0,
            Self::Test => 1.5,
            Self::Refactor => 2.0,
            Self::Review => 2.0,
            Self::Debug => 1.5,
            Self::Decomposition => 2.0,
        }
    }
}

text_enum! {
    /// Execution tiers, cheapest first.
    ModelTier {
        Ollama => "ollama",
        Haiku => "haiku",
        Sonnet => "sonnet",
        Opus => "opus",
    }
}

impl ModelTier {
    pub fn estimated_cost(&self) -> f64 {
        match self {
            Self::Ollama => constants::COST_OLLAMA,
            Self::Haiku => constants::COST_HAIKU,
            Self::Sonnet => constants::COST_SONNET,
            Self::Opus => constants::COST_OPUS,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Ollama => ResourceType::Ollama,
            _ => ResourceType::Claude,
        }
    }

    pub fn is_hosted(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

text_enum! {
    /// Shared compute slot families guarded by the resource pool.
    ResourceType {
        Ollama => "ollama",
        Claude => "claude",
    }
}

text_enum! {
    ComplexitySource {
        Router => "router",
        Haiku => "haiku",
        Dual => "dual",
        Actual => "actual",
    }
}

text_enum! {
    ErrorCategory {
        Timeout => "timeout",
        Syntax => "syntax",
        ImportError => "import_error",
        Other => "other",
    }
}

text_enum! {
    ExecutionStatus {
        Started => "started",
        Completed => "completed",
        Failed => "failed",
    }
}

text_enum! {
    ReviewStatus {
        Approved => "approved",
        NeedsFixes => "needs_fixes",
    }
}

text_enum! {
    Severity {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

/// The unit of work.
///
/// Mutated only by the assigner, the executor and the stuck-task sweeper;
/// everything else reads. `locked_files` is the ordered set of paths the
/// task will write, claimed in the lock manager exactly while the status
/// holds locks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub mission_id: Option<String>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: i64,
    pub max_iterations: i64,
    pub current_iteration: i64,
    pub locked_files: Json<Vec<String>>,
    pub validation_command: Option<String>,
    pub language: Option<String>,
    pub required_agent: Option<AgentType>,
    pub preferred_model: Option<ModelTier>,
    pub complexity: Option<f64>,
    pub complexity_source: Option<ComplexitySource>,
    pub complexity_reasoning: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub result: Option<Json<serde_json::Value>>,
    pub needs_human_review: bool,
    pub review_context: Option<String>,
    pub api_credits_used: f64,
    pub time_spent_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a new pending task with defaults for everything the caller
    /// does not set.
    pub fn new(title: impl Into<String>, description: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            mission_id: None,
            title: title.into(),
            description: description.into(),
            task_type,
            priority: constants::DEFAULT_TASK_PRIORITY,
            max_iterations: constants::DEFAULT_MAX_ITERATIONS as i64,
            current_iteration: 0,
            locked_files: Json(Vec::new()),
            validation_command: None,
            language: None,
            required_agent: None,
            preferred_model: None,
            complexity: None,
            complexity_source: None,
            complexity_reasoning: None,
            assigned_agent_id: None,
            assigned_at: None,
            status: TaskStatus::Pending,
            error: None,
            error_category: None,
            result: None,
            needs_human_review: false,
            review_context: None,
            api_credits_used: 0.0,
            time_spent_ms: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_locked_files(mut self, paths: Vec<String>) -> Self {
        self.locked_files = Json(paths);
        self
    }

    pub fn with_validation_command(mut self, command: impl Into<String>) -> Self {
        self.validation_command = Some(command.into());
        self
    }

    pub fn with_required_agent(mut self, agent_type: AgentType) -> Self {
        self.required_agent = Some(agent_type);
        self
    }

    /// View over the opaque result blob, for the handful of fields the core
    /// itself reads.
    pub fn result_view(&self) -> Option<ResultView<'_>> {
        self.result.as_ref().map(|json| ResultView(&json.0))
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(constants::TASK_ID_SHORT_LENGTH)]
    }
}

/// Accessors over the dynamically shaped `result` payload an agent returns.
/// The blob stays opaque; only the fields the engine inspects get helpers.
pub struct ResultView<'a>(pub &'a serde_json::Value);

impl ResultView<'_> {
    pub fn output(&self) -> Option<&str> {
        self.0.get("output").and_then(|v| v.as_str())
    }

    pub fn success(&self) -> Option<bool> {
        self.0.get("success").and_then(|v| v.as_bool())
    }

    pub fn test_results(&self) -> Option<&str> {
        self.0.get("test_results").and_then(|v| v.as_str())
    }
}

/// A long-lived executor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub status: AgentState,
    pub current_task_id: Option<String>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub total_api_credits: f64,
    pub total_time_ms: i64,
    pub preferred_model: Option<ModelTier>,
    pub always_use_hosted: bool,
    pub max_context_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, agent_type: AgentType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            agent_type,
            status: AgentState::Idle,
            current_task_id: None,
            tasks_completed: 0,
            tasks_failed: 0,
            total_api_credits: 0.0,
            total_time_ms: 0,
            preferred_model: None,
            always_use_hosted: false,
            max_context_tokens: constants::LOCAL_CONTEXT_DEFAULT as i64,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        self.tasks_completed as f64 / total as f64
    }
}

/// Exclusive claim on a filesystem path. At most one unexpired lock exists
/// per path; the store enforces this with a UNIQUE constraint.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileLock {
    pub file_path: String,
    pub agent_id: String,
    pub task_id: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FileLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }
}

/// One agent-facing attempt at a task. Never mutated after reaching a
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub iteration: i64,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: Option<Json<serde_json::Value>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Individual step the agent took within an attempt. Consumed by the
/// post-hoc complexity calculation and the review gate.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionLogEntry {
    pub id: String,
    pub task_id: String,
    pub execution_id: String,
    pub step_index: i64,
    pub thought: Option<String>,
    pub action: Option<String>,
    pub action_input: Option<String>,
    pub observation: Option<String>,
    pub duration_ms: i64,
    pub is_loop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub suggestion: Option<String>,
}

/// Reviewer verdict for one completed task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CodeReview {
    pub id: String,
    pub task_id: String,
    pub reviewer_tier: ModelTier,
    pub quality_score: f64,
    pub findings: Json<Vec<ReviewFinding>>,
    pub has_syntax_errors: bool,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

impl CodeReview {
    pub fn has_critical_finding(&self) -> bool {
        self.findings
            .0
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }
}

/// Routing proposal. The router never mutates task state; the assigner is
/// the sole writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub task_id: String,
    pub complexity: f64,
    pub complexity_source: ComplexitySource,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub model_tier: ModelTier,
    pub resource_type: ResourceType,
    pub context_window: Option<u32>,
    pub estimated_cost: f64,
    pub confidence: f64,
    pub reason: String,
}

/// The router's advice about which tier should retry a failed task,
/// distinct from the auto-retry ladder's phase decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixDecision {
    pub tier: ModelTier,
    pub escalate_to_human: bool,
}
