//! System-wide default values.
//!
//! Every threshold the business logic consults is overridable through the
//! environment (see `config`); the values here are only the fallbacks.

// ⚙️ ROUTING CONFIGURATION
/// Complexity at or above which work leaves the local GPU tier.
pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 7.0;

/// Complexity at or above which the router considers hosted-expensive tiers.
pub const HOSTED_TIER_THRESHOLD: f64 = 9.0;

/// Band in which a hosted second opinion on complexity is worth its cost.
pub const DEFAULT_SECOND_OPINION_MIN: f64 = 4.0;
pub const DEFAULT_SECOND_OPINION_MAX: f64 = 7.0;

/// Context-window targets for the local tier, in tokens.
pub const LOCAL_CONTEXT_DEFAULT: u32 = 16_384;
pub const LOCAL_CONTEXT_SMALL: u32 = 8_192;
pub const LOCAL_CONTEXT_LARGE: u32 = 32_768;

/// Below this complexity the small local window is enough.
pub const LOCAL_CONTEXT_SMALL_THRESHOLD: f64 = 3.0;

// 💰 CONTRACT-LEVEL COST ESTIMATES (USD per task)
pub const COST_OLLAMA: f64 = 0.0;
pub const COST_HAIKU: f64 = 0.001;
pub const COST_SONNET: f64 = 0.005;
pub const COST_OPUS: f64 = 0.02;

// 🔒 RESOURCE POOL
/// Single local GPU by default.
pub const DEFAULT_OLLAMA_SLOTS: u32 = 1;
/// Paid-API concurrency budget.
pub const DEFAULT_CLAUDE_SLOTS: u32 = 3;

// 🗂️ FILE LOCKS
/// Locks not released by a terminal transition expire after this long.
pub const FILE_LOCK_TTL_MINUTES: i64 = 30;

// 🔁 AUTO-RETRY LADDER
pub const DEFAULT_MAX_OLLAMA_RETRIES: u32 = 1;
pub const DEFAULT_MAX_REMOTE_RETRIES: u32 = 1;
pub const DEFAULT_MAX_HAIKU_RETRIES: u32 = 1;
/// Hard cap across all phases, regardless of per-phase budgets.
pub const DEFAULT_MAX_TOTAL_RETRIES: u32 = 3;
pub const DEFAULT_VALIDATION_TIMEOUT_MS: u64 = 15_000;

// ⏱️ STUCK-TASK RECOVERY
pub const DEFAULT_STUCK_TASK_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_STUCK_CHECK_INTERVAL_MS: u64 = 60_000;

// 🔍 CODE REVIEW GATE
/// Every Nth local-tier completion is reviewed by the cheap hosted model.
pub const DEFAULT_OLLAMA_REVIEW_INTERVAL: u64 = 5;
/// Every Nth complexity>5 completion is reviewed by the expensive model.
pub const DEFAULT_OPUS_REVIEW_INTERVAL: u64 = 10;
/// Quality scores below this fail the review.
pub const DEFAULT_REVIEW_QUALITY_THRESHOLD: f64 = 6.0;
/// Completions below this complexity never count toward the expensive
/// review counter.
pub const REVIEW_COMPLEXITY_FLOOR: f64 = 5.0;

// 🧘 LOCAL-TIER COOLDOWN
/// Rest window applied to an agent after a local-tier execution, in ms.
pub const DEFAULT_REST_DELAY_MIN_MS: u64 = 2_000;
pub const DEFAULT_REST_DELAY_MAX_MS: u64 = 5_000;
/// Context reset is requested every Nth local execution per agent.
pub const DEFAULT_AGENT_RESET_INTERVAL: u64 = 3;

// 📡 EVENT BRIDGE
/// Cross-process publishes are abandoned after this long.
pub const DEFAULT_BUS_PUBLISH_TIMEOUT_MS: u64 = 2_000;
/// In-process fan-out channel depth; slow subscribers lag past this.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// 🤖 AGENT RUNTIME RPC
pub const DEFAULT_AGENT_RPC_TIMEOUT_MS: u64 = 300_000;

// 📋 TASK DEFAULTS
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
pub const DEFAULT_TASK_PRIORITY: i64 = 5;

// 🗄️ WORKSPACE OUTPUT
/// Short-id prefix length used in persisted output file names.
pub const TASK_ID_SHORT_LENGTH: usize = 8;
/// Title slug length cap in persisted output file names.
pub const TASK_SLUG_LENGTH: usize = 30;
/// Retention: newest N output files survive cleanup.
pub const WORKSPACE_RETAIN_FILES: usize = 200;

// 📊 METRICS
/// Timeline endpoint window, in days.
pub const METRICS_TIMELINE_DAYS: i64 = 14;
