use crate::{
    constants,
    models::AgentType,
    Result, FleetError,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;


/// Top-level configuration, loaded once at startup and passed explicitly to
/// every service. No component reads the environment after `load()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub runtime: RuntimeConfig,
    pub hosted: HostedConfig,
    pub bus: BusConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub review: ReviewConfig,
    pub router: RouterConfig,
    pub resources: ResourceConfig,
    pub workspace: WorkspaceConfig,
    pub roster: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://fleet-core.db?mode=rwc".to_string(),
        }
    }
}

/// Agent runtime RPC endpoints. `remote_base_url` is the optional larger
/// local-style endpoint used by phase 2 of the retry ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub remote_base_url: Option<String>,
    pub rpc_timeout_ms: u64,
    pub rest_delay_min_ms: u64,
    pub rest_delay_max_ms: u64,
    pub reset_interval: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8420".to_string(),
            remote_base_url: None,
            rpc_timeout_ms: constants::DEFAULT_AGENT_RPC_TIMEOUT_MS,
            rest_delay_min_ms: constants::DEFAULT_REST_DELAY_MIN_MS,
            rest_delay_max_ms: constants::DEFAULT_REST_DELAY_MAX_MS,
            reset_interval: constants::DEFAULT_AGENT_RESET_INTERVAL,
        }
    }
}

/// Hosted model vendor access. When `api_key` is absent the router skips
/// second opinions and the review gate skips hosted reviews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub url: Option<String>,
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            publish_timeout_ms: constants::DEFAULT_BUS_PUBLISH_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_ollama_retries: u32,
    pub max_remote_retries: u32,
    pub max_haiku_retries: u32,
    pub max_total_retries: u32,
    pub validation_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ollama_retries: constants::DEFAULT_MAX_OLLAMA_RETRIES,
            max_remote_retries: constants::DEFAULT_MAX_REMOTE_RETRIES,
            max_haiku_retries: constants::DEFAULT_MAX_HAIKU_RETRIES,
            max_total_retries: constants::DEFAULT_MAX_TOTAL_RETRIES,
            validation_timeout_ms: constants::DEFAULT_VALIDATION_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: constants::DEFAULT_STUCK_TASK_TIMEOUT_MS,
            check_interval_ms: constants::DEFAULT_STUCK_CHECK_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub ollama_interval: u64,
    pub opus_interval: u64,
    pub quality_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            ollama_interval: constants::DEFAULT_OLLAMA_REVIEW_INTERVAL,
            opus_interval: constants::DEFAULT_OPUS_REVIEW_INTERVAL,
            quality_threshold: constants::DEFAULT_REVIEW_QUALITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub complexity_threshold: f64,
    pub second_opinion_enabled: bool,
    pub second_opinion_min: f64,
    pub second_opinion_max: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: constants::DEFAULT_COMPLEXITY_THRESHOLD,
            second_opinion_enabled: true,
            second_opinion_min: constants::DEFAULT_SECOND_OPINION_MIN,
            second_opinion_max: constants::DEFAULT_SECOND_OPINION_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub ollama_slots: u32,
    pub claude_slots: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            ollama_slots: constants::DEFAULT_OLLAMA_SLOTS,
            claude_slots: constants::DEFAULT_CLAUDE_SLOTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: "./workspaces".to_string(),
        }
    }
}

/// One entry of the startup agent roster, parsed from `AGENT_ROSTER`
/// (`name:type` comma list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub agent_type: AgentType,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn bool_or(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let api = ApiConfig {
            host: var_or("API_HOST", "127.0.0.1"),
            port: parse_or("API_PORT", 3000u16),
            allowed_origins: var_or(
                "ALLOWED_ORIGINS",
                "http://localhost:3000,http://127.0.0.1:3000",
            )
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        };

        let database = DatabaseConfig {
            url: var_or("DATABASE_URL", "sqlite://fleet-core.db?mode=rwc"),
        };

        let runtime = RuntimeConfig {
            base_url: var_or("AGENT_RUNTIME_URL", "http://127.0.0.1:8420"),
            remote_base_url: env::var("AGENT_RUNTIME_REMOTE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            rpc_timeout_ms: parse_or("AGENT_RPC_TIMEOUT_MS", constants::DEFAULT_AGENT_RPC_TIMEOUT_MS),
            rest_delay_min_ms: parse_or("AGENT_REST_DELAY_MIN_MS", constants::DEFAULT_REST_DELAY_MIN_MS),
            rest_delay_max_ms: parse_or("AGENT_REST_DELAY_MAX_MS", constants::DEFAULT_REST_DELAY_MAX_MS),
            reset_interval: parse_or("AGENT_RESET_INTERVAL", constants::DEFAULT_AGENT_RESET_INTERVAL),
        };
        if runtime.rest_delay_min_ms > runtime.rest_delay_max_ms {
            return Err(FleetError::ConfigurationError(
                "AGENT_REST_DELAY_MIN_MS must not exceed AGENT_REST_DELAY_MAX_MS".to_string(),
            ));
        }

        let hosted_key = env::var("HOSTED_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if let Some(key) = &hosted_key {
            if !key.starts_with("sk-") || key.len() < 40 {
                return Err(FleetError::ConfigurationError(
                    "HOSTED_API_KEY appears to be invalid (should start with 'sk-' and be at least 40 characters)"
                        .to_string(),
                ));
            }
        }
        let hosted = HostedConfig {
            api_key: hosted_key,
            base_url: var_or("HOSTED_BASE_URL", "https://api.anthropic.com"),
        };

        let bus = BusConfig {
            url: env::var("MCP_BUS_URL").ok().filter(|s| !s.trim().is_empty()),
            publish_timeout_ms: parse_or(
                "BUS_PUBLISH_TIMEOUT_MS",
                constants::DEFAULT_BUS_PUBLISH_TIMEOUT_MS,
            ),
        };

        let retry = RetryConfig {
            enabled: bool_or("AUTO_RETRY_ENABLED", true),
            max_ollama_retries: parse_or(
                "AUTO_RETRY_MAX_OLLAMA_RETRIES",
                constants::DEFAULT_MAX_OLLAMA_RETRIES,
            ),
            max_remote_retries: parse_or(
                "AUTO_RETRY_MAX_REMOTE_RETRIES",
                constants::DEFAULT_MAX_REMOTE_RETRIES,
            ),
            max_haiku_retries: parse_or(
                "AUTO_RETRY_MAX_HAIKU_RETRIES",
                constants::DEFAULT_MAX_HAIKU_RETRIES,
            ),
            max_total_retries: parse_or("MAX_TOTAL_RETRIES", constants::DEFAULT_MAX_TOTAL_RETRIES),
            validation_timeout_ms: parse_or(
                "AUTO_RETRY_VALIDATION_TIMEOUT_MS",
                constants::DEFAULT_VALIDATION_TIMEOUT_MS,
            ),
        };

        let recovery = RecoveryConfig {
            enabled: bool_or("STUCK_TASK_RECOVERY_ENABLED", true),
            timeout_ms: parse_or("STUCK_TASK_TIMEOUT_MS", constants::DEFAULT_STUCK_TASK_TIMEOUT_MS),
            check_interval_ms: parse_or(
                "STUCK_TASK_CHECK_INTERVAL_MS",
                constants::DEFAULT_STUCK_CHECK_INTERVAL_MS,
            ),
        };

        let review = ReviewConfig {
            ollama_interval: parse_or(
                "OLLAMA_REVIEW_INTERVAL",
                constants::DEFAULT_OLLAMA_REVIEW_INTERVAL,
            )
            .max(1),
            opus_interval: parse_or("OPUS_REVIEW_INTERVAL", constants::DEFAULT_OPUS_REVIEW_INTERVAL)
                .max(1),
            quality_threshold: parse_or(
                "REVIEW_QUALITY_THRESHOLD",
                constants::DEFAULT_REVIEW_QUALITY_THRESHOLD,
            ),
        };

        let router = RouterConfig {
            complexity_threshold: parse_or(
                "OLLAMA_COMPLEXITY_THRESHOLD",
                constants::DEFAULT_COMPLEXITY_THRESHOLD,
            ),
            second_opinion_enabled: bool_or("SECOND_OPINION_ENABLED", true),
            second_opinion_min: parse_or("SECOND_OPINION_MIN", constants::DEFAULT_SECOND_OPINION_MIN),
            second_opinion_max: parse_or("SECOND_OPINION_MAX", constants::DEFAULT_SECOND_OPINION_MAX),
        };
        if router.second_opinion_min > router.second_opinion_max {
            return Err(FleetError::ConfigurationError(
                "SECOND_OPINION_MIN must not exceed SECOND_OPINION_MAX".to_string(),
            ));
        }

        let resources = ResourceConfig {
            ollama_slots: parse_or("RESOURCE_POOL_OLLAMA_SLOTS", constants::DEFAULT_OLLAMA_SLOTS),
            claude_slots: parse_or("RESOURCE_POOL_CLAUDE_SLOTS", constants::DEFAULT_CLAUDE_SLOTS),
        };
        if resources.ollama_slots == 0 || resources.claude_slots == 0 {
            return Err(FleetError::ConfigurationError(
                "resource pool slot counts must be at least 1".to_string(),
            ));
        }

        let workspace = WorkspaceConfig {
            dir: var_or("WORKSPACE_DIR", "./workspaces"),
        };

        let roster = parse_roster(&var_or("AGENT_ROSTER", "dev-1:coder,qa-1:qa,cto:cto"))?;

        Ok(Config {
            api,
            database,
            runtime,
            hosted,
            bus,
            retry,
            recovery,
            review,
            router,
            resources,
            workspace,
            roster,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            runtime: RuntimeConfig::default(),
            hosted: HostedConfig::default(),
            bus: BusConfig::default(),
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            review: ReviewConfig::default(),
            router: RouterConfig::default(),
            resources: ResourceConfig::default(),
            workspace: WorkspaceConfig::default(),
            roster: vec![
                RosterEntry {
                    name: "dev-1".to_string(),
                    agent_type: AgentType::Coder,
                },
                RosterEntry {
                    name: "qa-1".to_string(),
                    agent_type: AgentType::Qa,
                },
                RosterEntry {
                    name: "cto".to_string(),
                    agent_type: AgentType::Cto,
                },
            ],
        }
    }
}

fn parse_roster(raw: &str) -> Result<Vec<RosterEntry>> {
    let mut roster = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, type_str) = entry.split_once(':').ok_or_else(|| {
            FleetError::ConfigurationError(format!(
                "AGENT_ROSTER entry {entry:?} must be name:type"
            ))
        })?;
        let agent_type = type_str.trim().parse::<AgentType>().map_err(|e| {
            FleetError::ConfigurationError(format!("AGENT_ROSTER entry {entry:?}: {e}"))
        })?;
        roster.push(RosterEntry {
            name: name.trim().to_string(),
            agent_type,
        });
    }
    if roster.is_empty() {
        return Err(FleetError::ConfigurationError(
            "AGENT_ROSTER must contain at least one agent".to_string(),
        ));
    }
    Ok(roster)
}
