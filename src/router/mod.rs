//! Complexity Router: score a task, pick the cheapest tier likely to
//! succeed, and propose an idle agent for it.
//!
//! The router never mutates task state. `route_with_agents` is a pure
//! function of the task and the idle-agent set; `route_task` only adds the
//! store read and the optional hosted second opinion on top.

use crate::{
    config::RouterConfig,
    constants,
    hosted::HostedModel,
    models::{
        Agent, AgentType, ComplexitySource, FixDecision, ModelTier, RouteDecision, Task, TaskType,
    },
    store::{agents, Store},
    FleetError, Result,
};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Keywords that mark structurally hard work.
const HEAVY_KEYWORDS: [&str; 6] = [
    "multi-file",
    "architecture",
    "refactor",
    "design",
    "integrate",
    "complex",
];

/// Keywords that add moderate difficulty.
const MODERATE_KEYWORDS: [&str; 8] = [
    "test", "debug", "fix", "api", "database", "async", "validate", "verify",
];

/// Keywords that suggest throwaway-simple work.
const SIMPLE_KEYWORDS: [&str; 3] = ["create", "simple", "basic"];

const CONFIDENCE_HEURISTIC: f64 = 0.7;
const CONFIDENCE_DUAL: f64 = 0.85;
const CONFIDENCE_REQUIRED: f64 = 1.0;

#[derive(Clone)]
pub struct ComplexityRouter {
    store: Store,
    hosted: Option<Arc<dyn HostedModel>>,
    config: RouterConfig,
}

impl ComplexityRouter {
    pub fn new(store: Store, hosted: Option<Arc<dyn HostedModel>>, config: RouterConfig) -> Self {
        Self {
            store,
            hosted,
            config,
        }
    }

    /// Deterministic difficulty estimate from the task fields, clamped to
    /// [1, 10].
    pub fn heuristic_complexity(task: &Task) -> (f64, String) {
        let text = format!("{} {}", task.title, task.description).to_lowercase();
        let mut score = 0.0;
        let mut reasons: Vec<String> = Vec::new();

        let step_pattern = Regex::new(r"(?i)step\s+\d+\s*:").expect("static regex");
        let steps = step_pattern.find_iter(&text).count();
        if steps > 0 {
            score += steps as f64 * 0.5;
            reasons.push(format!("{steps} numbered steps"));
        }

        for keyword in HEAVY_KEYWORDS {
            if text.contains(keyword) {
                score += 2.0;
                reasons.push(format!("heavy keyword '{keyword}'"));
            }
        }
        for keyword in MODERATE_KEYWORDS {
            if text.contains(keyword) {
                score += 1.0;
                reasons.push(format!("keyword '{keyword}'"));
            }
        }
        for keyword in SIMPLE_KEYWORDS {
            if text.contains(keyword) {
                score -= 0.5;
                reasons.push(format!("simple keyword '{keyword}'"));
            }
        }

        score += task.task_type.complexity_weight();
        reasons.push(format!("task type {}", task.task_type));

        score += task.priority as f64 * 0.05;

        if task.current_iteration > 0 {
            score += task.current_iteration as f64 * 1.5;
            reasons.push(format!("{} failed iterations", task.current_iteration));
        }

        (score.clamp(1.0, 10.0), reasons.join(", "))
    }

    /// The contract routing table: complexity range to tier, preferred
    /// agent type and context-window target.
    pub fn tier_for(complexity: f64, task_type: TaskType) -> (ModelTier, AgentType, Option<u32>) {
        if complexity < constants::DEFAULT_COMPLEXITY_THRESHOLD {
            let context = if complexity < constants::LOCAL_CONTEXT_SMALL_THRESHOLD {
                constants::LOCAL_CONTEXT_SMALL
            } else {
                constants::LOCAL_CONTEXT_DEFAULT
            };
            (ModelTier::Ollama, AgentType::Coder, Some(context))
        } else if complexity < constants::HOSTED_TIER_THRESHOLD {
            (
                ModelTier::Ollama,
                AgentType::Coder,
                Some(constants::LOCAL_CONTEXT_LARGE),
            )
        } else {
            match task_type {
                TaskType::Review => (ModelTier::Sonnet, AgentType::Qa, None),
                TaskType::Decomposition => (ModelTier::Opus, AgentType::Cto, None),
                _ => (ModelTier::Haiku, AgentType::Qa, None),
            }
        }
    }

    /// Default tier served by an agent type, used when `required_agent`
    /// overrides the complexity-driven choice.
    fn tier_for_agent_type(agent_type: AgentType, complexity: f64) -> (ModelTier, Option<u32>) {
        match agent_type {
            AgentType::Coder => {
                let context = if complexity >= constants::DEFAULT_COMPLEXITY_THRESHOLD {
                    constants::LOCAL_CONTEXT_LARGE
                } else {
                    constants::LOCAL_CONTEXT_DEFAULT
                };
                (ModelTier::Ollama, Some(context))
            }
            AgentType::Qa => (ModelTier::Haiku, None),
            AgentType::Cto => (ModelTier::Opus, None),
        }
    }

    fn pick_agent(idle_agents: &[Agent], preferred: AgentType) -> Option<&Agent> {
        idle_agents
            .iter()
            .find(|a| a.agent_type == preferred)
            .or_else(|| {
                // Escalation fallback: the cto absorbs work nobody else can
                // take right now.
                idle_agents.iter().find(|a| a.agent_type == AgentType::Cto)
            })
    }

    /// Pure routing decision over an explicit idle-agent set. Called twice
    /// with the same inputs it returns the same decision.
    pub fn route_with_agents(
        &self,
        task: &Task,
        complexity: f64,
        complexity_source: ComplexitySource,
        reasoning: &str,
        idle_agents: &[Agent],
    ) -> Result<RouteDecision> {
        // Explicit agent requirement wins over everything.
        if let Some(required) = task.required_agent {
            let agent = Self::pick_agent(idle_agents, required).ok_or_else(|| {
                FleetError::ResourceBusy("all agents busy".to_string())
            })?;
            let (tier, context_window) = Self::tier_for_agent_type(agent.agent_type, complexity);
            return Ok(RouteDecision {
                task_id: task.id.clone(),
                complexity,
                complexity_source,
                agent_id: agent.id.clone(),
                agent_type: agent.agent_type,
                model_tier: tier,
                resource_type: tier.resource_type(),
                context_window,
                estimated_cost: tier.estimated_cost(),
                confidence: CONFIDENCE_REQUIRED,
                reason: format!("task explicitly requires a {required} agent"),
            });
        }

        let (mut tier, preferred_type, mut context_window) =
            Self::tier_for(complexity, task.task_type);

        // A preferred model from review escalation bumps the tier.
        if let Some(preferred) = task.preferred_model {
            if preferred != tier {
                tier = preferred;
                context_window = if preferred == ModelTier::Ollama {
                    context_window
                } else {
                    None
                };
            }
        }

        let agent = Self::pick_agent(idle_agents, preferred_type)
            .ok_or_else(|| FleetError::ResourceBusy("all agents busy".to_string()))?;

        // Agents pinned to hosted execution never serve the free tier.
        if agent.always_use_hosted && tier == ModelTier::Ollama {
            tier = ModelTier::Haiku;
            context_window = None;
        }

        let confidence = match complexity_source {
            ComplexitySource::Dual => CONFIDENCE_DUAL,
            _ => CONFIDENCE_HEURISTIC,
        };

        Ok(RouteDecision {
            task_id: task.id.clone(),
            complexity,
            complexity_source,
            agent_id: agent.id.clone(),
            agent_type: agent.agent_type,
            model_tier: tier,
            resource_type: tier.resource_type(),
            context_window,
            estimated_cost: tier.estimated_cost(),
            confidence,
            reason: format!("complexity {complexity:.1}: {reasoning}"),
        })
    }

    /// Full routing pass: heuristic score, optional hosted second opinion,
    /// then agent selection against the current idle set.
    pub async fn route_task(&self, task: &Task) -> Result<RouteDecision> {
        let (heuristic, reasoning) = Self::heuristic_complexity(task);
        let (complexity, source) = self.second_opinion(task, heuristic).await;
        let idle_agents = agents::list_idle(self.store.pool()).await?;
        let decision =
            self.route_with_agents(task, complexity, source, &reasoning, &idle_agents)?;
        debug!(
            task_id = %task.id,
            complexity = decision.complexity,
            tier = %decision.model_tier,
            agent = %decision.agent_id,
            "route decision"
        );
        Ok(decision)
    }

    /// Hosted second opinion inside the configured band. Failure of the
    /// second opinion never fails the route.
    async fn second_opinion(&self, task: &Task, heuristic: f64) -> (f64, ComplexitySource) {
        if !self.config.second_opinion_enabled
            || heuristic < self.config.second_opinion_min
            || heuristic > self.config.second_opinion_max
        {
            return (heuristic, ComplexitySource::Router);
        }
        let Some(hosted) = &self.hosted else {
            return (heuristic, ComplexitySource::Router);
        };
        match hosted.estimate_complexity(&task.title, &task.description).await {
            Ok(estimate) => (heuristic.max(estimate), ComplexitySource::Dual),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "second opinion failed, keeping heuristic");
                (heuristic, ComplexitySource::Router)
            }
        }
    }
}

/// Which tier should retry a failed task, for human-visible escalation
/// paths. The execution-level retry ladder makes its own phase decisions.
pub fn get_fix_decision(attempt_index: u32) -> FixDecision {
    FixDecision {
        tier: ModelTier::Haiku,
        escalate_to_human: attempt_index >= 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::mock::MockHosted;
    use crate::models::TaskType;
    use crate::store::agents::insert_agent;

    fn idle_roster() -> Vec<Agent> {
        vec![
            Agent::new("dev-1", AgentType::Coder),
            Agent::new("qa-1", AgentType::Qa),
            Agent::new("cto", AgentType::Cto),
        ]
    }

    fn router_over(store: Store, hosted: Option<Arc<dyn HostedModel>>) -> ComplexityRouter {
        ComplexityRouter::new(store, hosted, RouterConfig::default())
    }

    #[test]
    fn simple_task_scores_low() {
        let task = Task::new(
            "add",
            "Create a simple function to add two numbers",
            TaskType::Code,
        );
        let (score, _) = ComplexityRouter::heuristic_complexity(&task);
        assert!(score < 4.0, "expected low complexity, got {score}");
    }

    #[test]
    fn heavy_keywords_drive_score_up() {
        let task = Task::new(
            "rework",
            "Refactor the architecture and integrate the async database layer",
            TaskType::Refactor,
        );
        let (score, reasoning) = ComplexityRouter::heuristic_complexity(&task);
        assert!(score > 7.0, "expected high complexity, got {score}");
        assert!(reasoning.contains("refactor"));
    }

    #[test]
    fn numbered_steps_and_iterations_count() {
        let mut task = Task::new(
            "steps",
            "step 1: parse input step 2: compute step 3: emit output",
            TaskType::Code,
        );
        let (base, _) = ComplexityRouter::heuristic_complexity(&task);
        task.current_iteration = 2;
        let (retried, _) = ComplexityRouter::heuristic_complexity(&task);
        assert!((retried - base - 3.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_clamped_to_scale() {
        let task = Task::new(
            "monster",
            "complex multi-file architecture refactor design integrate test debug fix api \
             database async validate verify step 1: step 2: step 3: step 4:",
            TaskType::Refactor,
        );
        let (score, _) = ComplexityRouter::heuristic_complexity(&task);
        assert_eq!(score, 10.0);
    }

    #[test]
    fn tier_table_matches_contract() {
        assert_eq!(
            ComplexityRouter::tier_for(1.5, TaskType::Code),
            (ModelTier::Ollama, AgentType::Coder, Some(8_192))
        );
        assert_eq!(
            ComplexityRouter::tier_for(3.0, TaskType::Code),
            (ModelTier::Ollama, AgentType::Coder, Some(16_384))
        );
        assert_eq!(
            ComplexityRouter::tier_for(7.5, TaskType::Code),
            (ModelTier::Ollama, AgentType::Coder, Some(32_768))
        );
        assert_eq!(
            ComplexityRouter::tier_for(9.2, TaskType::Code),
            (ModelTier::Haiku, AgentType::Qa, None)
        );
        assert_eq!(
            ComplexityRouter::tier_for(9.2, TaskType::Review),
            (ModelTier::Sonnet, AgentType::Qa, None)
        );
        assert_eq!(
            ComplexityRouter::tier_for(9.2, TaskType::Decomposition),
            (ModelTier::Opus, AgentType::Cto, None)
        );
    }

    #[tokio::test]
    async fn required_agent_overrides_tier_choice() {
        let store = Store::connect_in_memory().await.unwrap();
        let router = router_over(store, None);
        let task = Task::new("trivial", "trivial", TaskType::Code)
            .with_priority(1)
            .with_required_agent(AgentType::Cto);

        let decision = router
            .route_with_agents(&task, 1.5, ComplexitySource::Router, "trivial", &idle_roster())
            .unwrap();
        assert_eq!(decision.agent_type, AgentType::Cto);
        assert_eq!(decision.confidence, 1.0);
        assert!(decision.reason.contains("explicitly requires"));
    }

    #[tokio::test]
    async fn busy_fleet_falls_back_to_cto_then_errors() {
        let store = Store::connect_in_memory().await.unwrap();
        let router = router_over(store, None);
        let task = Task::new("t", "simple fix", TaskType::Code);

        // No coder idle, cto available: decision lands on the cto.
        let roster = vec![Agent::new("cto", AgentType::Cto)];
        let decision = router
            .route_with_agents(&task, 3.0, ComplexitySource::Router, "r", &roster)
            .unwrap();
        assert_eq!(decision.agent_type, AgentType::Cto);

        // Nobody idle at all: "all agents busy".
        let error = router
            .route_with_agents(&task, 3.0, ComplexitySource::Router, "r", &[])
            .unwrap_err();
        assert!(matches!(error, FleetError::ResourceBusy(_)));
        assert!(error.to_string().contains("all agents busy"));
    }

    #[tokio::test]
    async fn route_is_deterministic_for_same_inputs() {
        let store = Store::connect_in_memory().await.unwrap();
        let router = router_over(store, None);
        let task = Task::new("t", "fix the api handler", TaskType::Code);
        let roster = idle_roster();

        let (complexity, reasoning) = ComplexityRouter::heuristic_complexity(&task);
        let first = router
            .route_with_agents(&task, complexity, ComplexitySource::Router, &reasoning, &roster)
            .unwrap();
        let second = router
            .route_with_agents(&task, complexity, ComplexitySource::Router, &reasoning, &roster)
            .unwrap();
        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(first.model_tier, second.model_tier);
        assert_eq!(first.reason, second.reason);
    }

    #[tokio::test]
    async fn second_opinion_takes_max_and_marks_dual() {
        let store = Store::connect_in_memory().await.unwrap();
        for agent in idle_roster() {
            insert_agent(store.pool(), &agent).await.unwrap();
        }
        let hosted = Arc::new(MockHosted::new());
        hosted.push_complexity(Ok(6.5));
        let router = router_over(store, Some(hosted.clone()));

        // Heuristic lands inside the [4, 7] band: code + api + database + fix
        // keywords plus the type weight put it around 4-5.
        let task = Task::new("t", "fix the api database handler", TaskType::Code);
        let (heuristic, _) = ComplexityRouter::heuristic_complexity(&task);
        assert!(heuristic >= 4.0 && heuristic <= 7.0);

        let decision = router.route_task(&task).await.unwrap();
        assert_eq!(decision.complexity_source, ComplexitySource::Dual);
        assert!(decision.complexity >= 6.5);
        assert_eq!(hosted.complexity_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_opinion_failure_falls_back_to_router() {
        let store = Store::connect_in_memory().await.unwrap();
        for agent in idle_roster() {
            insert_agent(store.pool(), &agent).await.unwrap();
        }
        let hosted = Arc::new(MockHosted::new());
        hosted.push_complexity(Err(FleetError::Internal(anyhow::anyhow!("vendor down"))));
        let router = router_over(store, Some(hosted));

        let task = Task::new("t", "fix the api database handler", TaskType::Code);
        let decision = router.route_task(&task).await.unwrap();
        assert_eq!(decision.complexity_source, ComplexitySource::Router);
    }

    #[test]
    fn fix_decision_escalates_from_second_attempt() {
        assert_eq!(
            get_fix_decision(1),
            FixDecision {
                tier: ModelTier::Haiku,
                escalate_to_human: false
            }
        );
        assert_eq!(
            get_fix_decision(2),
            FixDecision {
                tier: ModelTier::Haiku,
                escalate_to_human: true
            }
        );
        assert!(get_fix_decision(5).escalate_to_human);
    }
}
