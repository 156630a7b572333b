//! Code Review gate: sampled post-completion quality control.
//!
//! Two monotonic in-memory counters drive sampling: every Nth local-tier
//! completion gets a cheap hosted review, and every Nth complexity>5
//! completion gets an expensive one. A failing review escalates: local-tier
//! work is re-queued one tier up, hosted-tier work goes to a human. This
//! path is fully independent of the auto-retry ladder, which operates
//! before a completion is finalized.

use crate::{
    config::ReviewConfig,
    constants,
    events::{EventBridge, EventKind},
    hosted::{HostedModel, ReviewRequest},
    models::{
        CodeReview, ModelTier, ReviewStatus, Task, TaskStatus, TaskType,
    },
    store::{reviews, tasks, Store},
    Result,
};
use chrono::Utc;
use sqlx::types::Json;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct ReviewCounters {
    pub ollama_tasks: u64,
    pub all_tasks: u64,
}

pub struct ReviewGate {
    store: Store,
    events: EventBridge,
    hosted: Option<Arc<dyn HostedModel>>,
    config: ReviewConfig,
    counters: Mutex<ReviewCounters>,
}

impl ReviewGate {
    pub fn new(
        store: Store,
        events: EventBridge,
        hosted: Option<Arc<dyn HostedModel>>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            store,
            events,
            hosted,
            config,
            counters: Mutex::new(ReviewCounters::default()),
        }
    }

    pub fn counters(&self) -> ReviewCounters {
        *self.counters.lock().expect("review counters mutex poisoned")
    }

    /// Admin reset for test isolation and operator intervention.
    pub fn reset_counters(&self) {
        let mut counters = self.counters.lock().expect("review counters mutex poisoned");
        *counters = ReviewCounters::default();
        info!("review sampling counters reset");
    }

    /// Advance the sampling counters for one completion and decide which
    /// reviewer tier, if any, should look at it.
    fn sample(&self, task: &Task, executed_tier: ModelTier) -> Option<ModelTier> {
        if task.status != TaskStatus::Completed {
            return None;
        }
        if matches!(
            task.task_type,
            TaskType::Review | TaskType::Debug | TaskType::Decomposition
        ) {
            return None;
        }

        let mut counters = self.counters.lock().expect("review counters mutex poisoned");
        let mut reviewer = None;

        if executed_tier == ModelTier::Ollama {
            counters.ollama_tasks += 1;
            if counters.ollama_tasks % self.config.ollama_interval == 0 {
                reviewer = Some(ModelTier::Haiku);
            }
        }
        if task.complexity.unwrap_or(0.0) > constants::REVIEW_COMPLEXITY_FLOOR {
            counters.all_tasks += 1;
            if counters.all_tasks % self.config.opus_interval == 0 {
                // The expensive sweep wins when both triggers fire.
                reviewer = Some(ModelTier::Opus);
            }
        }
        reviewer
    }

    fn review_fails(&self, review: &CodeReview) -> bool {
        review.quality_score < self.config.quality_threshold
            || review.has_critical_finding()
            || review.has_syntax_errors
    }

    /// Consult the gate for one completed task. Returns the persisted
    /// review row when sampling selected the task.
    pub async fn maybe_review(
        &self,
        task: &Task,
        executed_tier: ModelTier,
    ) -> Result<Option<CodeReview>> {
        let Some(reviewer_tier) = self.sample(task, executed_tier) else {
            return Ok(None);
        };
        let Some(hosted) = &self.hosted else {
            debug!(task_id = %task.id, "review sampled but no hosted client configured");
            return Ok(None);
        };

        let output = task
            .result_view()
            .and_then(|view| view.output().map(str::to_string))
            .or_else(|| task.result.as_ref().map(|r| r.0.to_string()))
            .unwrap_or_default();

        let verdict = hosted
            .review(ReviewRequest {
                task_id: task.id.clone(),
                tier: reviewer_tier,
                title: task.title.clone(),
                description: task.description.clone(),
                output,
                language: task.language.clone(),
            })
            .await?;

        let mut review = CodeReview {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            reviewer_tier,
            quality_score: verdict.quality_score,
            findings: Json(verdict.findings),
            has_syntax_errors: verdict.has_syntax_errors,
            tokens_in: verdict.tokens_in,
            tokens_out: verdict.tokens_out,
            cost: verdict.cost,
            status: ReviewStatus::Approved,
            created_at: Utc::now(),
        };
        if self.review_fails(&review) {
            review.status = ReviewStatus::NeedsFixes;
        }
        reviews::insert_review(self.store.pool(), &review).await?;

        if review.status == ReviewStatus::NeedsFixes {
            self.escalate(task, executed_tier, &review).await?;
        } else {
            info!(task_id = %task.id, score = review.quality_score, "code review passed");
        }

        self.events.emit(
            EventKind::CodeReviewCompleted,
            serde_json::json!({
                "task_id": task.id,
                "reviewer_tier": reviewer_tier,
                "quality_score": review.quality_score,
                "status": review.status,
            }),
        );
        Ok(Some(review))
    }

    /// Escalation after a failing review. Local-tier work gets another shot
    /// one tier up; hosted-tier work goes to a human.
    async fn escalate(
        &self,
        task: &Task,
        executed_tier: ModelTier,
        review: &CodeReview,
    ) -> Result<()> {
        let Some(mut task) = tasks::get_task(self.store.pool(), &task.id).await? else {
            warn!(task_id = %task.id, "reviewed task vanished before escalation");
            return Ok(());
        };
        let now = Utc::now();
        let findings_context = serde_json::to_string(&review.findings.0)?;

        let requeue = executed_tier == ModelTier::Ollama;
        if requeue {
            task.status = TaskStatus::Pending;
            task.preferred_model = Some(ModelTier::Haiku);
            task.review_context = Some(findings_context);
            task.assigned_agent_id = None;
            task.assigned_at = None;
            task.completed_at = None;
            task.updated_at = now;
        } else {
            task.status = TaskStatus::Failed;
            task.needs_human_review = true;
            task.review_context = Some(findings_context);
            task.updated_at = now;
        }

        // Escalation only applies to the completion being reviewed; if the
        // task moved since, whoever moved it wins.
        let mut tx = self.store.pool().begin().await?;
        let claimed = tasks::transition_status_conn(
            &mut tx,
            &task.id,
            TaskStatus::Completed,
            task.status,
            now,
        )
        .await?;
        if claimed == 0 {
            drop(tx);
            warn!(task_id = %task.id, "task moved before review escalation, skipped");
            return Ok(());
        }
        tasks::update_task_conn(&mut tx, &task).await?;
        tx.commit().await?;

        if requeue {
            info!(task_id = %task.id, "review failed, re-queued for hosted tier");
            self.events.emit_task(EventKind::TaskUpdated, &task);
        } else {
            warn!(task_id = %task.id, "review failed at hosted tier, needs human");
            self.events
                .publish_task(EventKind::TaskNeedsHumanReview, &task)
                .await;
        }
        Ok(())
    }
}
