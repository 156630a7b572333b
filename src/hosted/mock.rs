//! Scripted hosted-model double for router and review gate tests.

use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockHosted {
    pub complexity_outcomes: Mutex<VecDeque<Result<f64>>>,
    pub review_outcomes: Mutex<VecDeque<Result<HostedReview>>>,
    pub complexity_calls: Mutex<Vec<(String, String)>>,
    pub review_calls: Mutex<Vec<ReviewRequest>>,
}

impl MockHosted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_complexity(&self, outcome: Result<f64>) {
        self.complexity_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_review(&self, outcome: Result<HostedReview>) {
        self.review_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn passing_review(score: f64) -> HostedReview {
        HostedReview {
            quality_score: score,
            findings: Vec::new(),
            has_syntax_errors: false,
            tokens_in: 100,
            tokens_out: 50,
            cost: 0.001,
        }
    }
}

#[async_trait]
impl HostedModel for MockHosted {
    async fn estimate_complexity(&self, title: &str, description: &str) -> Result<f64> {
        self.complexity_calls
            .lock()
            .unwrap()
            .push((title.to_string(), description.to_string()));
        self.complexity_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(5.0))
    }

    async fn review(&self, request: ReviewRequest) -> Result<HostedReview> {
        self.review_calls.lock().unwrap().push(request);
        self.review_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::passing_review(8.0)))
    }
}
