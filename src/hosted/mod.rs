//! Hosted model vendor client.
//!
//! The engine needs exactly two things from the paid vendor: a numeric
//! second opinion on task complexity and a structured code review. Both sit
//! behind [`HostedModel`] so the router and the review gate stay testable
//! without network access.

use crate::{
    config::HostedConfig,
    models::{ModelTier, ReviewFinding},
    FleetError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
pub mod mock;

/// Locked to a stable vendor API version.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const COMPLEXITY_MAX_TOKENS: u32 = 64;
const REVIEW_MAX_TOKENS: u32 = 2048;
const HOSTED_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub task_id: String,
    pub tier: ModelTier,
    pub title: String,
    pub description: String,
    pub output: String,
    pub language: Option<String>,
}

/// Parsed reviewer verdict, before it is persisted as a `CodeReview` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedReview {
    pub quality_score: f64,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default)]
    pub has_syntax_errors: bool,
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
    #[serde(default)]
    pub cost: f64,
}

#[async_trait]
pub trait HostedModel: Send + Sync {
    /// Single bounded call asking the cheap tier for a numeric complexity
    /// estimate in [1, 10].
    async fn estimate_complexity(&self, title: &str, description: &str) -> Result<f64>;

    /// Review a completed task's output with the given tier.
    async fn review(&self, request: ReviewRequest) -> Result<HostedReview>;
}

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl AnthropicClient {
    /// Returns `None` when no API key is configured; callers then skip
    /// hosted features instead of failing.
    pub fn new(config: &HostedConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn model_for(tier: ModelTier) -> &'static str {
        match tier {
            ModelTier::Ollama | ModelTier::Haiku => "claude-3-5-haiku-latest",
            ModelTier::Sonnet => "claude-3-5-sonnet-latest",
            ModelTier::Opus => "claude-3-opus-latest",
        }
    }

    async fn complete(&self, model: &str, max_tokens: u32, prompt: &str) -> Result<(String, Usage)> {
        let url = format!("{}/v1/messages", self.base_url);
        let request = MessagesRequest {
            model,
            max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&url)
            .timeout(HOSTED_CALL_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FleetError::Internal(anyhow::anyhow!(
                "hosted model returned {}",
                response.status()
            )));
        }

        let body: MessagesResponse = response.json().await?;
        let text = body
            .content
            .first()
            .map(|block| block.text.clone())
            .unwrap_or_default();
        Ok((text, body.usage))
    }
}

/// Pull the first number out of a model reply, tolerating prose around it.
fn parse_leading_number(text: &str) -> Option<f64> {
    let mut number = String::new();
    let mut seen_digit = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            seen_digit = true;
        } else if c == '.' && seen_digit && !number.contains('.') {
            number.push(c);
        } else if seen_digit {
            break;
        }
    }
    number.parse().ok()
}

#[async_trait]
impl HostedModel for AnthropicClient {
    async fn estimate_complexity(&self, title: &str, description: &str) -> Result<f64> {
        let prompt = format!(
            "Rate the implementation complexity of this coding task on a scale of 1 to 10. \
             Reply with a single number only.\n\nTitle: {title}\n\nDescription: {description}"
        );
        let (text, _) = self
            .complete(Self::model_for(ModelTier::Haiku), COMPLEXITY_MAX_TOKENS, &prompt)
            .await?;
        let score = parse_leading_number(&text).ok_or_else(|| {
            FleetError::Internal(anyhow::anyhow!(
                "hosted complexity reply was not numeric: {text:?}"
            ))
        })?;
        debug!(score, "hosted complexity estimate received");
        Ok(score.clamp(1.0, 10.0))
    }

    async fn review(&self, request: ReviewRequest) -> Result<HostedReview> {
        let prompt = format!(
            "You are reviewing the output of an automated coding agent. Reply with JSON only, \
             shaped as {{\"quality_score\": 0-10, \"has_syntax_errors\": bool, \"findings\": \
             [{{\"severity\": \"critical|high|medium|low\", \"category\": str, \
             \"description\": str, \"suggestion\": str|null}}]}}.\n\n\
             Task: {title}\n\nDescription: {description}\n\nLanguage: {language}\n\n\
             Agent output:\n{output}",
            title = request.title,
            description = request.description,
            language = request.language.as_deref().unwrap_or("unknown"),
            output = request.output,
        );
        let (text, usage) = self
            .complete(Self::model_for(request.tier), REVIEW_MAX_TOKENS, &prompt)
            .await?;

        // Models sometimes wrap JSON in fences; strip to the outermost braces.
        let json_text = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if end > start => &text[start..=end],
            _ => text.as_str(),
        };
        let mut review: HostedReview = serde_json::from_str(json_text)?;
        review.tokens_in = usage.input_tokens;
        review.tokens_out = usage.output_tokens;
        review.cost = request.tier.estimated_cost();
        Ok(review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::Server) -> AnthropicClient {
        AnthropicClient::new(&HostedConfig {
            api_key: Some("sk-test-0123456789012345678901234567890123456789".to_string()),
            base_url: server.url(),
        })
        .unwrap()
    }

    #[test]
    fn missing_key_disables_client() {
        assert!(AnthropicClient::new(&HostedConfig::default()).is_none());
    }

    #[test]
    fn leading_number_parsing() {
        assert_eq!(parse_leading_number("7"), Some(7.0));
        assert_eq!(parse_leading_number("7.5 because of X"), Some(7.5));
        assert_eq!(parse_leading_number("Complexity: 8"), Some(8.0));
        assert_eq!(parse_leading_number("no number here"), None);
    }

    #[tokio::test]
    async fn complexity_estimate_is_clamped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"content": [{"type": "text", "text": "42"}], "usage": {"input_tokens": 50, "output_tokens": 2}}"#)
            .create_async()
            .await;

        let score = client_for(&server)
            .estimate_complexity("big task", "do everything")
            .await
            .unwrap();
        assert_eq!(score, 10.0);
    }

    #[tokio::test]
    async fn review_parses_fenced_json() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "content": [{"type": "text", "text": "```json\n{\"quality_score\": 4, \"has_syntax_errors\": false, \"findings\": [{\"severity\": \"critical\", \"category\": \"correctness\", \"description\": \"returns wrong sum\", \"suggestion\": null}]}\n```"}],
            "usage": {"input_tokens": 900, "output_tokens": 120}
        });
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let review = client_for(&server)
            .review(ReviewRequest {
                task_id: "t1".to_string(),
                tier: ModelTier::Haiku,
                title: "add".to_string(),
                description: "add two numbers".to_string(),
                output: "def add(a, b): return a - b".to_string(),
                language: Some("python".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(review.quality_score, 4.0);
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.tokens_in, 900);
        assert!(review.cost > 0.0);
    }
}
