//! Cross-process pub/sub publisher.
//!
//! Publication is best-effort with a short deadline. Failures are logged and
//! never propagated; a dead bus must not stall a state transition.

use super::Event;
use crate::config::BusConfig;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BusClient {
    client: reqwest::Client,
    base_url: String,
    publish_timeout: Duration,
}

#[derive(serde::Serialize)]
struct PublishBody<'a> {
    topic: &'a str,
    event: &'a Event,
}

impl BusClient {
    pub fn new(config: &BusConfig) -> Option<Self> {
        let base_url = config.url.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            base_url,
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }

    /// Publish one event under its topic. At-most-once: a timeout or error
    /// drops the message.
    pub async fn publish(&self, event: &Event) {
        let topic = event.kind.to_string();
        let url = format!("{}/publish", self.base_url.trim_end_matches('/'));
        let body = PublishBody {
            topic: &topic,
            event,
        };

        let send = self
            .client
            .post(&url)
            .timeout(self.publish_timeout)
            .json(&body)
            .send();

        match send.await {
            Ok(response) if response.status().is_success() => {
                debug!(topic = %topic, "published event to bus");
            }
            Ok(response) => {
                warn!(topic = %topic, status = %response.status(), "bus rejected publish");
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "bus publish failed");
            }
        }
    }
}
