//! Lifecycle event fan-out.
//!
//! Two independent transports: an in-process broadcast channel feeding local
//! subscribers (the WebSocket layer), and the cross-process bus for external
//! consumers. Events are emitted after the state write they describe, never
//! before. Per-task ordering holds because each emitting component awaits
//! its own publishes in sequence; cross-task ordering is not guaranteed.

mod bus;

pub use bus::BusClient;

use crate::{
    constants,
    models::{Agent, Task},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// The canonical event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskNeedsHumanReview,
    AgentStatusChanged,
    ExecutionStep,
    Alert,
    CodeReviewCompleted,
    AutoRetryValidation,
    AutoRetryAttempt,
    AutoRetryResult,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::TaskAssigned => "task_assigned",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskNeedsHumanReview => "task_needs_human_review",
            Self::AgentStatusChanged => "agent_status_changed",
            Self::ExecutionStep => "execution_step",
            Self::Alert => "alert",
            Self::CodeReviewCompleted => "code_review_completed",
            Self::AutoRetryValidation => "auto_retry_validation",
            Self::AutoRetryAttempt => "auto_retry_attempt",
            Self::AutoRetryResult => "auto_retry_result",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

/// Envelope every subscriber sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out hub, cheap to clone. Constructed once at startup; no hidden
/// globals.
#[derive(Clone)]
pub struct EventBridge {
    sender: broadcast::Sender<Event>,
    bus: Option<Arc<BusClient>>,
}

impl EventBridge {
    pub fn new(bus: Option<BusClient>) -> Self {
        let (sender, _) = broadcast::channel(constants::EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            bus: bus.map(Arc::new),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// In-process delivery only. Synchronous in the emitting task; handlers
    /// must be non-blocking or offload work.
    pub fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        let event = Event::new(kind, payload);
        // A send error only means nobody is listening right now.
        if self.sender.send(event).is_err() {
            debug!(kind = %kind, "no local subscribers for event");
        }
    }

    /// In-process delivery plus a best-effort bus publish. The await bounds
    /// the publish by the configured timeout; errors never propagate.
    pub async fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        let event = Event::new(kind, payload);
        if self.sender.send(event.clone()).is_err() {
            debug!(kind = %kind, "no local subscribers for event");
        }
        if let Some(bus) = &self.bus {
            bus.publish(&event).await;
        }
    }

    pub fn emit_task(&self, kind: EventKind, task: &Task) {
        self.emit(kind, serde_json::json!(task));
    }

    pub async fn publish_task(&self, kind: EventKind, task: &Task) {
        self.publish(kind, serde_json::json!(task)).await;
    }

    pub fn emit_agent(&self, agent: &Agent) {
        self.emit(EventKind::AgentStatusChanged, serde_json::json!(agent));
    }

    pub fn alert(&self, severity: AlertSeverity, message: impl Into<String>) {
        self.emit(
            EventKind::Alert,
            serde_json::json!({
                "severity": severity,
                "message": message.into(),
            }),
        );
    }
}
