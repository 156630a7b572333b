//! Process-wide counting semaphore over the shared compute slots.
//!
//! One slot family per [`ResourceType`]. Acquire never blocks; callers poll
//! through the queue selection loop. Every mutation of the holder map and
//! the counters happens under a single mutex so the accounting invariant
//! `active == holders of that type` holds at all times.

use crate::{config::ResourceConfig, constants, models::ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct PoolInner {
    max_slots: HashMap<ResourceType, u32>,
    active: HashMap<ResourceType, u32>,
    holders: HashMap<String, ResourceType>,
}

/// Snapshot for observability endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub slots: Vec<SlotStatus>,
    pub holders: HashMap<String, ResourceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub resource_type: ResourceType,
    pub max_slots: u32,
    pub active_slots: u32,
}

#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<Mutex<PoolInner>>,
    complexity_threshold: f64,
}

impl ResourcePool {
    pub fn new(config: &ResourceConfig, complexity_threshold: f64) -> Self {
        let mut max_slots = HashMap::new();
        max_slots.insert(ResourceType::Ollama, config.ollama_slots);
        max_slots.insert(ResourceType::Claude, config.claude_slots);
        let mut active = HashMap::new();
        active.insert(ResourceType::Ollama, 0);
        active.insert(ResourceType::Claude, 0);

        info!(
            ollama = config.ollama_slots,
            claude = config.claude_slots,
            "Resource pool initialized"
        );

        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                max_slots,
                active,
                holders: HashMap::new(),
            })),
            complexity_threshold,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(
            &ResourceConfig::default(),
            constants::DEFAULT_COMPLEXITY_THRESHOLD,
        )
    }

    /// Advisory free-slot check; the answer can be stale by the time the
    /// caller acts on it.
    pub fn can_acquire(&self, resource_type: ResourceType) -> bool {
        let inner = self.inner.lock().expect("resource pool mutex poisoned");
        inner.active.get(&resource_type).copied().unwrap_or(0)
            < inner.max_slots.get(&resource_type).copied().unwrap_or(0)
    }

    /// Take one slot for a task. Re-acquire by the same task is a no-op that
    /// still reports success.
    pub fn acquire(&self, resource_type: ResourceType, task_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("resource pool mutex poisoned");

        if let Some(held) = inner.holders.get(task_id) {
            if *held == resource_type {
                return true;
            }
            warn!(
                task_id,
                held = %held,
                requested = %resource_type,
                "task already holds a different resource type"
            );
            return false;
        }

        let max = inner.max_slots.get(&resource_type).copied().unwrap_or(0);
        let active = inner.active.entry(resource_type).or_insert(0);
        if *active >= max {
            return false;
        }
        *active += 1;
        inner.holders.insert(task_id.to_string(), resource_type);
        debug!(task_id, resource = %resource_type, "resource slot acquired");
        true
    }

    /// Return the slot a task holds. Unknown task ids are ignored, which
    /// makes releases idempotent on every terminal path.
    pub fn release(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("resource pool mutex poisoned");
        if let Some(resource_type) = inner.holders.remove(task_id) {
            if let Some(active) = inner.active.get_mut(&resource_type) {
                *active = active.saturating_sub(1);
            }
            debug!(task_id, resource = %resource_type, "resource slot released");
        }
    }

    /// Which slot family a task of the given complexity needs.
    pub fn resource_for_complexity(&self, complexity: f64) -> ResourceType {
        if complexity < self.complexity_threshold {
            ResourceType::Ollama
        } else {
            ResourceType::Claude
        }
    }

    pub fn holder_of(&self, task_id: &str) -> Option<ResourceType> {
        let inner = self.inner.lock().expect("resource pool mutex poisoned");
        inner.holders.get(task_id).copied()
    }

    pub fn status(&self) -> ResourceStatus {
        let inner = self.inner.lock().expect("resource pool mutex poisoned");
        let mut slots: Vec<SlotStatus> = inner
            .max_slots
            .iter()
            .map(|(resource_type, max)| SlotStatus {
                resource_type: *resource_type,
                max_slots: *max,
                active_slots: inner.active.get(resource_type).copied().unwrap_or(0),
            })
            .collect();
        slots.sort_by_key(|s| s.resource_type.to_string());
        ResourceStatus {
            slots,
            holders: inner.holders.clone(),
        }
    }

    /// Admin only: drop all holders and zero the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("resource pool mutex poisoned");
        let dropped = inner.holders.len();
        inner.holders.clear();
        for active in inner.active.values_mut() {
            *active = 0;
        }
        if dropped > 0 {
            info!(dropped, "resource pool cleared");
        }
    }
}
