//! Post-hoc (actual) complexity.
//!
//! Derived from what the agent actually did rather than what the task text
//! promised. Serves as a training signal to recalibrate the router; it is
//! never used to reroute the task it was computed for.

use crate::models::{ExecutionLogEntry, TaskExecution};
use std::collections::HashSet;

const STEP_WEIGHT: f64 = 0.15;
const LOOP_WEIGHT: f64 = 0.5;
const TOOL_WEIGHT: f64 = 0.3;
const MINUTE_WEIGHT: f64 = 0.2;
const RETRY_WEIGHT: f64 = 1.0;

/// Combine step count, detected loops, distinct tools, wall time and retry
/// pressure into a [1, 10] difficulty score.
pub fn actual_complexity(logs: &[ExecutionLogEntry], executions: &[TaskExecution]) -> f64 {
    let steps = logs.len() as f64;
    let loops = logs.iter().filter(|entry| entry.is_loop).count() as f64;
    let tools: HashSet<&str> = logs
        .iter()
        .filter_map(|entry| entry.action.as_deref())
        .collect();
    let total_ms: i64 = logs.iter().map(|entry| entry.duration_ms).sum();
    let minutes = total_ms as f64 / 60_000.0;
    let retries = executions.len().saturating_sub(1) as f64;

    let score = 1.0
        + steps * STEP_WEIGHT
        + loops * LOOP_WEIGHT
        + tools.len() as f64 * TOOL_WEIGHT
        + minutes * MINUTE_WEIGHT
        + retries * RETRY_WEIGHT;

    score.clamp(1.0, 10.0)
}
