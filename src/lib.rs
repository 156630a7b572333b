//! # Fleet Core
//!
//! Fleet Core is an orchestration control plane for a heterogeneous fleet of
//! code-producing agents. Users submit coding tasks; the engine scores each
//! task's difficulty, routes it to the cheapest model tier likely to
//! succeed, coordinates parallel execution under bounded compute slots,
//! validates outputs, retries failures along a fixed cost ladder, and
//! samples completed work for code review.
//!
//! ## Architecture
//!
//! - **Complexity Router**: scores tasks and picks an execution tier
//! - **Resource Pool**: counting semaphore over shared compute slots
//! - **File Lock Manager**: one writer per file path
//! - **Task Assigner**: selection and the `pending -> assigned` transition
//! - **Task Executor**: lifecycle, validation and the auto-retry ladder
//! - **Code Review gate**: sampled post-completion quality control
//! - **Stuck-Task Recovery**: periodic reclamation of timed-out work
//! - **Event Bridge**: WebSocket fan-out plus a cross-process pub/sub bus
//!
//! The agent runtime itself is an external collaborator reached over a
//! narrow RPC interface; this crate never runs a model.

/// HTTP API server and endpoints
pub mod api;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Lifecycle event fan-out
pub mod events;
/// Task lifecycle execution and the retry ladder
pub mod executor;
/// Hosted model vendor client
pub mod hosted;
/// File lock manager
pub mod locks;
/// Core data models
pub mod models;
/// Task assignment and queue selection
pub mod queue;
/// Stuck-task recovery sweep
pub mod recovery;
/// Shared compute slot accounting
pub mod resources;
/// Code review gate
pub mod review;
/// Complexity routing
pub mod router;
/// Agent runtime RPC client
pub mod runtime;
/// Persistence adapter
pub mod store;
/// Task output persistence
pub mod workspace;

#[cfg(test)]
mod tests;

pub use error::{FleetError, Result};
