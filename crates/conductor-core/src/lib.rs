//! Core types and error definitions for the Conductor orchestration engine.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the error taxonomy, task and tier definitions, and the event bus
//! every subsystem publishes lifecycle facts on.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum covering the orchestration failure taxonomy.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`Failure`]: Serializable terminal failure (kind + human-readable message).
//! - [`Task`]: The smallest dispatchable unit of work.
//! - [`AgentTier`]: Category of execution unit (planner, coordinator, executor).
//! - [`EventBus`]: Broadcast pub/sub for [`OrchestratorEvent`]s.

/// Error taxonomy and structured failures.
pub mod error;
/// Orchestration event bus.
pub mod events;
/// Shared task, tier, and priority types.
pub mod types;

pub use error::{ConductorError, ConductorResult, ErrorKind, Failure};
pub use events::{EventBus, OrchestratorEvent};
pub use types::{AgentTier, Priority, Task, TaskStatus};
