//! Command state machine, task distribution, and per-tier process control.
//!
//! Commands are decomposed by a [`CommandStrategy`] into a dependency-ordered
//! [`TaskGraph`]; ready tasks are handed to the [`ProcessController`], which
//! keeps one elastic pool of execution units per agent tier and picks a unit
//! with the [`TaskDistributor`]. When every task has completed, the strategy's
//! quality gates decide the command's fate.
//!
//! # Main types
//!
//! - [`CommandSystem`]: Accepts commands and drives them through their lifecycle.
//! - [`ProcessController`]: Tier pools, dispatch, requeue, and autoscaling.
//! - [`TaskDistributor`]: Selects a process under a distribution strategy.
//! - [`ExecutableUnit`]: In-process, subprocess, or remote-agent execution.
//! - [`StrategyRegistry`]: Built-in and custom command types.
//! - [`GateRegistry`]: Named quality gates.

/// Command lifecycle and run loop.
pub mod command;
/// Tier pools, dispatch, and autoscaling.
pub mod controller;
/// Process selection strategies.
pub mod distributor;
/// Quality gates over task-reported metrics.
pub mod gates;
/// Command types and their phases.
pub mod strategy;
/// Dependency graph of a command's tasks.
pub mod task_graph;
/// Command, process, and quality types.
pub mod types;
/// Execution unit trait and its variants.
pub mod unit;

pub use command::{CommandConfig, CommandSystem};
pub use controller::{
    ControllerBuilder, ControllerConfig, ControllerSnapshot, Placement, PoolSnapshot, ProcessController,
    ScalingPolicy, TaskOutcome, TaskTicket, TierPolicies,
};
pub use distributor::{DistributionStrategy, DistributorConfig, PerformanceWeights, TaskDistributor};
pub use gates::{
    BenchmarkGate, CommandGate, CommandGateConfig, CoverageGate, GateContext, GateMetrics, GateRegistry, LintGate,
    QualityGate, ReviewApprovalGate, TestsPassGate,
};
pub use strategy::{default_capabilities, CommandStrategy, ExecutionMode, PhaseSpec, StrategyRegistry};
pub use task_graph::TaskGraph;
pub use types::{
    Command, CommandContext, CommandSpec, CommandStatus, GateResult, ProcessInfo, ProcessStatus,
    QualityThresholds, UnitKind,
};
pub use unit::{
    ExecutableUnit, InProcessFactory, InProcessUnit, OutcomeSink, ProcessFactory, RemoteAgentUnit,
    SubprocessFactory, SubprocessUnit, UnitOutcome, UnitTaskStatus,
};
