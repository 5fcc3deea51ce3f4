//! Progress reporting, issue escalation, and dashboard aggregation.
//!
//! The [`ReportingSystem`] is the single ingestion point for progress and
//! error facts. Attached to the orchestration [`EventBus`](conductor_core::EventBus)
//! it turns every lifecycle event into an immutable [`ProgressReport`],
//! keeps per-level aggregates for the dashboard, escalates recurring issues,
//! and routes reports to channels through [`ReportTemplate`]s.
//!
//! # Main types
//!
//! - [`ReportingSystem`]: Ingestion, history, queries, and delivery.
//! - [`ProgressReport`]: One immutable report with its metrics snapshot.
//! - [`Issue`] / [`IssueTracker`]: Problems, merged and escalated per level.
//! - [`ReportTemplate`]: Which reports go to which channels, how, and when.
//! - [`ReportChannel`]: Delivery destination (`log`, `memory`, `stream`).
//! - [`DashboardData`]: Point-in-time view of every aggregate.

/// Delivery destinations.
pub mod channel;
/// Reporting configuration.
pub mod config;
/// Dashboard aggregates and views.
pub mod dashboard;
/// Issues and escalation.
pub mod issue;
/// Report types and history queries.
pub mod report;
/// Ingestion and routing.
pub mod system;
/// Report templates, cadences, and rendering.
pub mod template;

pub use channel::{Delivery, LogChannel, MemoryChannel, ReportChannel, StreamChannel};
pub use config::ReportingConfig;
pub use dashboard::{
    AgentPerformance, CommandUpdate, CommandView, DashboardData, ResourceUtilisation, SessionOverview, TaskView,
};
pub use issue::{Escalation, Issue, IssueCategory, IssueTracker, Severity};
pub use report::{MetricsSample, ProgressReport, ReportKind, ReportLevel, ReportQuery, ReportSource};
pub use system::ReportingSystem;
pub use template::{parse_cron, render, Cadence, ReportFilter, ReportFormat, ReportTemplate};
