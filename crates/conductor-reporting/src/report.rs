use crate::issue::{Issue, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    TaskProgress,
    TaskCompletion,
    AgentStatus,
    CommandProgress,
    Error,
    Resource,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::TaskProgress => "task_progress",
            ReportKind::TaskCompletion => "task_completion",
            ReportKind::AgentStatus => "agent_status",
            ReportKind::CommandProgress => "command_progress",
            ReportKind::Error => "error",
            ReportKind::Resource => "resource",
        };
        write!(f, "{name}")
    }
}

/// Aggregation level a report's metrics are scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    Task,
    Agent,
    Command,
    Session,
}

impl ReportLevel {
    pub const ALL: [ReportLevel; 4] = [
        ReportLevel::Task,
        ReportLevel::Agent,
        ReportLevel::Command,
        ReportLevel::Session,
    ];
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportLevel::Task => "task",
            ReportLevel::Agent => "agent",
            ReportLevel::Command => "command",
            ReportLevel::Session => "session",
        };
        write!(f, "{name}")
    }
}

/// Who a report is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ReportSource {
    Agent(String),
    Task(Uuid),
    Command(Uuid),
    System,
}

impl ReportSource {
    /// The level a report from this source is aggregated at.
    pub fn level(&self) -> ReportLevel {
        match self {
            ReportSource::Agent(_) => ReportLevel::Agent,
            ReportSource::Task(_) => ReportLevel::Task,
            ReportSource::Command(_) => ReportLevel::Command,
            ReportSource::System => ReportLevel::Session,
        }
    }

    pub fn id(&self) -> String {
        match self {
            ReportSource::Agent(id) => id.clone(),
            ReportSource::Task(id) | ReportSource::Command(id) => id.to_string(),
            ReportSource::System => "system".to_string(),
        }
    }
}

impl fmt::Display for ReportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportSource::System => write!(f, "system"),
            ReportSource::Agent(id) => write!(f, "agent:{id}"),
            ReportSource::Task(id) => write!(f, "task:{id}"),
            ReportSource::Command(id) => write!(f, "command:{id}"),
        }
    }
}

/// An immutable progress fact with a metrics snapshot taken at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ReportKind,
    pub source: ReportSource,
    pub level: ReportLevel,
    pub metrics: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

impl ProgressReport {
    pub(crate) fn new(kind: ReportKind, source: ReportSource, level: ReportLevel, metrics: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            source,
            level,
            metrics,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// Highest severity among the attached issues.
    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    /// Errors and reports carrying high or critical issues skip periodic batching.
    pub fn is_high_priority(&self) -> bool {
        self.kind == ReportKind::Error || self.max_severity().is_some_and(|s| s >= Severity::High)
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let m = &self.metrics;
        match self.kind {
            ReportKind::TaskProgress => format!(
                "{} at {}%",
                self.source,
                m.get("progress").and_then(|p| p.as_f64()).unwrap_or(0.0)
            ),
            ReportKind::TaskCompletion => format!(
                "{} {}",
                self.source,
                m.get("status").and_then(|s| s.as_str()).unwrap_or("finished")
            ),
            ReportKind::AgentStatus => format!(
                "{} is {}",
                self.source,
                m.get("status").and_then(|s| s.as_str()).unwrap_or("unknown")
            ),
            ReportKind::CommandProgress => format!(
                "{} {} ({}%)",
                self.source,
                m.get("status").and_then(|s| s.as_str()).unwrap_or("unknown"),
                m.get("progress").and_then(|p| p.as_f64()).unwrap_or(0.0)
            ),
            ReportKind::Error => match self.issues.first() {
                Some(issue) => format!("{} [{}] {}", self.source, issue.severity, issue.description),
                None => format!("{} reported an error", self.source),
            },
            ReportKind::Resource => format!(
                "{} pool at {}%",
                m.get("tier").and_then(|t| t.as_str()).unwrap_or("?"),
                m.get("utilisation").and_then(|u| u.as_f64()).unwrap_or(0.0)
            ),
        }
    }
}

/// Filter for [`ReportingSystem::get_report_history`](crate::ReportingSystem::get_report_history).
///
/// Every set field must match. `limit` keeps the most recent matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub kind: Option<ReportKind>,
    #[serde(default)]
    pub level: Option<ReportLevel>,
    /// Matches the source id (agent id, task or command uuid, `system`).
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ReportQuery {
    pub fn matches(&self, report: &ProgressReport) -> bool {
        self.kind.map_or(true, |k| k == report.kind)
            && self.level.map_or(true, |l| l == report.level)
            && self.source.as_ref().map_or(true, |s| *s == report.source.id())
            && self.since.map_or(true, |t| report.timestamp >= t)
    }
}

/// Session-wide counters sampled on every ingested report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub reports_ingested: u64,
    pub active_commands: usize,
    pub completed_commands: usize,
    pub failed_commands: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub agents_online: usize,
    pub avg_task_duration_ms: f64,
    pub open_issues: usize,
}
