use crate::issue::Severity;
use crate::report::{ProgressReport, ReportKind, ReportLevel};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Summary,
    Detailed,
    MetricsOnly,
}

/// When matching reports are delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    /// Every matching report, as it is ingested.
    #[default]
    Realtime,
    /// Batched and flushed on a cron schedule (seconds field first).
    Periodic { cron: String },
    /// Only reports of the listed kinds, as they are ingested.
    OnEvent { events: Vec<ReportKind> },
}

/// Extra conditions a report must meet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilter {
    /// Source id prefix, e.g. `executor-`.
    #[serde(default)]
    pub source_prefix: Option<String>,
    /// Minimum severity among the report's issues.
    #[serde(default)]
    pub min_severity: Option<Severity>,
}

impl ReportFilter {
    fn matches(&self, report: &ProgressReport) -> bool {
        let source_ok = self
            .source_prefix
            .as_ref()
            .map_or(true, |p| report.source.id().starts_with(p.as_str()));
        let severity_ok = self
            .min_severity
            .map_or(true, |min| report.max_severity().is_some_and(|s| s >= min));
        source_ok && severity_ok
    }
}

/// Routes reports of some kinds and level to channels in one format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTemplate {
    pub name: String,
    /// Kinds this template accepts; empty accepts every kind.
    #[serde(default)]
    pub kinds: Vec<ReportKind>,
    #[serde(default)]
    pub level: Option<ReportLevel>,
    #[serde(default)]
    pub filter: ReportFilter,
    pub channels: Vec<String>,
    #[serde(default)]
    pub format: ReportFormat,
    #[serde(default)]
    pub cadence: Cadence,
}

impl ReportTemplate {
    /// Summary of every report to `channels`, as it arrives.
    pub fn realtime(name: &str, channels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kinds: Vec::new(),
            level: None,
            filter: ReportFilter::default(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            format: ReportFormat::Summary,
            cadence: Cadence::Realtime,
        }
    }

    pub fn with_kinds(mut self, kinds: Vec<ReportKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_level(mut self, level: ReportLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_filter(mut self, filter: ReportFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_format(mut self, format: ReportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn validate(&self) -> ConductorResult<()> {
        if self.channels.is_empty() {
            return Err(ConductorError::Config(format!(
                "report template '{}' has no channels",
                self.name
            )));
        }
        if let Cadence::Periodic { cron } = &self.cadence {
            parse_cron(cron)?;
        }
        Ok(())
    }

    pub fn matches(&self, report: &ProgressReport) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&report.kind);
        let level_ok = self.level.map_or(true, |l| l == report.level);
        let event_ok = match &self.cadence {
            Cadence::OnEvent { events } => events.contains(&report.kind),
            Cadence::Realtime | Cadence::Periodic { .. } => true,
        };
        kind_ok && level_ok && event_ok && self.filter.matches(report)
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.cadence, Cadence::Periodic { .. })
    }

    /// Next flush time of a periodic template after `after`.
    pub fn next_flush(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.cadence {
            Cadence::Periodic { cron } => parse_cron(cron).ok()?.after(&after).next(),
            Cadence::Realtime | Cadence::OnEvent { .. } => None,
        }
    }
}

/// Parse a cron expression (`sec min hour day-of-month month day-of-week [year]`).
pub fn parse_cron(expr: &str) -> ConductorResult<Schedule> {
    Schedule::from_str(expr).map_err(|e| ConductorError::Config(format!("Invalid cron expression '{expr}': {e}")))
}

/// Render a report in the given format.
pub fn render(format: ReportFormat, report: &ProgressReport) -> serde_json::Value {
    match format {
        ReportFormat::Summary => serde_json::json!({
            "id": report.id,
            "timestamp": report.timestamp,
            "kind": report.kind,
            "level": report.level,
            "source": report.source.to_string(),
            "summary": report.summary(),
            "issues": report.issues.len(),
        }),
        ReportFormat::Detailed => serde_json::to_value(report).unwrap_or(serde_json::Value::Null),
        ReportFormat::MetricsOnly => serde_json::json!({
            "id": report.id,
            "timestamp": report.timestamp,
            "metrics": report.metrics,
        }),
    }
}
