use crate::report::ReportLevel;
use chrono::{DateTime, Utc};
use conductor_core::{ErrorKind, Failure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One step up, saturating at `Critical`.
    pub fn raised(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Execution,
    Timeout,
    Connection,
    Capacity,
    Validation,
    QualityGate,
    Agent,
    Delivery,
    Internal,
}

impl IssueCategory {
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Connection => IssueCategory::Connection,
            ErrorKind::Timeout => IssueCategory::Timeout,
            ErrorKind::Capacity => IssueCategory::Capacity,
            ErrorKind::Validation => IssueCategory::Validation,
            ErrorKind::Execution => IssueCategory::Execution,
            ErrorKind::QualityGate => IssueCategory::QualityGate,
            ErrorKind::NotFound | ErrorKind::Internal => IssueCategory::Internal,
        }
    }

    fn default_severity(self) -> Severity {
        match self {
            IssueCategory::QualityGate | IssueCategory::Internal => Severity::High,
            IssueCategory::Execution | IssueCategory::Timeout | IssueCategory::Connection | IssueCategory::Agent => {
                Severity::Medium
            }
            IssueCategory::Capacity | IssueCategory::Validation | IssueCategory::Delivery => Severity::Low,
        }
    }

    fn suggested_actions(self) -> &'static [&'static str] {
        match self {
            IssueCategory::Execution => &["Inspect the task output", "Retry the command once the cause is fixed"],
            IssueCategory::Timeout => &["Raise the task timeout", "Check the agent's load"],
            IssueCategory::Connection => &["Check that the agent is running and reachable"],
            IssueCategory::Capacity => &["Raise the pool maximum for this tier"],
            IssueCategory::Validation => &["Correct the submitted request"],
            IssueCategory::QualityGate => &["Review the gate metrics reported by the tasks"],
            IssueCategory::Agent => &["Restart the agent"],
            IssueCategory::Delivery => &["Check the report channel's configuration"],
            IssueCategory::Internal => &["Check the orchestrator logs"],
        }
    }
}

/// A recorded problem. Repeats of the same problem at the same level are
/// merged into one issue with an occurrence count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub severity: Severity,
    pub category: IssueCategory,
    pub description: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub escalated: bool,
}

impl Issue {
    pub fn new(severity: Severity, category: IssueCategory, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            severity,
            category,
            description: description.into(),
            affected_components: Vec::new(),
            suggested_actions: category.suggested_actions().iter().map(|a| a.to_string()).collect(),
            occurrences: 1,
            first_seen: now,
            last_seen: now,
            escalated: false,
        }
    }

    /// Issue for a terminal failure, with the category's default severity.
    pub fn from_failure(failure: &Failure) -> Self {
        let category = IssueCategory::from_kind(failure.kind);
        Self::new(category.default_severity(), category, failure.message.clone())
    }

    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.affected_components = components;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    fn key(&self) -> (IssueCategory, String) {
        (self.category, self.description.clone())
    }
}

/// A threshold crossing: the level's aggregate and the triggering issue
/// were both raised.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub issue_id: Uuid,
    pub level: ReportLevel,
    pub severity: Severity,
}

#[derive(Default)]
struct LevelState {
    window: VecDeque<DateTime<Utc>>,
    aggregate: Option<Severity>,
    active: HashMap<(IssueCategory, String), Issue>,
}

/// Per-level issue bookkeeping and escalation.
///
/// Severities only move up; resolving an issue removes it from the active
/// list but leaves the level's aggregate where it is.
pub struct IssueTracker {
    window: Duration,
    threshold: usize,
    levels: BTreeMap<ReportLevel, LevelState>,
}

impl IssueTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            levels: BTreeMap::new(),
        }
    }

    /// Record an issue observed at `now`.
    ///
    /// Returns the stored issue (merged with an earlier occurrence when the
    /// category and description match) and the escalation it triggered, if
    /// any. After an escalation the level's window starts over.
    pub fn record(&mut self, level: ReportLevel, issue: Issue, now: DateTime<Utc>) -> (Issue, Option<Escalation>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let threshold = self.threshold;
        let state = self.levels.entry(level).or_default();

        state.window.push_back(now);
        while state.window.front().is_some_and(|t| now - *t > window) {
            state.window.pop_front();
        }

        let stored = state
            .active
            .entry(issue.key())
            .and_modify(|existing| {
                existing.occurrences += 1;
                existing.last_seen = now;
                existing.severity = existing.severity.max(issue.severity);
                for component in &issue.affected_components {
                    if !existing.affected_components.contains(component) {
                        existing.affected_components.push(component.clone());
                    }
                }
            })
            .or_insert_with(|| Issue {
                first_seen: now,
                last_seen: now,
                ..issue.clone()
            });
        state.aggregate = Some(state.aggregate.map_or(stored.severity, |a| a.max(stored.severity)));

        if state.window.len() < threshold {
            return (stored.clone(), None);
        }

        let aggregate = state.aggregate.unwrap_or(stored.severity).raised();
        state.aggregate = Some(aggregate);
        stored.severity = stored.severity.raised();
        stored.escalated = true;
        state.window.clear();
        tracing::warn!(
            level = %level,
            issue_id = %stored.id,
            severity = %stored.severity,
            aggregate = %aggregate,
            "Issue escalated"
        );
        let escalation = Escalation {
            issue_id: stored.id,
            level,
            severity: stored.severity,
        };
        (stored.clone(), Some(escalation))
    }

    /// Remove an issue from the active list.
    pub fn resolve(&mut self, issue_id: Uuid) -> Option<Issue> {
        for state in self.levels.values_mut() {
            let key = state
                .active
                .iter()
                .find(|(_, issue)| issue.id == issue_id)
                .map(|(key, _)| key.clone());
            if let Some(key) = key {
                return state.active.remove(&key);
            }
        }
        None
    }

    /// Active issues, most severe first, then most recent.
    pub fn active(&self) -> Vec<Issue> {
        let mut issues: Vec<Issue> = self
            .levels
            .values()
            .flat_map(|s| s.active.values().cloned())
            .collect();
        issues.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.last_seen.cmp(&a.last_seen)));
        issues
    }

    pub fn active_count(&self) -> usize {
        self.levels.values().map(|s| s.active.len()).sum()
    }

    /// Aggregate severity per level that has seen at least one issue.
    pub fn severities(&self) -> BTreeMap<ReportLevel, Severity> {
        self.levels
            .iter()
            .filter_map(|(level, s)| s.aggregate.map(|a| (*level, a)))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tracker(threshold: usize) -> IssueTracker {
        IssueTracker::new(Duration::from_secs(60), threshold)
    }

    #[test]
    fn test_severity_raises_and_saturates() {
        assert_eq!(Severity::Low.raised(), Severity::Medium);
        assert_eq!(Severity::High.raised(), Severity::Critical);
        assert_eq!(Severity::Critical.raised(), Severity::Critical);
    }

    #[test]
    fn test_failure_mapping() {
        let gate = Issue::from_failure(&Failure::new(ErrorKind::QualityGate, "coverage 40 < 80"));
        assert_eq!(gate.category, IssueCategory::QualityGate);
        assert_eq!(gate.severity, Severity::High);
        assert!(!gate.suggested_actions.is_empty());

        let timeout = Issue::from_failure(&Failure::new(ErrorKind::Timeout, "no reply"));
        assert_eq!(timeout.severity, Severity::Medium);
    }

    #[test]
    fn test_repeats_merge() {
        let mut tracker = tracker(10);
        let now = Utc::now();
        let issue = Issue::new(Severity::Medium, IssueCategory::Execution, "build failed")
            .with_components(vec!["exec-1".into()]);
        tracker.record(ReportLevel::Task, issue.clone(), now);
        let (stored, _) = tracker.record(
            ReportLevel::Task,
            issue.with_components(vec!["exec-2".into()]),
            now,
        );
        assert_eq!(stored.occurrences, 2);
        assert_eq!(stored.affected_components, ["exec-1", "exec-2"]);
        assert_eq!(tracker.active_count(), 1);
    }

    #[test]
    fn test_escalates_at_threshold_within_window() {
        let mut tracker = tracker(3);
        let now = Utc::now();
        for i in 0..2 {
            let issue = Issue::new(Severity::Medium, IssueCategory::Timeout, format!("timeout {i}"));
            let (_, escalation) = tracker.record(ReportLevel::Agent, issue, now);
            assert!(escalation.is_none());
        }
        let third = Issue::new(Severity::Medium, IssueCategory::Timeout, "timeout 2");
        let (stored, escalation) = tracker.record(ReportLevel::Agent, third, now);
        let escalation = escalation.unwrap();
        assert_eq!(escalation.level, ReportLevel::Agent);
        assert_eq!(escalation.severity, Severity::High);
        assert!(stored.escalated);
        assert_eq!(tracker.severities()[&ReportLevel::Agent], Severity::High);

        // The window starts over after an escalation.
        let fourth = Issue::new(Severity::Low, IssueCategory::Timeout, "timeout 3");
        assert!(tracker.record(ReportLevel::Agent, fourth, now).1.is_none());
    }

    #[test]
    fn test_old_issues_leave_the_window() {
        let mut tracker = tracker(2);
        let start = Utc::now();
        let first = Issue::new(Severity::Low, IssueCategory::Capacity, "queue full");
        tracker.record(ReportLevel::Session, first, start);
        let later = start + chrono::Duration::seconds(120);
        let second = Issue::new(Severity::Low, IssueCategory::Capacity, "queue still full");
        assert!(tracker.record(ReportLevel::Session, second, later).1.is_none());
    }

    #[test]
    fn test_resolve_never_lowers_aggregate() {
        let mut tracker = tracker(10);
        let issue = Issue::new(Severity::High, IssueCategory::QualityGate, "lint failed");
        let (stored, _) = tracker.record(ReportLevel::Command, issue, Utc::now());
        let low = Issue::new(Severity::Low, IssueCategory::Validation, "bad title");
        tracker.record(ReportLevel::Command, low, Utc::now());

        assert!(tracker.resolve(stored.id).is_some());
        assert!(tracker.resolve(stored.id).is_none());
        assert_eq!(tracker.active_count(), 1);
        assert_eq!(tracker.severities()[&ReportLevel::Command], Severity::High);
    }
}
