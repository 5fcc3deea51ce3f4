use chrono::{DateTime, Utc};
use conductor_core::{AgentTier, ConductorError, ConductorResult, Failure, Priority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Analyzing,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// Forward-only transitions; any non-terminal state may fail.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Analyzing, Planning)
                | (Planning, Executing)
                | (Executing, Completed)
                | (Pending | Analyzing | Planning | Executing, Failed)
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Analyzing => "analyzing",
            CommandStatus::Planning => "planning",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Thresholds the quality gates compare task-reported metrics against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Minimum line coverage, in percent.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
    #[serde(default)]
    pub max_lint_errors: u64,
    #[serde(default)]
    pub max_failed_tests: u64,
    /// Minimum benchmark improvement, in percent (negative allows regressions).
    #[serde(default)]
    pub min_benchmark_delta: f64,
}

fn default_min_coverage() -> f64 {
    80.0
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_coverage: default_min_coverage(),
            max_lint_errors: 0,
            max_failed_tests: 0,
            min_benchmark_delta: 0.0,
        }
    }
}

/// Caller-supplied context of a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub quality: QualityThresholds,
}

/// A command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(rename = "type")]
    pub command_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: CommandContext,
}

impl CommandSpec {
    pub fn new(command_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            title: title.into(),
            description: String::new(),
            context: CommandContext::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.context.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.context.requirements = requirements;
        self
    }

    pub fn with_quality(mut self, quality: QualityThresholds) -> Self {
        self.context.quality = quality;
        self
    }
}

/// Verdict of one quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub detail: String,
}

/// A high-level request decomposed into a phased task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub command_type: String,
    pub title: String,
    pub description: String,
    pub context: CommandContext,
    pub status: CommandStatus,
    /// Completed tasks over generated tasks, in percent.
    pub progress: f64,
    pub task_ids: Vec<Uuid>,
    /// Processes and agents that received at least one of this command's tasks.
    pub assigned_agents: Vec<String>,
    pub gate_results: Vec<GateResult>,
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn from_spec(spec: CommandSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type: spec.command_type,
            title: spec.title,
            description: spec.description,
            context: spec.context,
            status: CommandStatus::Pending,
            progress: 0.0,
            task_ids: Vec::new(),
            assigned_agents: Vec::new(),
            gate_results: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: CommandStatus) -> ConductorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConductorError::Validation(format!(
                "command {} cannot move from {} to {next}",
                self.id, self.status
            )));
        }
        if self.status == CommandStatus::Pending {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Transition to failed with the given terminal failure.
    pub fn fail(&mut self, failure: Failure) -> ConductorResult<()> {
        self.transition(CommandStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    pub fn note_agent(&mut self, agent_id: &str) {
        if !self.assigned_agents.iter().any(|a| a == agent_id) {
            self.assigned_agents.push(agent_id.to_string());
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// How a process executes work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    InProcess,
    Subprocess,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Idle,
    Busy,
}

/// Bookkeeping for one execution unit in a tier pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub tier: AgentTier,
    pub kind: UnitKind,
    pub status: ProcessStatus,
    pub capabilities: Vec<String>,
    pub current_task: Option<Uuid>,
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
    /// Last reported CPU usage in `[0, 1]`; zero when the unit does not report it.
    pub cpu_usage: f64,
    /// Current load in `[0, 1]`.
    pub load: f64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn new(id: impl Into<String>, tier: AgentTier, kind: UnitKind, capabilities: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tier,
            kind,
            status: ProcessStatus::Idle,
            capabilities,
            current_task: None,
            tasks_assigned: 0,
            tasks_completed: 0,
            errors: 0,
            total_duration_ms: 0,
            cpu_usage: 0.0,
            load: 0.0,
            created_at: now,
            last_active: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == ProcessStatus::Idle
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.capabilities.contains(r))
    }

    /// Mean duration of finished attempts, in seconds.
    pub fn avg_duration_secs(&self) -> Option<f64> {
        let finished = self.tasks_completed + self.errors;
        if finished == 0 {
            None
        } else {
            Some(self.total_duration_ms as f64 / finished as f64 / 1000.0)
        }
    }

    pub fn error_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.errors;
        if finished == 0 {
            0.0
        } else {
            self.errors as f64 / finished as f64
        }
    }

    pub(crate) fn assign(&mut self, task_id: Uuid) {
        self.status = ProcessStatus::Busy;
        self.current_task = Some(task_id);
        self.tasks_assigned += 1;
        self.load = 1.0;
        self.last_active = Utc::now();
    }

    pub(crate) fn release(&mut self, outcome: Option<(bool, u64)>) {
        if let Some((succeeded, duration_ms)) = outcome {
            if succeeded {
                self.tasks_completed += 1;
            } else {
                self.errors += 1;
            }
            self.total_duration_ms += duration_ms;
        }
        self.status = ProcessStatus::Idle;
        self.current_task = None;
        self.load = 0.0;
        self.last_active = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lifecycle() {
        let mut cmd = Command::from_spec(CommandSpec::new("FIX_BUG", "Crash on save"));
        assert_eq!(cmd.status, CommandStatus::Pending);
        cmd.transition(CommandStatus::Analyzing).unwrap();
        assert!(cmd.started_at.is_some());
        cmd.transition(CommandStatus::Planning).unwrap();
        cmd.transition(CommandStatus::Executing).unwrap();
        cmd.transition(CommandStatus::Completed).unwrap();
        assert!(cmd.completed_at.is_some());
        assert!(cmd.fail(Failure::cancelled()).is_err());
    }

    #[test]
    fn test_command_cannot_skip_states() {
        let mut cmd = Command::from_spec(CommandSpec::new("FIX_BUG", "x"));
        assert!(cmd.transition(CommandStatus::Executing).is_err());
        assert!(cmd.transition(CommandStatus::Completed).is_err());
        cmd.fail(Failure::cancelled()).unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert!(cmd.transition(CommandStatus::Analyzing).is_err());
    }

    #[test]
    fn test_spec_wire_format() {
        let raw = r#"{"type": "IMPLEMENT_FEATURE", "title": "Login", "context": {"priority": "high"}}"#;
        let spec: CommandSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.command_type, "IMPLEMENT_FEATURE");
        assert_eq!(spec.context.priority, Priority::High);
        assert_eq!(spec.context.quality.min_coverage, 80.0);
    }

    #[test]
    fn test_process_rates() {
        let mut p = ProcessInfo::new("executor-1", AgentTier::Executor, UnitKind::InProcess, vec![]);
        assert!(p.avg_duration_secs().is_none());
        p.assign(Uuid::new_v4());
        assert!(!p.is_idle());
        p.release(Some((true, 2_000)));
        p.assign(Uuid::new_v4());
        p.release(Some((false, 4_000)));
        assert_eq!(p.avg_duration_secs(), Some(3.0));
        assert_eq!(p.error_rate(), 0.5);
        assert!(p.is_idle());
    }
}
