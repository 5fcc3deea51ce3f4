use crate::error::{ConductorError, ConductorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Category of execution unit. Each tier has its own pool, capabilities,
/// and scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTier {
    /// Analyses requirements and designs solutions.
    Planner,
    /// Reviews and coordinates the work of other tiers.
    Coordinator,
    /// Performs implementation and verification work.
    Executor,
}

impl AgentTier {
    /// Every tier, in hierarchy order.
    pub const ALL: [AgentTier; 3] = [AgentTier::Planner, AgentTier::Coordinator, AgentTier::Executor];
}

impl std::fmt::Display for AgentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentTier::Planner => write!(f, "planner"),
            AgentTier::Coordinator => write!(f, "coordinator"),
            AgentTier::Executor => write!(f, "executor"),
        }
    }
}

impl FromStr for AgentTier {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "planner" => Ok(AgentTier::Planner),
            "coordinator" => Ok(AgentTier::Coordinator),
            "executor" => Ok(AgentTier::Executor),
            other => Err(ConductorError::Validation(format!("unknown agent tier '{other}'"))),
        }
    }
}

/// Scheduling priority. Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default priority.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    Critical,
}

/// Status of a task in a command's task graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed { reason: String },
}

impl TaskStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// The smallest dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    /// Free-form work type (e.g. the phase name that produced it).
    pub task_type: String,
    /// Tier whose pool executes this task.
    pub tier: AgentTier,
    #[serde(default)]
    pub priority: Priority,
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Remaining requeue budget for retryable failures.
    #[serde(default)]
    pub retries: u32,
    /// Number of dispatch attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Command that generated this task, if any.
    #[serde(default)]
    pub command_id: Option<Uuid>,
    /// Process or agent currently (or last) executing this task.
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, task_type: impl Into<String>, tier: AgentTier) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            task_type: task_type.into(),
            tier,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            payload: serde_json::Value::Null,
            status: TaskStatus::Pending,
            retries: 0,
            attempts: 0,
            command_id: None,
            assigned_to: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn for_command(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    /// Pending with every dependency completed.
    pub fn is_ready(&self, completed_ids: &[Uuid]) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependencies
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }

    /// pending → in_progress.
    pub fn start(&mut self) -> ConductorResult<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.illegal_transition("in_progress"));
        }
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// in_progress → completed.
    pub fn complete(&mut self, result: serde_json::Value) -> ConductorResult<()> {
        if self.status != TaskStatus::InProgress {
            return Err(self.illegal_transition("completed"));
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// pending | in_progress → failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> ConductorResult<()> {
        if self.status.is_terminal() {
            return Err(self.illegal_transition("failed"));
        }
        self.status = TaskStatus::Failed {
            reason: reason.into(),
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn illegal_transition(&self, to: &str) -> ConductorError {
        ConductorError::Validation(format!(
            "task {} cannot move from {:?} to {to}",
            self.id, self.status
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Implement auth module", "implementation", AgentTier::Executor);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.tier, AgentTier::Executor);
        assert!(task.dependencies.is_empty());
        assert_eq!(task.priority, Priority::Normal);
    }

    #[test]
    fn test_task_is_ready_with_deps() {
        let dep_id = Uuid::new_v4();
        let task = Task::new("Dependent", "design", AgentTier::Planner).with_dependencies(vec![dep_id]);
        assert!(!task.is_ready(&[]));
        assert!(task.is_ready(&[dep_id]));
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut task = Task::new("Build", "implementation", AgentTier::Executor);
        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.started_at.is_some());
        task.complete(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_cannot_skip_to_completed() {
        let mut task = Task::new("Build", "implementation", AgentTier::Executor);
        assert!(task.complete(serde_json::Value::Null).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = Task::new("Build", "implementation", AgentTier::Executor);
        task.fail("cancelled").unwrap();
        assert!(task.start().is_err());
        assert!(task.fail("again").is_err());
        assert_eq!(
            task.status,
            TaskStatus::Failed {
                reason: "cancelled".into()
            }
        );
    }

    #[test]
    fn test_tier_display_and_parse() {
        assert_eq!(AgentTier::Coordinator.to_string(), "coordinator");
        assert_eq!("EXECUTOR".parse::<AgentTier>().unwrap(), AgentTier::Executor);
        assert!("manager".parse::<AgentTier>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_task_status_serialization() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
        assert_eq!(serde_json::to_string(&TaskStatus::InProgress).unwrap(), "\"in_progress\"");
    }
}
