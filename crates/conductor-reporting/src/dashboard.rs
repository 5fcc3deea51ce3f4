use crate::issue::{Issue, Severity};
use crate::report::{MetricsSample, ReportLevel};
use chrono::{DateTime, Utc};
use conductor_core::AgentTier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOverview {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub reports_ingested: u64,
    pub commands_total: usize,
    pub commands_active: usize,
    pub commands_completed: usize,
    pub commands_failed: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub agents_online: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub tier: Option<AgentTier>,
    pub status: String,
    pub load: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_task_duration_ms: f64,
    pub last_seen: DateTime<Utc>,
}

impl AgentPerformance {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            tier: None,
            status: "online".to_string(),
            load: 0.0,
            tasks_completed: 0,
            tasks_failed: 0,
            avg_task_duration_ms: 0.0,
            last_seen: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self.status.as_str(), "offline" | "terminated")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandView {
    pub command_id: Uuid,
    pub command_type: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub progress: f64,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub updated_at: DateTime<Utc>,
}

impl CommandView {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub command_id: Option<Uuid>,
    pub agent_id: Option<String>,
    pub status: String,
    pub progress: f64,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilisation {
    pub tier: AgentTier,
    pub busy: usize,
    pub total: usize,
    pub queued: usize,
    pub utilisation: f64,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time copy of every aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    pub generated_at: DateTime<Utc>,
    pub session: SessionOverview,
    pub agents: Vec<AgentPerformance>,
    pub commands: Vec<CommandView>,
    pub resources: Vec<ResourceUtilisation>,
    pub issues: Vec<Issue>,
    pub severity: BTreeMap<ReportLevel, Severity>,
}

/// Live aggregates updated by each ingested report.
pub(crate) struct Dashboard {
    started_at: DateTime<Utc>,
    reports_ingested: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    total_task_duration_ms: u64,
    agents: HashMap<String, AgentPerformance>,
    commands: HashMap<Uuid, CommandView>,
    tasks: HashMap<Uuid, TaskView>,
    resources: BTreeMap<AgentTier, ResourceUtilisation>,
    task_limit: usize,
}

impl Dashboard {
    pub(crate) fn new(task_limit: usize) -> Self {
        Self {
            started_at: Utc::now(),
            reports_ingested: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            total_task_duration_ms: 0,
            agents: HashMap::new(),
            commands: HashMap::new(),
            tasks: HashMap::new(),
            resources: BTreeMap::new(),
            task_limit: task_limit.max(1),
        }
    }

    pub(crate) fn count_report(&mut self) {
        self.reports_ingested += 1;
    }

    pub(crate) fn task_progress(
        &mut self,
        task_id: Uuid,
        command_id: Option<Uuid>,
        agent_id: Option<&str>,
        progress: f64,
        message: Option<String>,
    ) -> &TaskView {
        if let Some(agent) = agent_id {
            self.agent_mut(agent).status = "busy".to_string();
        }
        let view = self.upsert_task(task_id, command_id, agent_id);
        view.progress = progress.clamp(0.0, 100.0);
        view.message = message;
        view
    }

    pub(crate) fn task_completion(
        &mut self,
        task_id: Uuid,
        command_id: Option<Uuid>,
        agent_id: Option<&str>,
        duration_ms: u64,
        succeeded: bool,
    ) -> &TaskView {
        if succeeded {
            self.tasks_completed += 1;
            self.total_task_duration_ms += duration_ms;
        } else {
            self.tasks_failed += 1;
        }
        if let Some(agent) = agent_id {
            let perf = self.agent_mut(agent);
            if succeeded {
                let n = perf.tasks_completed as f64;
                perf.avg_task_duration_ms = (perf.avg_task_duration_ms * n + duration_ms as f64) / (n + 1.0);
                perf.tasks_completed += 1;
            } else {
                perf.tasks_failed += 1;
            }
            perf.status = "idle".to_string();
        }
        let view = self.upsert_task(task_id, command_id, agent_id);
        view.status = if succeeded { "completed" } else { "failed" }.to_string();
        view.progress = if succeeded { 100.0 } else { view.progress };
        view.duration_ms = Some(duration_ms);
        view
    }

    pub(crate) fn agent_status(&mut self, agent_id: &str, tier: Option<AgentTier>, status: &str, load: f64) -> &AgentPerformance {
        let perf = self.agent_mut(agent_id);
        if tier.is_some() {
            perf.tier = tier;
        }
        perf.status = status.to_string();
        perf.load = load;
        perf
    }

    pub(crate) fn command_progress(&mut self, update: CommandUpdate) -> &CommandView {
        let now = Utc::now();
        let view = self.commands.entry(update.command_id).or_insert_with(|| CommandView {
            command_id: update.command_id,
            command_type: None,
            title: None,
            status: "pending".to_string(),
            progress: 0.0,
            completed_tasks: 0,
            total_tasks: 0,
            updated_at: now,
        });
        if update.command_type.is_some() {
            view.command_type = update.command_type;
        }
        if update.title.is_some() {
            view.title = update.title;
        }
        view.status = update.status;
        if let Some(progress) = update.progress {
            view.progress = progress.clamp(0.0, 100.0);
        }
        if let Some((completed, total)) = update.tasks {
            view.completed_tasks = completed;
            view.total_tasks = total;
        }
        view.updated_at = now;
        view
    }

    pub(crate) fn pool_utilisation(&mut self, tier: AgentTier, busy: usize, total: usize, queued: usize) -> &ResourceUtilisation {
        let utilisation = if total == 0 {
            0.0
        } else {
            busy as f64 / total as f64 * 100.0
        };
        let entry = ResourceUtilisation {
            tier,
            busy,
            total,
            queued,
            utilisation,
            updated_at: Utc::now(),
        };
        self.resources.insert(tier, entry);
        &self.resources[&tier]
    }

    pub(crate) fn agent(&self, agent_id: &str) -> Option<&AgentPerformance> {
        self.agents.get(agent_id)
    }

    pub(crate) fn command(&self, command_id: Uuid) -> Option<&CommandView> {
        self.commands.get(&command_id)
    }

    pub(crate) fn task(&self, task_id: Uuid) -> Option<&TaskView> {
        self.tasks.get(&task_id)
    }

    pub(crate) fn overview(&self) -> SessionOverview {
        let now = Utc::now();
        let completed = self.commands.values().filter(|c| c.status == "completed").count();
        let failed = self.commands.values().filter(|c| c.status == "failed").count();
        SessionOverview {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            reports_ingested: self.reports_ingested,
            commands_total: self.commands.len(),
            commands_active: self.commands.len() - completed - failed,
            commands_completed: completed,
            commands_failed: failed,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            agents_online: self.agents.values().filter(|a| a.is_online()).count(),
        }
    }

    pub(crate) fn sample(&self, open_issues: usize) -> MetricsSample {
        let overview = self.overview();
        let avg = if self.tasks_completed == 0 {
            0.0
        } else {
            self.total_task_duration_ms as f64 / self.tasks_completed as f64
        };
        MetricsSample {
            timestamp: Utc::now(),
            reports_ingested: overview.reports_ingested,
            active_commands: overview.commands_active,
            completed_commands: overview.commands_completed,
            failed_commands: overview.commands_failed,
            tasks_completed: overview.tasks_completed,
            tasks_failed: overview.tasks_failed,
            agents_online: overview.agents_online,
            avg_task_duration_ms: avg,
            open_issues,
        }
    }

    pub(crate) fn data(&self, issues: Vec<Issue>, severity: BTreeMap<ReportLevel, Severity>) -> DashboardData {
        let mut agents: Vec<AgentPerformance> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let mut commands: Vec<CommandView> = self.commands.values().cloned().collect();
        commands.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        DashboardData {
            generated_at: Utc::now(),
            session: self.overview(),
            agents,
            commands,
            resources: self.resources.values().cloned().collect(),
            issues,
            severity,
        }
    }

    fn upsert_task(&mut self, task_id: Uuid, command_id: Option<Uuid>, agent_id: Option<&str>) -> &mut TaskView {
        let now = Utc::now();
        if !self.tasks.contains_key(&task_id) {
            self.evict_tasks();
        }
        let view = self.tasks.entry(task_id).or_insert_with(|| TaskView {
            task_id,
            command_id,
            agent_id: None,
            status: "in_progress".to_string(),
            progress: 0.0,
            message: None,
            duration_ms: None,
            updated_at: now,
        });
        if command_id.is_some() {
            view.command_id = command_id;
        }
        if let Some(agent) = agent_id {
            view.agent_id = Some(agent.to_string());
        }
        view.updated_at = now;
        view
    }

    fn agent_mut(&mut self, agent_id: &str) -> &mut AgentPerformance {
        let perf = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentPerformance::new(agent_id));
        perf.last_seen = Utc::now();
        perf
    }

    /// Forget the oldest finished tasks once the table is full.
    fn evict_tasks(&mut self) {
        if self.tasks.len() < self.task_limit {
            return;
        }
        let oldest = self
            .tasks
            .values()
            .filter(|t| t.status != "in_progress")
            .min_by_key(|t| t.updated_at)
            .map(|t| t.task_id);
        if let Some(id) = oldest {
            self.tasks.remove(&id);
        }
    }
}

/// Fields of a command progress report; `None` keeps the previous value.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    pub command_id: Uuid,
    pub command_type: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub progress: Option<f64>,
    pub tasks: Option<(usize, usize)>,
}

impl CommandUpdate {
    pub fn new(command_id: Uuid, status: impl Into<String>) -> Self {
        Self {
            command_id,
            command_type: None,
            title: None,
            status: status.into(),
            progress: None,
            tasks: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_tasks(mut self, completed: usize, total: usize) -> Self {
        self.tasks = Some((completed, total));
        self
    }

    pub fn with_identity(mut self, command_type: impl Into<String>, title: impl Into<String>) -> Self {
        self.command_type = Some(command_type.into());
        self.title = Some(title.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_averages() {
        let mut dashboard = Dashboard::new(100);
        let agent = "executor-1";
        dashboard.task_completion(Uuid::new_v4(), None, Some(agent), 100, true);
        dashboard.task_completion(Uuid::new_v4(), None, Some(agent), 300, true);
        dashboard.task_completion(Uuid::new_v4(), None, Some(agent), 0, false);

        let perf = dashboard.agent(agent).unwrap();
        assert_eq!(perf.tasks_completed, 2);
        assert_eq!(perf.tasks_failed, 1);
        assert_eq!(perf.avg_task_duration_ms, 200.0);
        assert_eq!(perf.status, "idle");
        assert_eq!(dashboard.sample(0).avg_task_duration_ms, 200.0);
    }

    #[test]
    fn test_command_counts() {
        let mut dashboard = Dashboard::new(100);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        dashboard.command_progress(CommandUpdate::new(a, "pending").with_identity("FIX_BUG", "Crash"));
        dashboard.command_progress(CommandUpdate::new(b, "executing").with_progress(40.0).with_tasks(2, 5));
        dashboard.command_progress(CommandUpdate::new(a, "completed").with_progress(100.0));

        let overview = dashboard.overview();
        assert_eq!(overview.commands_total, 2);
        assert_eq!(overview.commands_completed, 1);
        assert_eq!(overview.commands_active, 1);

        let view = dashboard.command(a).unwrap();
        assert_eq!(view.command_type.as_deref(), Some("FIX_BUG"));
        assert!(view.is_terminal());
        assert_eq!(dashboard.command(b).unwrap().total_tasks, 5);
    }

    #[test]
    fn test_task_table_is_bounded() {
        let mut dashboard = Dashboard::new(2);
        for _ in 0..3 {
            dashboard.task_completion(Uuid::new_v4(), None, None, 1, true);
        }
        assert!(dashboard.tasks.len() <= 2);
        let running = Uuid::new_v4();
        dashboard.task_progress(running, None, None, 50.0, None);
        assert_eq!(dashboard.task(running).unwrap().progress, 50.0);
    }

    #[test]
    fn test_utilisation() {
        let mut dashboard = Dashboard::new(10);
        let pool = dashboard.pool_utilisation(AgentTier::Executor, 3, 4, 1);
        assert_eq!(pool.utilisation, 75.0);
        let empty = dashboard.pool_utilisation(AgentTier::Planner, 0, 0, 0);
        assert_eq!(empty.utilisation, 0.0);
    }
}
