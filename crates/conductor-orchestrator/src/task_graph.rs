use conductor_core::{ConductorError, ConductorResult, Task, TaskStatus};
use std::collections::HashMap;
use uuid::Uuid;

/// A command's tasks and the dependency edges between them.
pub struct TaskGraph {
    tasks: HashMap<Uuid, Task>,
    order: Vec<Uuid>,
    completed: Vec<Uuid>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Build a graph and reject it if it references unknown tasks or has a cycle.
    pub fn from_tasks(tasks: Vec<Task>) -> ConductorResult<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add(task);
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn add(&mut self, task: Task) -> Uuid {
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        id
    }

    pub fn validate(&self) -> ConductorResult<()> {
        for task in self.tasks.values() {
            if let Some(missing) = task.dependencies.iter().find(|d| !self.tasks.contains_key(d)) {
                return Err(ConductorError::Validation(format!(
                    "task '{}' depends on unknown task {missing}",
                    task.title
                )));
            }
        }
        if self.has_cycle() {
            return Err(ConductorError::Validation(
                "dependency cycle detected in task graph".to_string(),
            ));
        }
        Ok(())
    }

    /// Pending tasks whose dependencies have all completed, in insertion order.
    pub fn ready(&self) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_ready(&self.completed))
            .collect()
    }

    pub fn mark_started(&mut self, id: Uuid) -> ConductorResult<()> {
        self.task_mut(id)?.start()
    }

    pub fn mark_completed(&mut self, id: Uuid, result: serde_json::Value) -> ConductorResult<()> {
        self.task_mut(id)?.complete(result)?;
        self.completed.push(id);
        Ok(())
    }

    pub fn mark_failed(&mut self, id: Uuid, reason: impl Into<String>) -> ConductorResult<()> {
        self.task_mut(id)?.fail(reason)
    }

    /// Record who executed a task.
    pub fn set_assignee(&mut self, id: Uuid, assignee: &str) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.assigned_to = Some(assignee.to_string());
        }
    }

    /// Fail every task that has not reached a terminal state. Returns the
    /// ids that were in progress.
    pub fn fail_open(&mut self, reason: &str) -> Vec<Uuid> {
        let mut in_progress = Vec::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.status == TaskStatus::InProgress {
                    in_progress.push(*id);
                }
                if !task.status.is_terminal() {
                    let _ = task.fail(reason);
                }
            }
        }
        in_progress
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.order.clone()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Completed over total, in percent.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 100.0;
        }
        self.completed.len() as f64 / self.tasks.len() as f64 * 100.0
    }

    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Results of completed tasks in insertion order.
    pub fn results(&self) -> Vec<serde_json::Value> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.result.clone())
            .collect()
    }

    /// Number of tasks on the longest dependency chain.
    pub fn longest_chain(&self) -> usize {
        let mut memo = HashMap::new();
        self.order
            .iter()
            .map(|id| self.depth(*id, &mut memo))
            .max()
            .unwrap_or(0)
    }

    fn depth(&self, id: Uuid, memo: &mut HashMap<Uuid, usize>) -> usize {
        if let Some(d) = memo.get(&id) {
            return *d;
        }
        memo.insert(id, 0);
        let deps = self
            .tasks
            .get(&id)
            .map(|t| t.dependencies.clone())
            .unwrap_or_default();
        let d = 1 + deps.iter().map(|dep| self.depth(*dep, memo)).max().unwrap_or(0);
        memo.insert(id, d);
        d
    }

    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for &id in self.tasks.keys() {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // finished
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    fn task_mut(&mut self, id: Uuid) -> ConductorResult<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::AgentTier;

    fn chain(n: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = Vec::new();
        for i in 0..n {
            let mut task = Task::new(format!("step {i}"), "step", AgentTier::Executor);
            if let Some(prev) = tasks.last() {
                task = task.with_dependencies(vec![prev.id]);
            }
            tasks.push(task);
        }
        tasks
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert_eq!(graph.total_count(), 0);
        assert!(graph.is_done());
        assert!(graph.ready().is_empty());
        assert_eq!(graph.longest_chain(), 0);
    }

    #[test]
    fn test_chain_releases_one_task_at_a_time() {
        let tasks = chain(3);
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        let mut graph = TaskGraph::from_tasks(tasks).unwrap();
        assert_eq!(graph.longest_chain(), 3);

        for (i, id) in ids.iter().enumerate() {
            let ready = graph.ready();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].id, *id);
            graph.mark_started(*id).unwrap();
            assert!(graph.ready().is_empty());
            graph.mark_completed(*id, serde_json::json!(i)).unwrap();
        }
        assert!(graph.is_done());
        assert_eq!(graph.progress(), 100.0);
        assert_eq!(graph.results().len(), 3);
    }

    #[test]
    fn test_independent_tasks_are_ready_together() {
        let tasks: Vec<Task> = (0..3)
            .map(|i| Task::new(format!("review {i}"), "review", AgentTier::Coordinator))
            .collect();
        let graph = TaskGraph::from_tasks(tasks).unwrap();
        assert_eq!(graph.ready().len(), 3);
        assert_eq!(graph.longest_chain(), 1);
    }

    #[test]
    fn test_cycle_detection() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let mut t1 = Task::new("A", "a", AgentTier::Planner);
        t1.id = id1;
        t1.dependencies = vec![id2];
        let mut t2 = Task::new("B", "b", AgentTier::Executor);
        t2.id = id2;
        t2.dependencies = vec![id1];

        let err = TaskGraph::from_tasks(vec![t1, t2]).err().unwrap();
        assert!(matches!(err, ConductorError::Validation(_)));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let task = Task::new("orphan", "x", AgentTier::Executor).with_dependencies(vec![Uuid::new_v4()]);
        assert!(TaskGraph::from_tasks(vec![task]).is_err());
    }

    #[test]
    fn test_fail_open_reports_in_progress() {
        let tasks = chain(3);
        let first = tasks[0].id;
        let mut graph = TaskGraph::from_tasks(tasks).unwrap();
        graph.mark_started(first).unwrap();

        let in_progress = graph.fail_open("cancelled");
        assert_eq!(in_progress, vec![first]);
        assert!(graph.is_done());
        assert!(graph
            .tasks()
            .iter()
            .all(|t| t.status == TaskStatus::Failed { reason: "cancelled".into() }));
    }

    #[test]
    fn test_progress_counts_completed_only() {
        let tasks = chain(4);
        let first = tasks[0].id;
        let mut graph = TaskGraph::from_tasks(tasks).unwrap();
        graph.mark_started(first).unwrap();
        graph.mark_completed(first, serde_json::Value::Null).unwrap();
        assert_eq!(graph.progress(), 25.0);
        assert_eq!(graph.pending_count(), 3);
    }
}
