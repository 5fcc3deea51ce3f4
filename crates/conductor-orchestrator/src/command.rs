use crate::controller::{Placement, ProcessController, TaskOutcome};
use crate::gates::{CommandGate, CommandGateConfig, GateContext, GateRegistry, QualityGate};
use crate::strategy::{CommandStrategy, StrategyRegistry};
use crate::task_graph::TaskGraph;
use crate::types::{Command, CommandSpec, CommandStatus};
use conductor_core::{ConductorError, ConductorResult, EventBus, Failure, OrchestratorEvent, Task};
use conductor_hub::{Cancellation, Message, MessageType};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Requeue budget given to every generated task.
    #[serde(default = "default_task_retries")]
    pub default_task_retries: u32,
    /// Finished commands kept for queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// External check programs, registered over the built-in gates.
    #[serde(default)]
    pub gates: Vec<CommandGateConfig>,
}

fn default_task_retries() -> u32 {
    2
}

fn default_history_limit() -> usize {
    500
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_task_retries: default_task_retries(),
            history_limit: default_history_limit(),
            gates: Vec::new(),
        }
    }
}

impl CommandConfig {
    pub fn validate(&self) -> ConductorResult<()> {
        self.gates.iter().try_for_each(CommandGateConfig::validate)
    }
}

struct CommandRecord {
    command: Command,
    graph: TaskGraph,
    cancel: Arc<Notify>,
    done: Arc<Notify>,
}

impl CommandRecord {
    fn progress_event(&self) -> OrchestratorEvent {
        OrchestratorEvent::CommandProgress {
            command_id: self.command.id,
            status: self.command.status.to_string(),
            progress: self.command.progress,
            completed_tasks: self.graph.completed_count(),
            total_tasks: self.graph.total_count(),
        }
    }
}

/// Turns commands into phased task graphs and drives them to completion.
///
/// `execute_command` returns as soon as the command is accepted; a spawned
/// run loop then moves it through analyzing, planning, and executing,
/// dispatching each task once its dependencies have completed, and finally
/// runs the strategy's quality gates.
pub struct CommandSystem {
    config: CommandConfig,
    controller: Arc<ProcessController>,
    strategies: RwLock<StrategyRegistry>,
    gates: RwLock<GateRegistry>,
    events: EventBus,
    records: RwLock<HashMap<Uuid, CommandRecord>>,
    history: Mutex<VecDeque<Uuid>>,
}

impl CommandSystem {
    pub fn new(config: CommandConfig, controller: Arc<ProcessController>) -> Arc<Self> {
        let events = controller.events().clone();
        let mut gates = GateRegistry::builtin();
        for gate in &config.gates {
            info!(gate = %gate.name, program = %gate.program, "External quality gate registered");
            gates.register(Arc::new(CommandGate::from_config(gate)));
        }
        Arc::new(Self {
            config,
            controller,
            strategies: RwLock::new(StrategyRegistry::builtin()),
            gates: RwLock::new(gates),
            events,
            records: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.controller
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn register_strategy(&self, strategy: CommandStrategy) {
        self.strategies.write().register(strategy);
    }

    pub fn register_gate(&self, gate: Arc<dyn QualityGate>) {
        self.gates.write().register(gate);
    }

    pub fn strategies(&self) -> Vec<CommandStrategy> {
        self.strategies.read().strategies().cloned().collect()
    }

    /// Accept a command and start running it in the background.
    ///
    /// An unknown command type is rejected here, before any task exists.
    pub fn execute_command(self: &Arc<Self>, spec: CommandSpec) -> ConductorResult<Uuid> {
        if spec.title.trim().is_empty() {
            return Err(ConductorError::Validation("command title must not be empty".into()));
        }
        let strategy = self.strategies.read().resolve(&spec.command_type)?.clone();

        let mut command = Command::from_spec(spec);
        command.command_type = strategy.command_type.clone();
        let command_id = command.id;
        info!(
            command_id = %command_id,
            command_type = %command.command_type,
            title = %command.title,
            "Command accepted"
        );
        self.events.emit(OrchestratorEvent::CommandStarted {
            command_id,
            command_type: command.command_type.clone(),
            title: command.title.clone(),
        });

        self.records.write().insert(
            command_id,
            CommandRecord {
                command,
                graph: TaskGraph::new(),
                cancel: Arc::new(Notify::new()),
                done: Arc::new(Notify::new()),
            },
        );
        self.remember(command_id);

        let system = self.clone();
        tokio::spawn(async move {
            let result = system.drive(command_id, &strategy).await;
            system.finish(command_id, result).await;
        });
        Ok(command_id)
    }

    fn remember(&self, command_id: Uuid) {
        let mut history = self.history.lock();
        history.push_back(command_id);
        if history.len() <= self.config.history_limit {
            return;
        }
        let mut records = self.records.write();
        let mut keep = VecDeque::with_capacity(history.len());
        let mut excess = history.len() - self.config.history_limit;
        while let Some(id) = history.pop_front() {
            let finished = records.get(&id).is_some_and(|r| r.command.status.is_terminal());
            if excess > 0 && finished {
                records.remove(&id);
                excess -= 1;
            } else {
                keep.push_back(id);
            }
        }
        *history = keep;
    }

    /// Move a command forward. Returns false if it already reached a terminal
    /// state elsewhere (cancellation).
    fn advance(&self, command_id: Uuid, next: CommandStatus) -> ConductorResult<bool> {
        let event = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            if record.command.status.is_terminal() {
                return Ok(false);
            }
            record.command.transition(next)?;
            record.progress_event()
        };
        info!(command_id = %command_id, status = %next, "Command advanced");
        self.events.emit(event);
        Ok(true)
    }

    async fn drive(&self, command_id: Uuid, strategy: &CommandStrategy) -> ConductorResult<()> {
        if !self.advance(command_id, CommandStatus::Analyzing)? {
            return Ok(());
        }
        let (title, context) = {
            let records = self.records.read();
            let record = records
                .get(&command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            (
                record.command.title.clone(),
                serde_json::to_value(&record.command.context)?,
            )
        };

        let tasks = strategy.plan(command_id, &title, &context, self.config.default_task_retries);
        let graph = TaskGraph::from_tasks(tasks)?;
        let cancel = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            record.command.task_ids = graph.ids();
            record.graph = graph;
            record.cancel.clone()
        };
        if !self.advance(command_id, CommandStatus::Planning)? {
            return Ok(());
        }
        if !self.advance(command_id, CommandStatus::Executing)? {
            return Ok(());
        }

        let mut inflight: FuturesUnordered<oneshot::Receiver<TaskOutcome>> = FuturesUnordered::new();
        loop {
            let (tickets, dispatch_error) = self.dispatch_ready(command_id).await;
            for ticket in tickets {
                inflight.push(ticket);
            }
            // Tasks already handed out are cancelled when the command fails.
            if let Some(e) = dispatch_error {
                return Err(e);
            }
            if inflight.is_empty() {
                break;
            }
            tokio::select! {
                _ = cancel.notified() => return Ok(()),
                Some(received) = inflight.next() => {
                    let outcome = received.map_err(|_| {
                        ConductorError::Execution("task outcome channel closed".into())
                    })?;
                    if !self.record_outcome(command_id, outcome)? {
                        return Ok(());
                    }
                }
            }
        }

        let (ctx, gate_names) = {
            let records = self.records.read();
            let record = records
                .get(&command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            if record.command.status.is_terminal() {
                return Ok(());
            }
            if record.graph.completed_count() != record.graph.total_count() {
                return Err(ConductorError::Execution(format!(
                    "{} of {} tasks could not be scheduled",
                    record.graph.total_count() - record.graph.completed_count(),
                    record.graph.total_count()
                )));
            }
            (
                GateContext::new(
                    command_id,
                    record.command.command_type.clone(),
                    record.command.context.quality.clone(),
                    record.graph.results(),
                ),
                strategy.gates.clone(),
            )
        };
        let registry = self.gates.read().clone();
        let results = registry.run(&gate_names, &ctx).await;
        let failed = results.iter().find(|r| !r.passed).cloned();
        if let Some(record) = self.records.write().get_mut(&command_id) {
            record.command.gate_results = results;
        }
        if let Some(failed) = failed {
            self.events.emit(OrchestratorEvent::QualityGateFailed {
                command_id,
                gate: failed.gate.clone(),
                reason: failed.detail.clone(),
            });
            return Err(ConductorError::QualityGate {
                gate: failed.gate,
                reason: failed.detail,
            });
        }
        Ok(())
    }

    /// Hand every ready task to the controller.
    ///
    /// Tasks are started and assigned one at a time, and the command is
    /// re-checked around each assignment so that a concurrent cancellation
    /// never leaves a task running. The first assignment error stops
    /// dispatch and is returned next to the tickets already issued.
    async fn dispatch_ready(
        &self,
        command_id: Uuid,
    ) -> (Vec<oneshot::Receiver<TaskOutcome>>, Option<ConductorError>) {
        let ids: Vec<Uuid> = match self.records.read().get(&command_id) {
            Some(record) if !record.command.status.is_terminal() => {
                record.graph.ready().iter().map(|t| t.id).collect()
            }
            _ => return (Vec::new(), None),
        };

        let mut receivers = Vec::with_capacity(ids.len());
        for id in ids {
            let task = {
                let mut records = self.records.write();
                let Some(record) = records.get_mut(&command_id) else {
                    break;
                };
                if record.command.status.is_terminal() {
                    break;
                }
                if let Err(e) = record.graph.mark_started(id) {
                    return (receivers, Some(e));
                }
                match record.graph.get(id) {
                    Some(task) => task.clone(),
                    None => continue,
                }
            };

            let required = task.required_capabilities.clone();
            let ticket = match self.controller.assign_task_to_process(task, required) {
                Ok(ticket) => ticket,
                Err(e) => {
                    if let Some(record) = self.records.write().get_mut(&command_id) {
                        if let Err(mark) = record.graph.mark_failed(id, e.to_string()) {
                            warn!(command_id = %command_id, task_id = %id, error = %mark, "Could not fail task");
                        }
                    }
                    return (receivers, Some(e));
                }
            };

            let withdrawn = {
                let mut records = self.records.write();
                match records.get_mut(&command_id) {
                    Some(record) if !record.command.status.is_terminal() => {
                        if let Placement::Dispatched { process_id } = &ticket.placement {
                            record.command.note_agent(process_id);
                            record.graph.set_assignee(ticket.task_id, process_id);
                        }
                        false
                    }
                    _ => true,
                }
            };
            if withdrawn {
                info!(command_id = %command_id, task_id = %ticket.task_id, "Command finished during dispatch, withdrawing task");
                self.controller.cancel_task(ticket.task_id).await;
                break;
            }
            receivers.push(ticket.outcome);
        }
        (receivers, None)
    }

    /// Fold a task outcome into the graph. A failed task fails the command.
    /// Returns false if the command was already finished.
    fn record_outcome(&self, command_id: Uuid, outcome: TaskOutcome) -> ConductorResult<bool> {
        let TaskOutcome { task, result } = outcome;
        let event = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&command_id) else {
                return Ok(false);
            };
            if record.command.status.is_terminal() {
                return Ok(false);
            }
            if let Some(agent) = &task.assigned_to {
                record.command.note_agent(agent);
                record.graph.set_assignee(task.id, agent);
            }
            match result {
                Ok(value) => {
                    record.graph.mark_completed(task.id, value)?;
                    record.command.progress = record.graph.progress();
                    record.progress_event()
                }
                Err(failure) => {
                    warn!(command_id = %command_id, task_id = %task.id, failure = %failure, "Command task failed");
                    if let Err(e) = record.graph.mark_failed(task.id, failure.message.clone()) {
                        warn!(command_id = %command_id, task_id = %task.id, error = %e, "Could not fail task");
                    }
                    return Err(failure.into());
                }
            }
        };
        self.events.emit(event);
        Ok(true)
    }

    async fn finish(&self, command_id: Uuid, result: ConductorResult<()>) {
        let mut to_cancel = Vec::new();
        let (event, done) = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&command_id) else {
                return;
            };
            if record.command.status.is_terminal() {
                record.done.notify_waiters();
                return;
            }
            let event = match result {
                Ok(()) => match record.command.transition(CommandStatus::Completed) {
                    Ok(()) => {
                        record.command.progress = 100.0;
                        info!(
                            command_id = %command_id,
                            duration_ms = record.command.duration_ms(),
                            "Command completed"
                        );
                        OrchestratorEvent::CommandCompleted {
                            command_id,
                            duration_ms: record.command.duration_ms(),
                        }
                    }
                    Err(e) => self.fail_record(record, e.to_failure(), &mut to_cancel),
                },
                Err(e) => self.fail_record(record, e.to_failure(), &mut to_cancel),
            };
            self.events.emit(record.progress_event());
            (event, record.done.clone())
        };
        for task_id in to_cancel {
            self.controller.cancel_task(task_id).await;
        }
        self.events.emit(event);
        done.notify_waiters();
    }

    fn fail_record(&self, record: &mut CommandRecord, failure: Failure, to_cancel: &mut Vec<Uuid>) -> OrchestratorEvent {
        error!(command_id = %record.command.id, failure = %failure, "Command failed");
        if let Err(e) = record.command.fail(failure.clone()) {
            warn!(command_id = %record.command.id, error = %e, "Could not fail command");
        }
        to_cancel.extend(record.graph.fail_open("command failed"));
        OrchestratorEvent::CommandFailed {
            command_id: record.command.id,
            failure,
        }
    }

    /// Fail a running command with reason `cancelled`.
    ///
    /// Open tasks are failed, running ones are cancelled on their processes,
    /// and every agent that worked on the command gets a cancellation notice.
    pub async fn cancel_command(&self, command_id: Uuid) -> ConductorResult<Command> {
        let (in_progress, assigned, done) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            if record.command.status.is_terminal() {
                return Err(ConductorError::Validation(format!(
                    "command {command_id} already {}",
                    record.command.status
                )));
            }
            record.command.fail(Failure::cancelled())?;
            let in_progress = record.graph.fail_open("cancelled");
            record.cancel.notify_one();
            (in_progress, record.command.assigned_agents.clone(), record.done.clone())
        };
        info!(command_id = %command_id, tasks = in_progress.len(), "Cancelling command");

        // Remote owners are notified by their unit as part of the cancel.
        let mut notified = HashSet::new();
        let mut cancelled_tasks = Vec::new();
        for task_id in &in_progress {
            if let Some(owner) = self.controller.cancel_task(*task_id).await {
                if let Some(hub) = self.controller.hub() {
                    if hub.is_registered(&owner) {
                        notified.insert(owner);
                    }
                }
            }
            cancelled_tasks.push(*task_id);
        }
        if let Some(hub) = self.controller.hub() {
            for agent in assigned.iter().filter(|a| !notified.contains(*a)) {
                if !hub.is_registered(agent) {
                    continue;
                }
                let notice = Cancellation {
                    command_id,
                    task_ids: cancelled_tasks.clone(),
                    reason: "cancelled".to_string(),
                };
                let message = match serde_json::to_value(notice) {
                    Ok(payload) => Message::to_agent(MessageType::Cancellation, agent.clone(), payload),
                    Err(e) => {
                        warn!(error = %e, "Could not encode cancellation");
                        continue;
                    }
                };
                if let Err(e) = hub.send(agent, message).await {
                    warn!(command_id = %command_id, agent_id = %agent, error = %e, "Cancellation notice not delivered");
                }
            }
        }

        self.events.emit(OrchestratorEvent::CommandCancelled { command_id });
        done.notify_waiters();
        self.get_command(command_id)
            .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))
    }

    pub fn get_command(&self, command_id: Uuid) -> Option<Command> {
        self.records.read().get(&command_id).map(|r| r.command.clone())
    }

    /// All known commands, oldest first.
    pub fn list_commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.records.read().values().map(|r| r.command.clone()).collect();
        commands.sort_by_key(|c| c.created_at);
        commands
    }

    /// Generated tasks of a command in phase order.
    pub fn command_tasks(&self, command_id: Uuid) -> Option<Vec<Task>> {
        self.records
            .read()
            .get(&command_id)
            .map(|r| r.graph.tasks().into_iter().cloned().collect())
    }

    /// Wait until the command reaches a terminal state.
    pub async fn wait_for_command(&self, command_id: Uuid, timeout: Duration) -> ConductorResult<Command> {
        let deadline = Instant::now() + timeout;
        let done = self
            .records
            .read()
            .get(&command_id)
            .map(|r| r.done.clone())
            .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
        loop {
            let notified = done.notified();
            let command = self
                .get_command(command_id)
                .ok_or_else(|| ConductorError::NotFound(format!("command {command_id}")))?;
            if command.status.is_terminal() {
                return Ok(command);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConductorError::Timeout(format!(
                    "command {command_id} still {} after {}ms",
                    command.status,
                    timeout.as_millis()
                )));
            }
            // Bounded so a missed wake-up only costs one interval.
            let _ = tokio::time::timeout((deadline - now).min(Duration::from_millis(50)), notified).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::controller::{ControllerConfig, ScalingPolicy};
    use crate::strategy::{default_capabilities, ExecutionMode, PhaseSpec};
    use crate::types::CommandSpec;
    use crate::unit::InProcessFactory;
    use conductor_core::AgentTier;
    use conductor_pool::{handler_fn, TaskInput, WorkerPool, WorkerPoolConfig};

    /// Every tier runs in-process; results are derived from the phase name.
    fn system() -> Arc<CommandSystem> {
        system_with(CommandConfig::default())
    }

    fn system_with(commands: CommandConfig) -> Arc<CommandSystem> {
        let mut config = ControllerConfig::default();
        let mut builder_factories = Vec::new();
        for tier in AgentTier::ALL {
            *config.policies.get_mut(tier) = ScalingPolicy {
                min: 1,
                max: 2,
                ..ScalingPolicy::default()
            };
            let pool = WorkerPool::new(
                tier.to_string(),
                WorkerPoolConfig {
                    max_workers: 2,
                    poll_interval_ms: 5,
                    ..WorkerPoolConfig::default()
                },
            );
            pool.register_handler(
                "task",
                handler_fn(|input: TaskInput| async move {
                    let task: Task = serde_json::from_value(input.payload)?;
                    match task.task_type.as_str() {
                        "fix" => Err(ConductorError::Execution("patch does not apply".into())),
                        "testing" | "verify" | "unit_tests" => {
                            Ok(serde_json::json!({"tests_passed": 20, "tests_failed": 0, "coverage": 85.0}))
                        }
                        _ => Ok(serde_json::json!({"phase": task.task_type})),
                    }
                }),
            );
            builder_factories.push((
                tier,
                InProcessFactory::new(pool, "task", default_capabilities(tier), Duration::from_secs(5)),
            ));
        }
        let mut builder = ProcessController::builder(config, EventBus::default());
        for (tier, factory) in builder_factories {
            builder = builder.factory(tier, Arc::new(factory));
        }
        CommandSystem::new(commands, builder.start().unwrap())
    }

    #[tokio::test]
    async fn test_unknown_type_fails_fast() {
        let sys = system();
        let err = sys.execute_command(CommandSpec::new("DEPLOY", "Ship it")).unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
        assert!(sys.list_commands().is_empty());
    }

    #[tokio::test]
    async fn test_refactor_completes() {
        let sys = system();
        let id = sys
            .execute_command(CommandSpec::new("refactor", "Split parser module"))
            .unwrap();
        let cmd = sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed, "{:?}", cmd.failure);
        assert_eq!(cmd.command_type, "REFACTOR");
        assert_eq!(cmd.progress, 100.0);
        assert_eq!(cmd.gate_results.len(), 3);
        assert_eq!(sys.command_tasks(id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_execution_failure_fails_command() {
        let sys = system();
        let id = sys.execute_command(CommandSpec::new("FIX_BUG", "Crash on save")).unwrap();
        let cmd = sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert!(cmd.failure.unwrap().message.contains("patch does not apply"));

        let tasks = sys.command_tasks(id).unwrap();
        assert_eq!(tasks[0].status, conductor_core::TaskStatus::Completed);
        assert_eq!(
            tasks[2].status,
            conductor_core::TaskStatus::Failed {
                reason: "patch does not apply".into()
            }
        );
        assert!(matches!(tasks[3].status, conductor_core::TaskStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_assignment_error_fails_command() {
        let sys = system();
        sys.controller().shutdown(Duration::from_millis(10)).await;
        let id = sys.execute_command(CommandSpec::new("RUN_TESTS", "All")).unwrap();
        let cmd = sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert!(cmd.failure.unwrap().message.contains("shutting down"));

        let tasks = sys.command_tasks(id).unwrap();
        match &tasks[0].status {
            conductor_core::TaskStatus::Failed { reason } => assert!(reason.contains("shutting down")),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(matches!(tasks[1].status, conductor_core::TaskStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_skips_finished_command() {
        let sys = system();
        let strategy = StrategyRegistry::builtin().resolve("RUN_TESTS").unwrap().clone();
        let mut command = Command::from_spec(CommandSpec::new("RUN_TESTS", "All"));
        let command_id = command.id;
        let graph = TaskGraph::from_tasks(strategy.plan(command_id, "All", &serde_json::Value::Null, 0)).unwrap();
        command.fail(Failure::cancelled()).unwrap();
        sys.records.write().insert(
            command_id,
            CommandRecord {
                command,
                graph,
                cancel: Arc::new(Notify::new()),
                done: Arc::new(Notify::new()),
            },
        );

        let (tickets, error) = sys.dispatch_ready(command_id).await;
        assert!(tickets.is_empty());
        assert!(error.is_none());
        assert_eq!(sys.controller().in_flight(), 0);
        let tasks = sys.command_tasks(command_id).unwrap();
        assert!(tasks.iter().all(|t| t.status == conductor_core::TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_gate_failure_fails_command() {
        let sys = system();
        let id = sys
            .execute_command(CommandSpec::new("CODE_REVIEW", "PR 7"))
            .unwrap();
        let cmd = sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        let failure = cmd.failure.unwrap();
        assert_eq!(failure.kind, conductor_core::ErrorKind::QualityGate);
        assert!(failure.message.contains("review_approval"));
        assert!(!cmd.gate_results[0].passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_gate_overrides_builtin() {
        let gate = |program: &str| CommandGateConfig {
            name: "coverage".into(),
            program: program.into(),
            args: vec![],
            timeout_ms: 5_000,
        };

        let strict = system_with(CommandConfig {
            gates: vec![gate("false")],
            ..CommandConfig::default()
        });
        let id = strict.execute_command(CommandSpec::new("RUN_TESTS", "All")).unwrap();
        let cmd = strict.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        let failed = cmd.gate_results.last().unwrap();
        assert_eq!(failed.gate, "coverage");
        assert!(failed.detail.contains("check exited"));

        let lenient = system_with(CommandConfig {
            gates: vec![gate("true")],
            ..CommandConfig::default()
        });
        let id = lenient.execute_command(CommandSpec::new("RUN_TESTS", "All")).unwrap();
        let cmd = lenient.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed, "{:?}", cmd.failure);
    }

    #[test]
    fn test_gate_config_validation() {
        let config = CommandConfig {
            gates: vec![CommandGateConfig {
                name: "lint".into(),
                program: " ".into(),
                args: vec![],
                timeout_ms: 1_000,
            }],
            ..CommandConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(CommandConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_custom_strategy() {
        let sys = system();
        sys.register_strategy(CommandStrategy {
            command_type: "LINT_ONLY".into(),
            mode: ExecutionMode::Parallel,
            phases: vec![PhaseSpec::new("lint", AgentTier::Executor, 10, &["coding"])],
            gates: vec!["lint".into()],
        });
        let id = sys.execute_command(CommandSpec::new("lint_only", "Tidy")).unwrap();
        let cmd = sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_finished_command_is_rejected() {
        let sys = system();
        let id = sys.execute_command(CommandSpec::new("RUN_TESTS", "All")).unwrap();
        sys.wait_for_command(id, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            sys.cancel_command(id).await,
            Err(ConductorError::Validation(_))
        ));
        assert!(matches!(
            sys.cancel_command(Uuid::new_v4()).await,
            Err(ConductorError::NotFound(_))
        ));
    }
}
