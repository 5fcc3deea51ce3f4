use crate::distributor::{DistributorConfig, TaskDistributor};
use crate::types::{ProcessInfo, UnitKind};
use crate::unit::{ExecutableUnit, OutcomeSink, ProcessFactory, RemoteAgentUnit, UnitOutcome};
use chrono::Utc;
use conductor_core::{
    AgentTier, ConductorError, ConductorResult, ErrorKind, EventBus, Failure, OrchestratorEvent, Task,
    TaskStatus,
};
use conductor_hub::{CommunicationHub, InboundMessage, MessageType, TaskCompletion, TaskFailure, TaskUpdate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounds and thresholds for one tier pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    #[serde(default = "default_min")]
    pub min: usize,
    #[serde(default = "default_max")]
    pub max: usize,
    /// Utilisation (percent busy) at or above which one process is added.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    /// Utilisation at or below which the oldest idle process is removed.
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_scale_up_cooldown_ms")]
    pub scale_up_cooldown_ms: u64,
    #[serde(default = "default_scale_down_cooldown_ms")]
    pub scale_down_cooldown_ms: u64,
}

fn default_min() -> usize {
    1
}

fn default_max() -> usize {
    4
}

fn default_scale_up_threshold() -> f64 {
    75.0
}

fn default_scale_down_threshold() -> f64 {
    25.0
}

fn default_scale_up_cooldown_ms() -> u64 {
    30_000
}

fn default_scale_down_cooldown_ms() -> u64 {
    60_000
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_cooldown_ms: default_scale_up_cooldown_ms(),
            scale_down_cooldown_ms: default_scale_down_cooldown_ms(),
        }
    }
}

impl ScalingPolicy {
    pub fn validate(&self) -> ConductorResult<()> {
        if self.max == 0 {
            return Err(ConductorError::Config("pool max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(ConductorError::Config(format!(
                "pool min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            return Err(ConductorError::Config(
                "scale_down_threshold must not exceed scale_up_threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_up_cooldown_ms)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_down_cooldown_ms)
    }
}

/// One [`ScalingPolicy`] per tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierPolicies {
    #[serde(default)]
    pub planner: ScalingPolicy,
    #[serde(default)]
    pub coordinator: ScalingPolicy,
    #[serde(default)]
    pub executor: ScalingPolicy,
}

impl TierPolicies {
    pub fn get(&self, tier: AgentTier) -> &ScalingPolicy {
        match tier {
            AgentTier::Planner => &self.planner,
            AgentTier::Coordinator => &self.coordinator,
            AgentTier::Executor => &self.executor,
        }
    }

    pub fn get_mut(&mut self, tier: AgentTier) -> &mut ScalingPolicy {
        match tier {
            AgentTier::Planner => &mut self.planner,
            AgentTier::Coordinator => &mut self.coordinator,
            AgentTier::Executor => &mut self.executor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Autoscaler period.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Failed attempts after which a process is retired.
    #[serde(default = "default_process_error_threshold")]
    pub process_error_threshold: u64,
    /// How long a remote agent has to acknowledge an assignment.
    #[serde(default = "default_remote_ack_timeout_ms")]
    pub remote_ack_timeout_ms: u64,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub policies: TierPolicies,
}

fn default_tick_interval_ms() -> u64 {
    30_000
}

fn default_process_error_threshold() -> u64 {
    5
}

fn default_remote_ack_timeout_ms() -> u64 {
    10_000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            process_error_threshold: default_process_error_threshold(),
            remote_ack_timeout_ms: default_remote_ack_timeout_ms(),
            distributor: DistributorConfig::default(),
            policies: TierPolicies::default(),
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn remote_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_ack_timeout_ms)
    }
}

/// Where a task went when it was handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "placement", rename_all = "snake_case")]
pub enum Placement {
    Dispatched { process_id: String },
    /// Waiting for a process; `position` is 1-based.
    Queued { position: usize },
}

/// Terminal outcome of a task handed to the controller.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: Task,
    pub result: Result<serde_json::Value, Failure>,
}

/// Returned by [`ProcessController::assign_task_to_process`].
#[derive(Debug)]
pub struct TaskTicket {
    pub task_id: Uuid,
    pub placement: Placement,
    /// Resolves once, when the task completes or fails for good.
    pub outcome: oneshot::Receiver<TaskOutcome>,
}

/// Point-in-time view of one tier pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub tier: AgentTier,
    pub policy: ScalingPolicy,
    pub processes: Vec<ProcessInfo>,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    /// Busy over total, in percent.
    pub utilisation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub pools: Vec<PoolSnapshot>,
}

impl ControllerSnapshot {
    pub fn pool(&self, tier: AgentTier) -> Option<&PoolSnapshot> {
        self.pools.iter().find(|p| p.tier == tier)
    }
}

struct ManagedProcess {
    info: ProcessInfo,
    unit: Arc<dyn ExecutableUnit>,
}

struct TrackedTask {
    task: Task,
    required: Vec<String>,
    tx: Option<oneshot::Sender<TaskOutcome>>,
}

struct Dispatch {
    process_id: String,
    unit: Arc<dyn ExecutableUnit>,
    task: Task,
}

/// Work to do once a pool lock has been released.
#[derive(Default)]
struct Effects {
    dispatches: Vec<Dispatch>,
    retired: Vec<Arc<dyn ExecutableUnit>>,
    released: Option<(Arc<dyn ExecutableUnit>, Uuid)>,
    settled: Option<(oneshot::Sender<TaskOutcome>, TaskOutcome)>,
}

struct TierPool {
    tier: AgentTier,
    policy: ScalingPolicy,
    processes: BTreeMap<String, ManagedProcess>,
    queue: VecDeque<Uuid>,
    tasks: HashMap<Uuid, TrackedTask>,
    owners: HashMap<Uuid, String>,
    distributor: TaskDistributor,
    factory: Option<Arc<dyn ProcessFactory>>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    next_seq: u64,
}

impl TierPool {
    fn new(
        tier: AgentTier,
        policy: ScalingPolicy,
        distributor: DistributorConfig,
        factory: Option<Arc<dyn ProcessFactory>>,
    ) -> Self {
        Self {
            tier,
            policy,
            processes: BTreeMap::new(),
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            owners: HashMap::new(),
            distributor: TaskDistributor::new(distributor),
            factory,
            last_scale_up: None,
            last_scale_down: None,
            next_seq: 0,
        }
    }

    fn busy(&self) -> usize {
        self.processes.values().filter(|p| !p.info.is_idle()).count()
    }

    fn utilisation(&self) -> f64 {
        let total = self.processes.len();
        if total == 0 {
            return if self.queue.is_empty() { 0.0 } else { 100.0 };
        }
        self.busy() as f64 / total as f64 * 100.0
    }

    /// Higher priority first, FIFO within a priority.
    fn enqueue(&mut self, task_id: Uuid) -> usize {
        let priority = self.tasks.get(&task_id).map(|t| t.task.priority).unwrap_or_default();
        let position = self
            .queue
            .iter()
            .position(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.task.priority < priority)
            })
            .unwrap_or(self.queue.len());
        self.queue.insert(position, task_id);
        position + 1
    }

    fn try_dispatch(&mut self, task_id: Uuid) -> Option<Dispatch> {
        let required = self.tasks.get(&task_id)?.required.clone();
        self.refresh_cpu();
        let candidates: Vec<ProcessInfo> = self.processes.values().map(|p| p.info.clone()).collect();
        let process_id = self.distributor.select(&required, &candidates)?;
        let process = self.processes.get_mut(&process_id)?;
        let tracked = self.tasks.get_mut(&task_id)?;

        process.info.assign(task_id);
        self.owners.insert(task_id, process_id.clone());
        tracked.task.assigned_to = Some(process_id.clone());
        tracked.task.attempts += 1;
        Some(Dispatch {
            process_id,
            unit: process.unit.clone(),
            task: tracked.task.clone(),
        })
    }

    fn refresh_cpu(&mut self) {
        for process in self.processes.values_mut() {
            if let Some(cpu) = process.unit.cpu_usage() {
                process.info.cpu_usage = cpu.clamp(0.0, 1.0);
            }
        }
    }

    /// Hand queued tasks to idle processes, in queue order.
    fn drain(&mut self) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut i = 0;
        while i < self.queue.len() {
            if !self.processes.values().any(|p| p.info.is_idle()) {
                break;
            }
            let task_id = self.queue[i];
            match self.try_dispatch(task_id) {
                Some(dispatch) => {
                    self.queue.remove(i);
                    dispatches.push(dispatch);
                }
                None => i += 1,
            }
        }
        dispatches
    }

    /// Whether a new process from the factory could run a task needing `required`.
    fn can_grow_for(&self, required: &[String]) -> bool {
        self.processes.len() < self.policy.max
            && self.factory.as_ref().is_some_and(|f| {
                let offered = f.capabilities();
                required.iter().all(|r| offered.contains(r))
            })
    }

    fn spawn_process(&mut self, events: &EventBus) -> ConductorResult<String> {
        let factory = self.factory.clone().ok_or_else(|| {
            ConductorError::Capacity(format!("{} pool has no process factory", self.tier))
        })?;
        self.next_seq += 1;
        let process_id = format!("{}-{}", self.tier, self.next_seq);
        let unit = factory.spawn(self.tier, &process_id)?;
        let info = ProcessInfo::new(&process_id, self.tier, unit.kind(), unit.capabilities());
        self.processes.insert(process_id.clone(), ManagedProcess { info, unit });

        info!(tier = %self.tier, process_id = %process_id, "Process spawned");
        events.emit(OrchestratorEvent::ProcessSpawned {
            tier: self.tier,
            process_id: process_id.clone(),
        });
        Ok(process_id)
    }

    /// Spawn until the pool is back at its minimum.
    fn replenish(&mut self, events: &EventBus) {
        while self.processes.len() < self.policy.min && self.factory.is_some() {
            if let Err(e) = self.spawn_process(events) {
                warn!(tier = %self.tier, error = %e, "Failed to spawn process");
                break;
            }
        }
    }

    fn retire(&mut self, process_id: &str, reason: &str, events: &EventBus) -> Option<ManagedProcess> {
        let process = self.processes.remove(process_id)?;
        self.distributor.forget(process_id);
        info!(tier = %self.tier, process_id = %process_id, reason = %reason, "Process terminated");
        events.emit(OrchestratorEvent::ProcessTerminated {
            tier: self.tier,
            process_id: process_id.to_string(),
            reason: reason.to_string(),
        });
        Some(process)
    }

    fn oldest_idle_local(&self) -> Option<String> {
        self.processes
            .values()
            .filter(|p| p.info.is_idle() && p.info.kind != UnitKind::Remote)
            .min_by_key(|p| p.info.created_at)
            .map(|p| p.info.id.clone())
    }

    /// Record the end of an attempt. Retryable failures with budget left go
    /// back to the front of the queue; anything else is terminal.
    fn settle(
        &mut self,
        mut tracked: TrackedTask,
        result: Result<serde_json::Value, Failure>,
        process_id: Option<&str>,
        duration_ms: u64,
        events: &EventBus,
    ) -> Option<(oneshot::Sender<TaskOutcome>, TaskOutcome)> {
        let task_id = tracked.task.id;
        let result = match result {
            Ok(value) => {
                if let Err(e) = tracked.task.complete(value.clone()) {
                    warn!(task_id = %task_id, error = %e, "Unexpected completion");
                }
                info!(task_id = %task_id, duration_ms, "Task completed");
                events.emit(OrchestratorEvent::TaskCompleted {
                    task_id,
                    command_id: tracked.task.command_id,
                    process_id: process_id.map(String::from),
                    duration_ms,
                });
                Ok(value)
            }
            Err(failure)
                if failure.is_retryable() && !failure.is_cancellation() && tracked.task.retries > 0 =>
            {
                tracked.task.retries -= 1;
                warn!(
                    task_id = %task_id,
                    attempt = tracked.task.attempts,
                    retries_left = tracked.task.retries,
                    failure = %failure,
                    "Requeueing task"
                );
                events.emit(OrchestratorEvent::TaskRequeued {
                    task_id,
                    attempt: tracked.task.attempts,
                    retries_left: tracked.task.retries,
                });
                self.tasks.insert(task_id, tracked);
                self.queue.push_front(task_id);
                return None;
            }
            Err(failure) => {
                let _ = tracked.task.fail(failure.message.clone());
                error!(task_id = %task_id, failure = %failure, "Task failed");
                events.emit(OrchestratorEvent::TaskFailed {
                    task_id,
                    command_id: tracked.task.command_id,
                    process_id: process_id.map(String::from),
                    failure: failure.clone(),
                    attempts: tracked.task.attempts,
                });
                Err(failure)
            }
        };
        let tx = tracked.tx.take()?;
        Some((
            tx,
            TaskOutcome {
                task: tracked.task,
                result,
            },
        ))
    }

    fn snapshot(&self) -> PoolSnapshot {
        let busy = self.busy();
        PoolSnapshot {
            tier: self.tier,
            policy: self.policy.clone(),
            processes: self.processes.values().map(|p| p.info.clone()).collect(),
            busy,
            idle: self.processes.len() - busy,
            queued: self.queue.len(),
            utilisation: self.utilisation(),
        }
    }
}

fn cooled(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.map_or(true, |t| now.duration_since(t) >= cooldown)
}

fn tier_index(tier: AgentTier) -> usize {
    match tier {
        AgentTier::Planner => 0,
        AgentTier::Coordinator => 1,
        AgentTier::Executor => 2,
    }
}

/// Configures and starts a [`ProcessController`].
pub struct ControllerBuilder {
    config: ControllerConfig,
    events: EventBus,
    hub: Option<Arc<CommunicationHub>>,
    factories: HashMap<AgentTier, Arc<dyn ProcessFactory>>,
}

impl ControllerBuilder {
    /// Remote agents registered on this hub join the pool of their tier.
    pub fn hub(mut self, hub: Arc<CommunicationHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// How the pool of `tier` creates processes when it scales up.
    pub fn factory(mut self, tier: AgentTier, factory: Arc<dyn ProcessFactory>) -> Self {
        self.factories.insert(tier, factory);
        self
    }

    /// Spawn every pool up to its minimum and start the background loops.
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ConductorResult<Arc<ProcessController>> {
        for tier in AgentTier::ALL {
            self.config.policies.get(tier).validate()?;
        }
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let pools = AgentTier::ALL.map(|tier| {
            Mutex::new(TierPool::new(
                tier,
                self.config.policies.get(tier).clone(),
                self.config.distributor.clone(),
                self.factories.get(&tier).cloned(),
            ))
        });
        let controller = Arc::new(ProcessController {
            config: self.config,
            pools,
            hub: self.hub,
            events: self.events,
            outcomes: outcomes_tx,
            accepting: AtomicBool::new(true),
            background: Mutex::new(Vec::new()),
        });
        for pool in &controller.pools {
            pool.lock().replenish(&controller.events);
        }
        for factory in self.factories.values() {
            factory.start();
        }
        if let Some(hub) = &controller.hub {
            for endpoint in hub.endpoints() {
                if endpoint.status.is_reachable() {
                    if let Err(e) = controller.attach_remote_agent(&endpoint.id, endpoint.tier, endpoint.capabilities) {
                        warn!(agent_id = %endpoint.id, error = %e, "Could not attach agent");
                    }
                }
            }
        }
        controller.spawn_background(outcomes_rx);
        info!(tick_ms = controller.config.tick_interval_ms, "Process controller started");
        Ok(controller)
    }
}

/// One pool of execution units per agent tier.
///
/// Each pool's processes, queue, and task-owner map sit behind a single lock,
/// so a process flips to busy in the same critical section that records it as
/// the task's owner. Unit calls, event delivery, and outcome notification
/// happen after the lock is released.
pub struct ProcessController {
    config: ControllerConfig,
    pools: [Mutex<TierPool>; 3],
    hub: Option<Arc<CommunicationHub>>,
    events: EventBus,
    outcomes: OutcomeSink,
    accepting: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessController {
    pub fn builder(config: ControllerConfig, events: EventBus) -> ControllerBuilder {
        ControllerBuilder {
            config,
            events,
            hub: None,
            factories: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn hub(&self) -> Option<&Arc<CommunicationHub>> {
        self.hub.as_ref()
    }

    fn pool(&self, tier: AgentTier) -> &Mutex<TierPool> {
        &self.pools[tier_index(tier)]
    }

    /// Place `task` on the best idle process of its tier, or queue it.
    ///
    /// Dispatch never blocks on execution. When nothing qualifies the pool
    /// grows by one process if it is below max and its factory offers the
    /// required capabilities; otherwise the task waits in the queue.
    pub fn assign_task_to_process(
        &self,
        mut task: Task,
        required_capabilities: Vec<String>,
    ) -> ConductorResult<TaskTicket> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConductorError::Capacity("process controller is shutting down".into()));
        }
        if task.status == TaskStatus::Pending {
            task.start()?;
        } else if task.status != TaskStatus::InProgress {
            return Err(ConductorError::Validation(format!(
                "task {} is already finished",
                task.id
            )));
        }

        let task_id = task.id;
        let tier = task.tier;
        let (tx, rx) = oneshot::channel();
        let (placement, dispatch) = {
            let mut guard = self.pool(tier).lock();
            let pool = &mut *guard;
            if pool.tasks.contains_key(&task_id) {
                return Err(ConductorError::Validation(format!(
                    "task {task_id} is already assigned"
                )));
            }
            pool.tasks.insert(
                task_id,
                TrackedTask {
                    task,
                    required: required_capabilities.clone(),
                    tx: Some(tx),
                },
            );

            let mut dispatch = pool.try_dispatch(task_id);
            if dispatch.is_none() && pool.can_grow_for(&required_capabilities) {
                let from = pool.processes.len();
                match pool.spawn_process(&self.events) {
                    Ok(_) => {
                        pool.last_scale_up = Some(Instant::now());
                        self.events.emit(OrchestratorEvent::PoolScaled {
                            tier,
                            from,
                            to: from + 1,
                            reason: "demand".into(),
                        });
                        dispatch = pool.try_dispatch(task_id);
                    }
                    Err(e) => warn!(tier = %tier, error = %e, "Scale-up on demand failed"),
                }
            }
            match dispatch {
                Some(d) => (
                    Placement::Dispatched {
                        process_id: d.process_id.clone(),
                    },
                    Some(d),
                ),
                None => {
                    let position = pool.enqueue(task_id);
                    debug!(task_id = %task_id, tier = %tier, position, "Task queued");
                    self.events.emit(OrchestratorEvent::TaskQueued {
                        task_id,
                        tier,
                        queue_len: pool.queue.len(),
                    });
                    (Placement::Queued { position }, None)
                }
            }
        };
        if let Some(dispatch) = dispatch {
            self.launch(dispatch);
        }
        Ok(TaskTicket {
            task_id,
            placement,
            outcome: rx,
        })
    }

    fn launch(&self, dispatch: Dispatch) {
        let Dispatch { process_id, unit, task } = dispatch;
        let task_id = task.id;
        info!(task_id = %task_id, tier = %task.tier, process_id = %process_id, attempt = task.attempts, "Task dispatched");
        self.events.emit(OrchestratorEvent::TaskAssigned {
            task_id,
            command_id: task.command_id,
            tier: task.tier,
            process_id: process_id.clone(),
        });
        let sink = self.outcomes.clone();
        tokio::spawn(async move {
            if let Err(e) = unit.submit(task, sink.clone()).await {
                warn!(task_id = %task_id, process_id = %process_id, error = %e, "Submit failed");
                let _ = sink.send(UnitOutcome {
                    process_id,
                    task_id,
                    result: Err(e.to_failure()),
                    duration_ms: 0,
                });
            }
        });
    }

    fn apply(&self, effects: Effects) {
        let Effects {
            dispatches,
            retired,
            released,
            settled,
        } = effects;
        if let Some((unit, task_id)) = released {
            unit.release(task_id);
        }
        if let Some((tx, outcome)) = settled {
            let _ = tx.send(outcome);
        }
        if !retired.is_empty() {
            tokio::spawn(async move {
                for unit in retired {
                    unit.terminate().await;
                }
            });
        }
        for dispatch in dispatches {
            self.launch(dispatch);
        }
    }

    /// Apply an attempt outcome reported by a unit or a remote agent.
    ///
    /// Outcomes from a process that no longer owns the task (cancelled,
    /// requeued elsewhere, or already settled) are ignored.
    pub fn handle_outcome(&self, outcome: UnitOutcome) {
        let UnitOutcome {
            process_id,
            task_id,
            result,
            duration_ms,
        } = outcome;
        let threshold = self.config.process_error_threshold;

        for tier in AgentTier::ALL {
            let mut effects = Effects::default();
            {
                let mut guard = self.pool(tier).lock();
                let pool = &mut *guard;
                if pool.owners.get(&task_id) != Some(&process_id) {
                    continue;
                }
                pool.owners.remove(&task_id);

                let mut duration_ms = duration_ms;
                let mut exhausted = false;
                let mut surplus = false;
                let over_max = pool.processes.len() > pool.policy.max;
                if let Some(process) = pool.processes.get_mut(&process_id) {
                    if duration_ms == 0 {
                        duration_ms = (Utc::now() - process.info.last_active).num_milliseconds().max(0) as u64;
                    }
                    process.info.release(Some((result.is_ok(), duration_ms)));
                    exhausted = process.info.errors >= threshold;
                    surplus = over_max && process.info.kind != UnitKind::Remote;
                    effects.released = Some((process.unit.clone(), task_id));
                }
                if let Some(tracked) = pool.tasks.remove(&task_id) {
                    effects.settled =
                        pool.settle(tracked, result, Some(process_id.as_str()), duration_ms, &self.events);
                }
                if exhausted {
                    if let Some(process) = pool.retire(&process_id, "error threshold reached", &self.events) {
                        effects.retired.push(process.unit);
                    }
                    pool.replenish(&self.events);
                } else if surplus {
                    if let Some(process) = pool.retire(&process_id, "above policy maximum", &self.events) {
                        effects.retired.push(process.unit);
                    }
                }
                effects.dispatches = pool.drain();
            }
            self.apply(effects);
            return;
        }
        debug!(task_id = %task_id, process_id = %process_id, "Ignoring stale outcome");
    }

    /// Remove a crashed or departed process. Its task goes back to the front
    /// of the queue if the retry budget allows, and the pool is refilled to
    /// its minimum. Returns whether the process was known.
    pub fn handle_process_exit(&self, process_id: &str, reason: &str) -> bool {
        for tier in AgentTier::ALL {
            let mut effects = Effects::default();
            {
                let mut guard = self.pool(tier).lock();
                let pool = &mut *guard;
                let Some(process) = pool.retire(process_id, reason, &self.events) else {
                    continue;
                };
                if let Some(task_id) = process.info.current_task {
                    if pool.owners.remove(&task_id).is_some() {
                        if let Some(tracked) = pool.tasks.remove(&task_id) {
                            let failure = Failure::new(
                                ErrorKind::Connection,
                                format!("process {process_id} exited: {reason}"),
                            );
                            effects.settled = pool.settle(tracked, Err(failure), Some(process_id), 0, &self.events);
                        }
                    }
                }
                effects.retired.push(process.unit);
                pool.replenish(&self.events);
                effects.dispatches = pool.drain();
            }
            self.apply(effects);
            return true;
        }
        false
    }

    /// Add a hub-registered agent to the pool of its tier.
    pub fn attach_remote_agent(
        &self,
        agent_id: &str,
        tier: AgentTier,
        capabilities: Vec<String>,
    ) -> ConductorResult<()> {
        let hub = self
            .hub
            .clone()
            .ok_or_else(|| ConductorError::Config("no communication hub configured".into()))?;
        let mut effects = Effects::default();
        {
            let mut guard = self.pool(tier).lock();
            let pool = &mut *guard;
            if pool.processes.contains_key(agent_id) {
                return Ok(());
            }
            if pool.processes.len() >= pool.policy.max {
                return Err(ConductorError::Capacity(format!(
                    "{tier} pool is at its maximum of {}",
                    pool.policy.max
                )));
            }
            let unit = RemoteAgentUnit::new(
                agent_id,
                hub,
                capabilities.clone(),
                self.config.remote_ack_timeout(),
            );
            pool.processes.insert(
                agent_id.to_string(),
                ManagedProcess {
                    info: ProcessInfo::new(agent_id, tier, UnitKind::Remote, capabilities),
                    unit: Arc::new(unit),
                },
            );
            info!(tier = %tier, agent_id = %agent_id, "Remote agent attached");
            self.events.emit(OrchestratorEvent::ProcessSpawned {
                tier,
                process_id: agent_id.to_string(),
            });
            effects.dispatches = pool.drain();
        }
        self.apply(effects);
        Ok(())
    }

    pub fn detach_remote_agent(&self, agent_id: &str) -> bool {
        self.handle_process_exit(agent_id, "agent disconnected")
    }

    /// Stop tracking `task_id`. A queued task is removed; a running one is
    /// cancelled on its unit. The ticket resolves with a cancellation failure.
    /// Returns the process that was running it.
    pub async fn cancel_task(&self, task_id: Uuid) -> Option<String> {
        let mut effects = Effects::default();
        let mut owner = None;
        let mut owning_unit = None;
        for tier in AgentTier::ALL {
            let mut guard = self.pool(tier).lock();
            let pool = &mut *guard;
            let Some(mut tracked) = pool.tasks.remove(&task_id) else {
                continue;
            };
            pool.queue.retain(|id| *id != task_id);
            if let Some(process_id) = pool.owners.remove(&task_id) {
                if let Some(process) = pool.processes.get_mut(&process_id) {
                    process.info.release(None);
                    owning_unit = Some(process.unit.clone());
                }
                owner = Some(process_id);
            }
            let _ = tracked.task.fail("cancelled");
            if let Some(tx) = tracked.tx.take() {
                effects.settled = Some((
                    tx,
                    TaskOutcome {
                        task: tracked.task,
                        result: Err(Failure::cancelled()),
                    },
                ));
            }
            effects.dispatches = pool.drain();
            info!(task_id = %task_id, owner = ?owner, "Task cancelled");
            break;
        }
        if let Some(unit) = owning_unit {
            if let Err(e) = unit.cancel(task_id).await {
                warn!(task_id = %task_id, process_id = %unit.id(), error = %e, "Cancel on unit failed");
            }
        }
        self.apply(effects);
        owner
    }

    /// The process currently running `task_id`.
    pub fn owner_of(&self, task_id: Uuid) -> Option<String> {
        self.pools
            .iter()
            .find_map(|pool| pool.lock().owners.get(&task_id).cloned())
    }

    /// Number of tasks queued or running across all pools.
    pub fn in_flight(&self) -> usize {
        self.pools.iter().map(|pool| pool.lock().tasks.len()).sum()
    }

    /// One autoscaler pass over every pool.
    ///
    /// Publishes utilisation, then adds one process when utilisation is at or
    /// above the scale-up threshold, or removes the oldest idle local process
    /// when it is at or below the scale-down threshold. Each direction has its
    /// own cooldown. Remote agents are never scaled down.
    pub fn tick(&self) {
        let now = Instant::now();
        for tier in AgentTier::ALL {
            let mut effects = Effects::default();
            {
                let mut guard = self.pool(tier).lock();
                let pool = &mut *guard;
                let total = pool.processes.len();
                let busy = pool.busy();
                self.events.emit(OrchestratorEvent::PoolUtilization {
                    tier,
                    busy,
                    total,
                    queued: pool.queue.len(),
                });
                let load = pool.utilisation();
                let policy = pool.policy.clone();

                if total < policy.min {
                    pool.replenish(&self.events);
                } else if load >= policy.scale_up_threshold
                    && total < policy.max
                    && pool.factory.is_some()
                    && cooled(pool.last_scale_up, policy.scale_up_cooldown(), now)
                {
                    match pool.spawn_process(&self.events) {
                        Ok(_) => {
                            pool.last_scale_up = Some(now);
                            info!(tier = %tier, from = total, to = total + 1, load, "Scaled up");
                            self.events.emit(OrchestratorEvent::PoolScaled {
                                tier,
                                from: total,
                                to: total + 1,
                                reason: format!("utilisation {load:.0}%"),
                            });
                        }
                        Err(e) => warn!(tier = %tier, error = %e, "Scale-up failed"),
                    }
                } else if load <= policy.scale_down_threshold
                    && total > policy.min
                    && cooled(pool.last_scale_down, policy.scale_down_cooldown(), now)
                {
                    if let Some(process_id) = pool.oldest_idle_local() {
                        if let Some(process) = pool.retire(&process_id, "scale down", &self.events) {
                            effects.retired.push(process.unit);
                            pool.last_scale_down = Some(now);
                            info!(tier = %tier, from = total, to = total - 1, load, "Scaled down");
                            self.events.emit(OrchestratorEvent::PoolScaled {
                                tier,
                                from: total,
                                to: total - 1,
                                reason: format!("utilisation {load:.0}%"),
                            });
                        }
                    }
                }
                effects.dispatches = pool.drain();
            }
            self.apply(effects);
        }
    }

    /// Replace the scaling policy of one pool.
    ///
    /// The pool is refilled to a raised minimum and idle local processes
    /// above a lowered maximum are retired at once. Busy processes above the
    /// maximum are retired when their current task settles.
    pub fn update_policy(&self, tier: AgentTier, policy: ScalingPolicy) -> ConductorResult<()> {
        policy.validate()?;
        let mut effects = Effects::default();
        {
            let mut guard = self.pool(tier).lock();
            let pool = &mut *guard;
            if pool.policy == policy {
                return Ok(());
            }
            info!(tier = %tier, min = policy.min, max = policy.max, "Scaling policy updated");
            pool.policy = policy;

            let from = pool.processes.len();
            pool.replenish(&self.events);
            while pool.processes.len() > pool.policy.max {
                let Some(process_id) = pool.oldest_idle_local() else {
                    break;
                };
                if let Some(process) = pool.retire(&process_id, "policy update", &self.events) {
                    effects.retired.push(process.unit);
                }
            }
            let to = pool.processes.len();
            if to != from {
                self.events.emit(OrchestratorEvent::PoolScaled {
                    tier,
                    from,
                    to,
                    reason: "policy update".into(),
                });
            }
            effects.dispatches = pool.drain();
        }
        self.apply(effects);
        Ok(())
    }

    pub fn update_policies(&self, policies: &TierPolicies) -> ConductorResult<()> {
        for tier in AgentTier::ALL {
            policies.get(tier).validate()?;
        }
        for tier in AgentTier::ALL {
            self.update_policy(tier, policies.get(tier).clone())?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            pools: self.pools.iter().map(|pool| pool.lock().snapshot()).collect(),
        }
    }

    /// Stop intake, wait up to `timeout` for tracked work, then fail whatever
    /// is left and terminate every unit. Returns the number of abandoned tasks.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut abandoned = 0;
        let mut units: Vec<Arc<dyn ExecutableUnit>> = Vec::new();
        for tier in AgentTier::ALL {
            let mut settled = Vec::new();
            {
                let mut guard = self.pool(tier).lock();
                let pool = &mut *guard;
                pool.queue.clear();
                pool.owners.clear();
                for (_, mut tracked) in pool.tasks.drain() {
                    abandoned += 1;
                    let _ = tracked.task.fail("shutdown");
                    if let Some(tx) = tracked.tx.take() {
                        settled.push((
                            tx,
                            TaskOutcome {
                                task: tracked.task,
                                result: Err(Failure::new(ErrorKind::Capacity, "controller shut down")),
                            },
                        ));
                    }
                }
                let ids: Vec<String> = pool.processes.keys().cloned().collect();
                for id in ids {
                    if let Some(process) = pool.retire(&id, "shutdown", &self.events) {
                        units.push(process.unit);
                    }
                }
            }
            for (tx, outcome) in settled {
                let _ = tx.send(outcome);
            }
        }
        for unit in units {
            unit.terminate().await;
        }
        for pool in &self.pools {
            let factory = pool.lock().factory.clone();
            if let Some(factory) = factory {
                factory.stop();
            }
        }
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        if abandoned > 0 {
            warn!(abandoned, "Controller shut down with unfinished tasks");
        } else {
            info!("Controller shut down");
        }
        abandoned
    }

    fn route_inbound(&self, inbound: InboundMessage) {
        let InboundMessage { agent_id, message } = inbound;
        match message.message_type {
            MessageType::TaskCompletion => match message.payload_as::<TaskCompletion>() {
                Ok(done) => self.handle_outcome(UnitOutcome {
                    process_id: agent_id,
                    task_id: done.task_id,
                    result: Ok(done.result),
                    duration_ms: 0,
                }),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Bad completion"),
            },
            MessageType::TaskFailure => match message.payload_as::<TaskFailure>() {
                Ok(failed) => self.handle_outcome(UnitOutcome {
                    process_id: agent_id,
                    task_id: failed.task_id,
                    result: Err(Failure::new(ErrorKind::Execution, failed.error)),
                    duration_ms: 0,
                }),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Bad failure report"),
            },
            MessageType::TaskUpdate => match message.payload_as::<TaskUpdate>() {
                Ok(update) => {
                    self.events.emit(OrchestratorEvent::TaskProgress {
                        task_id: update.task_id,
                        agent_id,
                        progress: update.progress.unwrap_or(0.0),
                        message: update.message.or(Some(update.status)),
                    });
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Bad task update"),
            },
            _ => {}
        }
    }

    fn on_event(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::AgentRegistered { agent_id, tier } => {
                let Some(endpoint) = self.hub.as_ref().and_then(|h| h.endpoint(&agent_id)) else {
                    return;
                };
                // Re-registration replaces the connection; drop the stale unit first.
                self.handle_process_exit(&agent_id, "agent re-registered");
                if let Err(e) = self.attach_remote_agent(&agent_id, tier, endpoint.capabilities) {
                    warn!(agent_id = %agent_id, error = %e, "Could not attach agent");
                }
            }
            OrchestratorEvent::AgentDisconnected { agent_id } => {
                self.handle_process_exit(&agent_id, "agent disconnected");
            }
            OrchestratorEvent::AgentTimeout { agent_id } => {
                self.handle_process_exit(&agent_id, "agent timed out");
            }
            _ => {}
        }
    }

    fn spawn_background(self: &Arc<Self>, mut outcomes: mpsc::UnboundedReceiver<UnitOutcome>) {
        let mut handles = Vec::new();

        let weak: Weak<Self> = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            while let Some(outcome) = outcomes.recv().await {
                let Some(controller) = weak.upgrade() else { break };
                controller.handle_outcome(outcome);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.tick_interval().max(Duration::from_millis(10));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(controller) = weak.upgrade() else { break };
                controller.tick();
            }
        }));

        if let Some(hub) = &self.hub {
            let weak: Weak<Self> = Arc::downgrade(self);
            let mut inbound = hub.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    match inbound.recv().await {
                        Ok(message) => {
                            let Some(controller) = weak.upgrade() else { break };
                            controller.route_inbound(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Inbound router lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));

            let weak: Weak<Self> = Arc::downgrade(self);
            let mut events = self.events.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let Some(controller) = weak.upgrade() else { break };
                            controller.on_event(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Agent event watcher lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        self.background.lock().extend(handles);
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}
