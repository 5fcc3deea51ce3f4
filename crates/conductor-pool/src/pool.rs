use crate::config::WorkerPoolConfig;
use crate::task::{PoolTask, PoolTaskStatus, SubmitOptions, TaskHandler, TaskInput};
use crate::worker::WorkerInfo;
use chrono::Utc;
use conductor_core::{
    ConductorError, ConductorResult, ErrorKind, EventBus, Failure, OrchestratorEvent, Priority,
};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Point-in-time counters of a [`WorkerPool`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub recycled: u64,
    pub min_workers: usize,
    pub max_workers: usize,
}

#[derive(Default)]
struct PoolState {
    tasks: HashMap<Uuid, PoolTask>,
    queue: VecDeque<Uuid>,
    workers: BTreeMap<String, WorkerInfo>,
    running: HashMap<Uuid, AbortHandle>,
    next_worker: u64,
    submitted: u64,
    completed: u64,
    failed: u64,
    requeued: u64,
    recycled: u64,
}

impl PoolState {
    /// Insert behind every task of equal or higher priority.
    fn enqueue(&mut self, task_id: Uuid, priority: Priority) {
        let tasks = &self.tasks;
        let position = self
            .queue
            .iter()
            .position(|id| tasks.get(id).is_some_and(|t| t.priority < priority))
            .unwrap_or(self.queue.len());
        self.queue.insert(position, task_id);
    }

    fn spawn_worker(&mut self, pool: &str) -> String {
        self.next_worker += 1;
        let id = format!("{pool}-worker-{}", self.next_worker);
        self.workers.insert(id.clone(), WorkerInfo::new(id.clone()));
        id
    }

    fn idle_worker(&self) -> Option<String> {
        self.workers
            .values()
            .find(|w| w.is_idle())
            .map(|w| w.id.clone())
    }
}

/// Elastic pool of in-process workers.
///
/// Tasks wait in a priority queue; each dispatched attempt runs on its own
/// tokio task under a timeout. Failed attempts are requeued at the front
/// while the task's retry budget lasts. Workers are bookkeeping slots that
/// bound concurrency to `max_workers` and are recycled after too many
/// completions or errors.
pub struct WorkerPool {
    name: String,
    config: WorkerPoolConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    state: Mutex<PoolState>,
    finished: Notify,
    accepting: AtomicBool,
    events: Option<EventBus>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Arc<Self> {
        Self::build(name.into(), config, None)
    }

    /// A pool that also publishes task lifecycle events on `events`.
    pub fn with_events(
        name: impl Into<String>,
        config: WorkerPoolConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Self::build(name.into(), config, Some(events))
    }

    fn build(name: String, config: WorkerPoolConfig, events: Option<EventBus>) -> Arc<Self> {
        let config = config.normalized();
        let mut state = PoolState::default();
        for _ in 0..config.min_workers {
            state.spawn_worker(&name);
        }
        info!(pool = %name, min = config.min_workers, max = config.max_workers, "Worker pool created");
        Arc::new(Self {
            name,
            config,
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(state),
            finished: Notify::new(),
            accepting: AtomicBool::new(true),
            events,
            maintenance: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn register_handler(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_type = task_type.into();
        debug!(pool = %self.name, task_type = %task_type, "Handler registered");
        self.handlers.write().insert(task_type, Arc::new(handler));
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Queue a task and return its id without waiting for it to run.
    pub fn submit(
        self: &Arc<Self>,
        task_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> ConductorResult<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConductorError::Capacity(format!(
                "pool '{}' is shutting down",
                self.name
            )));
        }
        if !self.has_handler(task_type) {
            return Err(ConductorError::Validation(format!(
                "no handler registered for task type '{task_type}'"
            )));
        }

        let task = PoolTask::new(
            task_type.to_string(),
            payload,
            options.priority,
            options.timeout.unwrap_or_else(|| self.config.task_timeout()),
            options.retries.unwrap_or(self.config.default_retries),
        );
        let task_id = task.id;
        let priority = task.priority;
        {
            let mut state = self.state.lock();
            state.tasks.insert(task_id, task);
            state.enqueue(task_id, priority);
            state.submitted += 1;
        }
        debug!(pool = %self.name, task_id = %task_id, task_type, "Task queued");
        self.dispatch();
        Ok(task_id)
    }

    pub fn get_task_status(&self, task_id: Uuid) -> PoolTaskStatus {
        self.state
            .lock()
            .tasks
            .get(&task_id)
            .map_or(PoolTaskStatus::NotFound, |t| t.status)
    }

    pub fn get_task(&self, task_id: Uuid) -> Option<PoolTask> {
        self.state.lock().tasks.get(&task_id).cloned()
    }

    /// Drop a finished task from the pool's records and return it.
    pub fn take_finished(&self, task_id: Uuid) -> Option<PoolTask> {
        let mut state = self.state.lock();
        match state.tasks.get(&task_id) {
            Some(task) if task.status.is_terminal() => state.tasks.remove(&task_id),
            _ => None,
        }
    }

    /// Cancel a queued or running task. Returns false if it already finished
    /// or is unknown. Cancelled tasks are never retried.
    pub fn cancel(self: &Arc<Self>, task_id: Uuid) -> bool {
        let failed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return false;
            };
            match task.status {
                PoolTaskStatus::Queued => state.queue.retain(|id| *id != task_id),
                PoolTaskStatus::Running => {
                    if let Some(handle) = state.running.remove(&task_id) {
                        handle.abort();
                    }
                    if let Some(worker) = task
                        .worker_id
                        .as_ref()
                        .and_then(|id| state.workers.get_mut(id))
                    {
                        if worker.current_task == Some(task_id) {
                            worker.abandon();
                        }
                    }
                }
                _ => return false,
            }
            task.record_failure(Failure::cancelled());
            state.failed += 1;
            task.clone()
        };
        info!(pool = %self.name, task_id = %task_id, "Task cancelled");
        self.emit(failed_event(&failed));
        self.finished.notify_waiters();
        self.dispatch();
        true
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_for_task(&self, task_id: Uuid, timeout: Duration) -> ConductorResult<PoolTask> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            match self.get_task(task_id) {
                None => return Err(ConductorError::NotFound(format!("task {task_id}"))),
                Some(task) if task.status.is_terminal() => return Ok(task),
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConductorError::Timeout(format!(
                    "task {task_id} did not finish within {}ms",
                    timeout.as_millis()
                )));
            }
            let wait = self.config.poll_interval().min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Wait until every task in `task_ids` reaches a terminal state.
    pub async fn wait_for_batch(
        &self,
        task_ids: &[Uuid],
        timeout: Duration,
    ) -> ConductorResult<Vec<PoolTask>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            let snapshot: Vec<Option<PoolTask>> = {
                let state = self.state.lock();
                task_ids.iter().map(|id| state.tasks.get(id).cloned()).collect()
            };
            let mut done = Vec::with_capacity(task_ids.len());
            for (id, task) in task_ids.iter().zip(snapshot) {
                match task {
                    None => return Err(ConductorError::NotFound(format!("task {id}"))),
                    Some(task) if task.status.is_terminal() => done.push(task),
                    Some(_) => {}
                }
            }
            if done.len() == task_ids.len() {
                return Ok(done);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConductorError::Timeout(format!(
                    "{} of {} tasks still pending after {}ms",
                    task_ids.len() - done.len(),
                    task_ids.len(),
                    timeout.as_millis()
                )));
            }
            let wait = self.config.poll_interval().min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.workers.values().filter(|w| w.is_idle()).count();
        PoolStats {
            name: self.name.clone(),
            workers: state.workers.len(),
            idle,
            busy: state.workers.len() - idle,
            queued: state.queue.len(),
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
            requeued: state.requeued,
            recycled: state.recycled,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.state.lock().workers.values().cloned().collect()
    }

    /// Terminate workers above the minimum that have idled past the idle
    /// timeout. Returns how many were removed.
    pub fn reap_idle(&self) -> usize {
        let now = Utc::now();
        let limit = chrono::Duration::milliseconds(self.config.idle_timeout_ms as i64);
        let mut state = self.state.lock();
        let excess = state.workers.len().saturating_sub(self.config.min_workers);
        let victims: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.is_idle() && w.idle_for(now) > limit)
            .map(|w| w.id.clone())
            .take(excess)
            .collect();
        for id in &victims {
            state.workers.remove(id);
            debug!(pool = %self.name, worker_id = %id, "Idle worker terminated");
        }
        victims.len()
    }

    /// Spawn the periodic idle-reaping loop unless it is already running.
    /// It stops on [`stop_maintenance`](Self::stop_maintenance), on shutdown,
    /// or once the pool is dropped.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let pool = Arc::downgrade(self);
        let period = self.config.maintenance_interval();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let reaped = pool.reap_idle();
                if reaped > 0 {
                    info!(pool = %pool.name, reaped, "Reaped idle workers");
                }
            }
        }));
        debug!(pool = %self.name, period_ms = period.as_millis() as u64, "Maintenance loop started");
    }

    pub fn stop_maintenance(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop intake, let running attempts finish for up to `timeout`, then
    /// abandon everything left. Returns the number of abandoned tasks.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        self.stop_maintenance();
        info!(pool = %self.name, "Worker pool shutting down");

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            if self.state.lock().running.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.config.poll_interval().min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }

        let abandoned: Vec<PoolTask> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for (_, handle) in state.running.drain() {
                handle.abort();
            }
            let mut abandoned = Vec::new();
            for task in state.tasks.values_mut().filter(|t| !t.status.is_terminal()) {
                task.record_failure(Failure::new(ErrorKind::Execution, "pool shut down"));
                abandoned.push(task.clone());
            }
            state.failed += abandoned.len() as u64;
            state.queue.clear();
            state.workers.clear();
            abandoned
        };
        if !abandoned.is_empty() {
            warn!(pool = %self.name, abandoned = abandoned.len(), "Abandoned unfinished tasks");
        }
        for task in &abandoned {
            self.emit(failed_event(task));
        }
        self.finished.notify_waiters();
        abandoned.len()
    }

    /// Hand queued tasks to idle workers, growing the pool up to its maximum.
    fn dispatch(self: &Arc<Self>) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        let mut failed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            while !state.queue.is_empty() {
                let worker_id = match state.idle_worker() {
                    Some(id) => id,
                    None if state.workers.len() < self.config.max_workers => {
                        let id = state.spawn_worker(&self.name);
                        debug!(pool = %self.name, worker_id = %id, "Worker spawned");
                        id
                    }
                    None => break,
                };
                let Some(task_id) = state.queue.pop_front() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.status != PoolTaskStatus::Queued {
                    continue;
                }
                let Some(handler) = self.handlers.read().get(&task.task_type).cloned() else {
                    task.record_failure(Failure::new(
                        ErrorKind::Validation,
                        format!("no handler registered for task type '{}'", task.task_type),
                    ));
                    state.failed += 1;
                    failed.push(task.clone());
                    continue;
                };

                task.status = PoolTaskStatus::Running;
                task.attempts += 1;
                task.started_at = Some(Utc::now());
                task.worker_id = Some(worker_id.clone());
                let input = task.input();
                let timeout = Duration::from_millis(task.timeout_ms);
                if let Some(worker) = state.workers.get_mut(&worker_id) {
                    worker.assign(task_id);
                }
                let handle = self.spawn_attempt(worker_id, handler, input, timeout);
                state.running.insert(task_id, handle);
            }
        }
        for task in &failed {
            self.emit(failed_event(task));
        }
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        worker_id: String,
        handler: Arc<dyn TaskHandler>,
        input: TaskInput,
        timeout: Duration,
    ) -> AbortHandle {
        let pool = Arc::clone(self);
        let task_id = input.task_id;
        let handle = tokio::spawn(async move {
            let attempt = AssertUnwindSafe(handler.handle(input)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err(e.to_failure()),
                Ok(Err(_)) => Err(Failure::new(ErrorKind::Execution, "task handler panicked")),
                Err(_) => Err(Failure::new(
                    ErrorKind::Timeout,
                    format!("attempt exceeded {}ms", timeout.as_millis()),
                )),
            };
            pool.finish(task_id, &worker_id, outcome);
        });
        handle.abort_handle()
    }

    fn finish(
        self: &Arc<Self>,
        task_id: Uuid,
        worker_id: &str,
        outcome: Result<serde_json::Value, Failure>,
    ) {
        let mut event = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.running.remove(&task_id);

            let mut recycle = false;
            if let Some(worker) = state.workers.get_mut(worker_id) {
                if worker.current_task == Some(task_id) {
                    worker.release(outcome.is_ok());
                    recycle = worker.should_recycle(&self.config);
                }
            }
            if recycle {
                state.workers.remove(worker_id);
                state.recycled += 1;
                info!(pool = %self.name, worker_id, "Worker recycled");
                if state.workers.len() < self.config.min_workers {
                    state.spawn_worker(&self.name);
                }
            }

            if let Some(task) = state.tasks.get_mut(&task_id) {
                // A cancelled task already has its terminal record.
                if task.status == PoolTaskStatus::Running {
                    match outcome {
                        Ok(value) => {
                            task.status = PoolTaskStatus::Completed;
                            task.result = Some(value);
                            task.completed_at = Some(Utc::now());
                            state.completed += 1;
                            debug!(pool = %self.name, task_id = %task_id, "Task completed");
                            event = Some(OrchestratorEvent::TaskCompleted {
                                task_id,
                                command_id: None,
                                process_id: Some(worker_id.to_string()),
                                duration_ms: task.duration_ms(),
                            });
                        }
                        Err(failure) if task.retries_left > 0 => {
                            task.retries_left -= 1;
                            task.status = PoolTaskStatus::Queued;
                            task.worker_id = None;
                            state.queue.push_front(task_id);
                            state.requeued += 1;
                            warn!(
                                pool = %self.name,
                                task_id = %task_id,
                                attempt = task.attempts,
                                retries_left = task.retries_left,
                                %failure,
                                "Task attempt failed, requeued"
                            );
                            event = Some(OrchestratorEvent::TaskRequeued {
                                task_id,
                                attempt: task.attempts,
                                retries_left: task.retries_left,
                            });
                        }
                        Err(failure) => {
                            error!(
                                pool = %self.name,
                                task_id = %task_id,
                                attempts = task.attempts,
                                %failure,
                                "Task failed"
                            );
                            task.record_failure(failure);
                            state.failed += 1;
                            event = Some(failed_event(task));
                        }
                    }
                }
            }
        }
        if let Some(event) = event {
            self.emit(event);
        }
        self.finished.notify_waiters();
        self.dispatch();
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

fn failed_event(task: &PoolTask) -> OrchestratorEvent {
    OrchestratorEvent::TaskFailed {
        task_id: task.id,
        command_id: None,
        process_id: task.worker_id.clone(),
        failure: task
            .failure
            .clone()
            .unwrap_or_else(|| Failure::new(ErrorKind::Execution, "unknown failure")),
        attempts: task.attempts,
    }
}
