use crate::types::UnitKind;
use async_trait::async_trait;
use conductor_core::{AgentTier, ConductorError, ConductorResult, ErrorKind, Failure, Task};
use conductor_hub::{
    Cancellation, CommunicationHub, Message, MessageType, TaskAssignment,
};
use conductor_pool::{PoolTaskStatus, SubmitOptions, WorkerPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Terminal result of one attempt, reported by a unit.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub process_id: String,
    pub task_id: Uuid,
    pub result: Result<serde_json::Value, Failure>,
    pub duration_ms: u64,
}

/// Where units report attempt outcomes.
pub type OutcomeSink = mpsc::UnboundedSender<UnitOutcome>;

/// What a unit knows about a task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitTaskStatus {
    Running,
    Unknown,
}

/// Something that can execute one task at a time on behalf of a tier pool.
///
/// `submit` returns once the work has been handed over; the outcome arrives
/// later on the sink. The task id doubles as the execution handle.
#[async_trait]
pub trait ExecutableUnit: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> UnitKind;

    fn capabilities(&self) -> Vec<String>;

    async fn submit(&self, task: Task, outcomes: OutcomeSink) -> ConductorResult<()>;

    async fn cancel(&self, task_id: Uuid) -> ConductorResult<()>;

    fn status(&self, task_id: Uuid) -> UnitTaskStatus;

    /// Current CPU usage in `[0, 1]`, if the unit can tell.
    fn cpu_usage(&self) -> Option<f64> {
        None
    }

    /// Called by the controller once an outcome for `task_id` has been accepted.
    fn release(&self, _task_id: Uuid) {}

    /// Stop the unit; in-flight work is abandoned.
    async fn terminate(&self) {}
}

/// Creates execution units for a tier pool when it scales up.
pub trait ProcessFactory: Send + Sync {
    fn kind(&self) -> UnitKind;

    /// Capabilities every unit from this factory offers.
    fn capabilities(&self) -> Vec<String>;

    fn spawn(&self, tier: AgentTier, process_id: &str) -> ConductorResult<Arc<dyn ExecutableUnit>>;

    /// Start background upkeep shared by this factory's units. Called once
    /// by the controller from within the runtime.
    fn start(&self) {}

    /// Stop that upkeep; called on controller shutdown.
    fn stop(&self) {}
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Runs tasks on a shared [`WorkerPool`]. The task is passed to the pool
/// handler as JSON.
pub struct InProcessUnit {
    id: String,
    pool: Arc<WorkerPool>,
    task_type: String,
    capabilities: Vec<String>,
    timeout: Duration,
    running: Arc<Mutex<HashMap<Uuid, Uuid>>>,
}

impl InProcessUnit {
    pub fn new(
        id: impl Into<String>,
        pool: Arc<WorkerPool>,
        task_type: impl Into<String>,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            pool,
            task_type: task_type.into(),
            capabilities,
            timeout,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ExecutableUnit for InProcessUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::InProcess
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn submit(&self, task: Task, outcomes: OutcomeSink) -> ConductorResult<()> {
        let task_id = task.id;
        let options = SubmitOptions::default()
            .priority(task.priority)
            .timeout(self.timeout)
            .retries(0);
        let pool_id = self
            .pool
            .submit(&self.task_type, serde_json::to_value(&task)?, options)?;
        self.running.lock().insert(task_id, pool_id);

        let pool = self.pool.clone();
        let running = self.running.clone();
        let process_id = self.id.clone();
        let poll = self.timeout.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let finished = loop {
                match pool.wait_for_task(pool_id, poll).await {
                    Ok(done) => break Some(done),
                    Err(ConductorError::Timeout(_))
                        if pool.get_task_status(pool_id) != PoolTaskStatus::NotFound =>
                    {
                        continue
                    }
                    Err(_) => break None,
                }
            };
            running.lock().remove(&task_id);
            pool.take_finished(pool_id);

            let (result, duration_ms) = match finished {
                Some(done) if done.status == PoolTaskStatus::Completed => (
                    Ok(done.result.clone().unwrap_or(serde_json::Value::Null)),
                    done.duration_ms(),
                ),
                Some(done) => (
                    Err(done
                        .failure
                        .clone()
                        .unwrap_or_else(|| Failure::new(ErrorKind::Execution, "task failed"))),
                    done.duration_ms(),
                ),
                None => (
                    Err(Failure::new(ErrorKind::Connection, "pool task disappeared")),
                    0,
                ),
            };
            let _ = outcomes.send(UnitOutcome {
                process_id,
                task_id,
                result,
                duration_ms,
            });
        });
        Ok(())
    }

    async fn cancel(&self, task_id: Uuid) -> ConductorResult<()> {
        let pool_id = self.running.lock().remove(&task_id);
        if let Some(pool_id) = pool_id {
            self.pool.cancel(pool_id);
        }
        Ok(())
    }

    fn status(&self, task_id: Uuid) -> UnitTaskStatus {
        if self.running.lock().contains_key(&task_id) {
            UnitTaskStatus::Running
        } else {
            UnitTaskStatus::Unknown
        }
    }

    /// Share of the backing worker pool's slots that are busy.
    fn cpu_usage(&self) -> Option<f64> {
        let stats = self.pool.stats();
        if stats.max_workers == 0 {
            return None;
        }
        Some(stats.busy as f64 / stats.max_workers as f64)
    }

    async fn terminate(&self) {
        let pool_ids: Vec<Uuid> = self.running.lock().drain().map(|(_, p)| p).collect();
        for pool_id in pool_ids {
            self.pool.cancel(pool_id);
        }
    }
}

/// Produces [`InProcessUnit`]s sharing one worker pool.
pub struct InProcessFactory {
    pool: Arc<WorkerPool>,
    task_type: String,
    capabilities: Vec<String>,
    timeout: Duration,
}

impl InProcessFactory {
    pub fn new(
        pool: Arc<WorkerPool>,
        task_type: impl Into<String>,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            task_type: task_type.into(),
            capabilities,
            timeout,
        }
    }
}

impl ProcessFactory for InProcessFactory {
    fn kind(&self) -> UnitKind {
        UnitKind::InProcess
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn spawn(&self, _tier: AgentTier, process_id: &str) -> ConductorResult<Arc<dyn ExecutableUnit>> {
        Ok(Arc::new(InProcessUnit::new(
            process_id,
            self.pool.clone(),
            self.task_type.clone(),
            self.capabilities.clone(),
            self.timeout,
        )))
    }

    /// Idle workers above the pool minimum are reaped while the controller runs.
    fn start(&self) {
        self.pool.start_maintenance();
    }

    fn stop(&self) {
        self.pool.stop_maintenance();
    }
}

// ---------------------------------------------------------------------------
// Subprocess
// ---------------------------------------------------------------------------

/// Runs each task as a child process: the task JSON is written to stdin and
/// stdout is read back as the result (JSON if it parses, text otherwise).
/// A non-zero exit status is an execution failure.
pub struct SubprocessUnit {
    id: String,
    program: String,
    args: Vec<String>,
    capabilities: Vec<String>,
    timeout: Duration,
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

enum ChildExit {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

impl SubprocessUnit {
    pub fn new(
        id: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args,
            capabilities,
            timeout,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ExecutableUnit for SubprocessUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Subprocess
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn submit(&self, task: Task, outcomes: OutcomeSink) -> ConductorResult<()> {
        let input = serde_json::to_vec(&task)?;
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("CONDUCTOR_PROCESS_ID", &self.id)
            .env("CONDUCTOR_TASK_ID", task.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConductorError::Connection(format!("failed to spawn '{}': {e}", self.program))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConductorError::Connection("child stdin not available".into()))?;
        let read_stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let read_stderr = tokio::spawn(read_pipe(child.stderr.take()));
        // Fed from its own task: a child echoing its input must not stall on a full pipe.
        let process_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(process_id = %process_id, error = %e, "Child closed stdin early");
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().insert(task.id, kill_tx);

        let running = self.running.clone();
        let process_id = self.id.clone();
        let timeout = self.timeout;
        let task_id = task.id;
        tokio::spawn(async move {
            let started = Instant::now();
            let exit = tokio::select! {
                status = child.wait() => ChildExit::Exited(status),
                _ = kill_rx => ChildExit::Cancelled,
                _ = tokio::time::sleep(timeout) => ChildExit::TimedOut,
            };
            if !matches!(exit, ChildExit::Exited(_)) {
                if let Err(e) = child.kill().await {
                    warn!(process_id = %process_id, error = %e, "Failed to kill child");
                }
            }
            running.lock().remove(&task_id);

            let out = read_stdout.await.unwrap_or_default();
            let err = read_stderr.await.unwrap_or_default();
            let result = match exit {
                ChildExit::Exited(Ok(status)) if status.success() => Ok(parse_output(&out)),
                ChildExit::Exited(Ok(status)) => Err(Failure::new(
                    ErrorKind::Execution,
                    format!(
                        "exited with {status}: {}",
                        String::from_utf8_lossy(&err).trim()
                    ),
                )),
                ChildExit::Exited(Err(e)) => Err(Failure::new(ErrorKind::Connection, e.to_string())),
                ChildExit::Cancelled => Err(Failure::cancelled()),
                ChildExit::TimedOut => Err(Failure::new(
                    ErrorKind::Timeout,
                    format!("child exceeded {}ms", timeout.as_millis()),
                )),
            };
            debug!(process_id = %process_id, task_id = %task_id, ok = result.is_ok(), "Child finished");
            let _ = outcomes.send(UnitOutcome {
                process_id,
                task_id,
                result,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        });
        Ok(())
    }

    async fn cancel(&self, task_id: Uuid) -> ConductorResult<()> {
        let kill = self.running.lock().remove(&task_id);
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        Ok(())
    }

    fn status(&self, task_id: Uuid) -> UnitTaskStatus {
        if self.running.lock().contains_key(&task_id) {
            UnitTaskStatus::Running
        } else {
            UnitTaskStatus::Unknown
        }
    }

    async fn terminate(&self) {
        let kills: Vec<oneshot::Sender<()>> = self.running.lock().drain().map(|(_, k)| k).collect();
        for kill in kills {
            let _ = kill.send(());
        }
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn parse_output(out: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(out);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

/// Produces [`SubprocessUnit`]s running the same program.
pub struct SubprocessFactory {
    program: String,
    args: Vec<String>,
    capabilities: Vec<String>,
    timeout: Duration,
}

impl SubprocessFactory {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        capabilities: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            capabilities,
            timeout,
        }
    }
}

impl ProcessFactory for SubprocessFactory {
    fn kind(&self) -> UnitKind {
        UnitKind::Subprocess
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn spawn(&self, _tier: AgentTier, process_id: &str) -> ConductorResult<Arc<dyn ExecutableUnit>> {
        Ok(Arc::new(SubprocessUnit::new(
            process_id,
            self.program.clone(),
            self.args.clone(),
            self.capabilities.clone(),
            self.timeout,
        )))
    }
}

// ---------------------------------------------------------------------------
// Remote agent
// ---------------------------------------------------------------------------

/// A remote agent reached through the [`CommunicationHub`].
///
/// `submit` waits for the agent to acknowledge the assignment; the completion
/// itself arrives later as a `task_completion` or `task_failure` message.
pub struct RemoteAgentUnit {
    agent_id: String,
    hub: Arc<CommunicationHub>,
    capabilities: Vec<String>,
    ack_timeout: Duration,
    assignments: Mutex<HashMap<Uuid, Option<Uuid>>>,
}

impl RemoteAgentUnit {
    pub fn new(
        agent_id: impl Into<String>,
        hub: Arc<CommunicationHub>,
        capabilities: Vec<String>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            hub,
            capabilities,
            ack_timeout,
            assignments: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ExecutableUnit for RemoteAgentUnit {
    fn id(&self) -> &str {
        &self.agent_id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Remote
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn submit(&self, task: Task, _outcomes: OutcomeSink) -> ConductorResult<()> {
        let task_id = task.id;
        let message = Message::to_agent(
            MessageType::TaskAssignment,
            self.agent_id.clone(),
            serde_json::to_value(TaskAssignment { task: task.clone() })?,
        )
        .with_priority(task.priority);

        self.assignments.lock().insert(task_id, task.command_id);
        self.hub.mark_busy(&self.agent_id, task_id);
        match self
            .hub
            .request_with_timeout(&self.agent_id, message, self.ack_timeout)
            .await
        {
            Ok(_ack) => Ok(()),
            Err(e) => {
                self.release(task_id);
                Err(e)
            }
        }
    }

    async fn cancel(&self, task_id: Uuid) -> ConductorResult<()> {
        let command_id = self.assignments.lock().remove(&task_id);
        self.hub.mark_idle(&self.agent_id, task_id);
        let notice = Cancellation {
            command_id: command_id.flatten().unwrap_or_else(Uuid::nil),
            task_ids: vec![task_id],
            reason: "cancelled".to_string(),
        };
        let message = Message::to_agent(
            MessageType::Cancellation,
            self.agent_id.clone(),
            serde_json::to_value(notice)?,
        );
        self.hub.send(&self.agent_id, message).await.map(|_| ())
    }

    fn status(&self, task_id: Uuid) -> UnitTaskStatus {
        let running = self
            .hub
            .endpoint(&self.agent_id)
            .is_some_and(|e| e.current_tasks.contains(&task_id));
        if running {
            UnitTaskStatus::Running
        } else {
            UnitTaskStatus::Unknown
        }
    }

    /// As last reported in the agent's heartbeat.
    fn cpu_usage(&self) -> Option<f64> {
        self.hub.endpoint(&self.agent_id).and_then(|e| e.cpu_usage)
    }

    fn release(&self, task_id: Uuid) {
        self.assignments.lock().remove(&task_id);
        self.hub.mark_idle(&self.agent_id, task_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::EventBus;
    use conductor_hub::{AgentRegistration, HubConfig};
    use conductor_pool::{handler_fn, TaskInput, WorkerPoolConfig};

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(b""), serde_json::Value::Null);
        assert_eq!(parse_output(b" {\"coverage\": 91} \n")["coverage"], 91);
        assert_eq!(parse_output(b"done\n"), serde_json::json!("done"));
    }

    #[tokio::test]
    async fn test_in_process_unit_reports_outcome() {
        let pool = WorkerPool::new("unit", WorkerPoolConfig::default());
        pool.register_handler(
            "task",
            handler_fn(|input: TaskInput| async move {
                let task: Task = serde_json::from_value(input.payload)?;
                Ok(serde_json::json!({ "title": task.title }))
            }),
        );
        let unit = InProcessUnit::new("executor-1", pool, "task", vec![], Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = Task::new("Write tests", "testing", AgentTier::Executor);
        let task_id = task.id;

        unit.submit(task, tx).await.unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.task_id, task_id);
        assert_eq!(outcome.process_id, "executor-1");
        assert_eq!(outcome.result.unwrap()["title"], "Write tests");
        assert_eq!(unit.status(task_id), UnitTaskStatus::Unknown);
    }

    #[tokio::test]
    async fn test_remote_unit_without_ack_times_out() {
        let hub = CommunicationHub::new(HubConfig::default(), EventBus::default());
        let mut conn = hub
            .connect(AgentRegistration::new("silent", AgentTier::Planner))
            .unwrap();
        let unit = RemoteAgentUnit::new("silent", hub.clone(), vec![], Duration::from_millis(20));
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = Task::new("Plan", "analysis", AgentTier::Planner);

        let err = unit.submit(task, tx).await.unwrap_err();
        assert!(err.is_retryable());
        let assignment = conn.recv().await.unwrap();
        assert_eq!(assignment.message_type, MessageType::TaskAssignment);
        assert!(hub.endpoint("silent").unwrap().current_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_remote_unit_cpu_follows_heartbeat() {
        let hub = CommunicationHub::new(HubConfig::default(), EventBus::default());
        let _conn = hub
            .connect(AgentRegistration::new("busy-box", AgentTier::Executor))
            .unwrap();
        let unit = RemoteAgentUnit::new("busy-box", hub.clone(), vec![], Duration::from_secs(1));
        assert_eq!(unit.cpu_usage(), None);

        let beat = Message::new(
            MessageType::Heartbeat,
            "busy-box",
            conductor_hub::Recipient::Agent(conductor_hub::HUB_ID.into()),
            serde_json::json!({ "cpu_usage": 0.4 }),
        );
        hub.handle_incoming("busy-box", beat);
        assert_eq!(unit.cpu_usage(), Some(0.4));
    }

    #[tokio::test]
    async fn test_in_process_unit_cpu_is_pool_occupancy() {
        let pool = WorkerPool::new(
            "occupancy",
            WorkerPoolConfig {
                min_workers: 1,
                max_workers: 2,
                ..WorkerPoolConfig::default()
            },
        );
        pool.register_handler(
            "task",
            handler_fn(|_input: TaskInput| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(serde_json::Value::Null)
            }),
        );
        let unit = InProcessUnit::new("executor-1", pool, "task", vec![], Duration::from_secs(30));
        assert_eq!(unit.cpu_usage(), Some(0.0));

        let (tx, _rx) = mpsc::unbounded_channel();
        unit.submit(Task::new("Hold", "testing", AgentTier::Executor), tx)
            .await
            .unwrap();
        assert_eq!(unit.cpu_usage(), Some(0.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_unit_echoes_task() {
        let unit = SubprocessUnit::new(
            "executor-sub",
            "cat",
            vec![],
            vec![],
            Duration::from_secs(5),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = Task::new("Echo", "testing", AgentTier::Executor);
        let task_id = task.id;
        unit.submit(task, tx).await.unwrap();

        let outcome = rx.recv().await.unwrap();
        let echoed = outcome.result.unwrap();
        assert_eq!(echoed["id"], task_id.to_string());
        assert_eq!(echoed["title"], "Echo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_unit_echoes_large_task() {
        let unit = SubprocessUnit::new(
            "executor-big",
            "cat",
            vec![],
            vec![],
            Duration::from_secs(10),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let title = "x".repeat(1 << 20);
        let task = Task::new(title.clone(), "testing", AgentTier::Executor);
        unit.submit(task, tx).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let echoed = outcome.result.unwrap();
        assert_eq!(echoed["title"].as_str().map(str::len), Some(title.len()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_unit_cancel_kills_child() {
        let unit = SubprocessUnit::new(
            "executor-sleep",
            "sleep",
            vec!["10".into()],
            vec![],
            Duration::from_secs(30),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = Task::new("Nap", "testing", AgentTier::Executor);
        let task_id = task.id;
        unit.submit(task, tx).await.unwrap();
        assert_eq!(unit.status(task_id), UnitTaskStatus::Running);

        unit.cancel(task_id).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.unwrap_err().is_cancellation());
    }
}
