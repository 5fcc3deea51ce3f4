use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorResult, Failure, Priority};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// What a handler receives for one attempt of a pool task.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Executes pool tasks of one registered type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, input: TaskInput) -> ConductorResult<serde_json::Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = ConductorResult<serde_json::Value>> + Send + 'static,
{
    async fn handle(&self, input: TaskInput) -> ConductorResult<serde_json::Value> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = ConductorResult<serde_json::Value>> + Send + 'static,
{
    FnHandler(f)
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl SubmitOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Externally visible status of a pool task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    NotFound,
}

impl PoolTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PoolTaskStatus::Completed | PoolTaskStatus::Failed)
    }
}

/// A task tracked by the pool from submission to its terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTask {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub timeout_ms: u64,
    pub retries_left: u32,
    pub attempts: u32,
    pub status: PoolTaskStatus,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PoolTask {
    pub(crate) fn new(
        task_type: String,
        payload: serde_json::Value,
        priority: Priority,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            priority,
            timeout_ms: timeout.as_millis() as u64,
            retries_left: retries,
            attempts: 0,
            status: PoolTaskStatus::Queued,
            worker_id: None,
            result: None,
            failure: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn input(&self) -> TaskInput {
        TaskInput {
            task_id: self.id,
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            attempt: self.attempts,
        }
    }

    pub(crate) fn record_failure(&mut self, failure: Failure) {
        self.status = PoolTaskStatus::Failed;
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock duration of the final attempt, if it finished.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}
