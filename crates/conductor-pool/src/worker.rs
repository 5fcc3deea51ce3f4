use crate::config::WorkerPoolConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Bookkeeping for one execution slot of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub status: WorkerStatus,
    pub current_task: Option<Uuid>,
    pub tasks_assigned: u32,
    pub tasks_completed: u32,
    pub errors: u32,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl WorkerInfo {
    pub(crate) fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_assigned: 0,
            tasks_completed: 0,
            errors: 0,
            created_at: now,
            last_active: now,
        }
    }

    pub(crate) fn assign(&mut self, task_id: Uuid) {
        self.status = WorkerStatus::Busy;
        self.current_task = Some(task_id);
        self.tasks_assigned += 1;
        self.last_active = Utc::now();
    }

    /// Return to idle after an attempt; `succeeded` picks which counter moves.
    pub(crate) fn release(&mut self, succeeded: bool) {
        if succeeded {
            self.tasks_completed += 1;
        } else {
            self.errors += 1;
        }
        self.status = WorkerStatus::Idle;
        self.current_task = None;
        self.last_active = Utc::now();
    }

    /// Free the worker without counting the attempt (cancellation).
    pub(crate) fn abandon(&mut self) {
        self.status = WorkerStatus::Idle;
        self.current_task = None;
        self.last_active = Utc::now();
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// Whether the worker has reached its completion or error limit.
    pub fn should_recycle(&self, config: &WorkerPoolConfig) -> bool {
        self.tasks_completed >= config.max_tasks_per_worker || self.errors >= config.error_threshold
    }

    pub(crate) fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_active
    }
}
