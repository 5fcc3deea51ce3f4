use serde::Deserialize;
use std::time::Duration;

/// Bounds and limits of a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-attempt timeout used when a submission does not set its own.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Retry budget used when a submission does not set its own.
    #[serde(default)]
    pub default_retries: u32,
    /// Completed tasks after which a worker is recycled.
    #[serde(default = "default_max_tasks_per_worker")]
    pub max_tasks_per_worker: u32,
    /// Failed attempts after which a worker is recycled.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Idle time after which a worker above the minimum is terminated.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Upper bound between status polls in `wait_for_task`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Period of the idle-reaping maintenance loop.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_max_tasks_per_worker() -> u32 {
    100
}

fn default_error_threshold() -> u32 {
    5
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_maintenance_interval_ms() -> u64 {
    5_000
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            task_timeout_ms: default_task_timeout_ms(),
            default_retries: 0,
            max_tasks_per_worker: default_max_tasks_per_worker(),
            error_threshold: default_error_threshold(),
            idle_timeout_ms: default_idle_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

impl WorkerPoolConfig {
    /// Clamp the bounds so that `1 <= max` and `min <= max`.
    pub fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.min_workers = self.min_workers.min(self.max_workers);
        self
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_bounds() {
        let config = WorkerPoolConfig {
            min_workers: 8,
            max_workers: 3,
            ..WorkerPoolConfig::default()
        }
        .normalized();
        assert_eq!(config.min_workers, 3);
        assert_eq!(config.max_workers, 3);

        let config = WorkerPoolConfig {
            min_workers: 0,
            max_workers: 0,
            ..WorkerPoolConfig::default()
        }
        .normalized();
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.min_workers, 0);
    }
}
