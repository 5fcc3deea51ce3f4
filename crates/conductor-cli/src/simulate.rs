//! Simulated work for in-process tiers.
//!
//! Each phase answers with the metrics its command's gates read, so every
//! built-in command type can run end to end without an agent program.

use conductor_core::{AgentTier, ConductorError, ConductorResult, Task};
use conductor_orchestrator::{default_capabilities, InProcessFactory};
use conductor_pool::{handler_fn, TaskInput, WorkerPool, WorkerPoolConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TASK_TYPE: &str = "task";

/// A tier factory whose worker pool runs [`simulate`].
pub fn factory(
    tier: AgentTier,
    pool: &WorkerPoolConfig,
    delay: Duration,
    fail_phases: Vec<String>,
) -> Arc<InProcessFactory> {
    let workers = WorkerPool::new(format!("{tier}-sim"), pool.clone());
    let fail_phases = Arc::new(fail_phases);
    workers.register_handler(
        TASK_TYPE,
        handler_fn(move |input: TaskInput| {
            let fail_phases = fail_phases.clone();
            async move {
                let task: Task = serde_json::from_value(input.payload)?;
                tokio::time::sleep(delay).await;
                simulate(&task, &fail_phases)
            }
        }),
    );
    Arc::new(InProcessFactory::new(
        workers,
        TASK_TYPE,
        default_capabilities(tier),
        pool.task_timeout(),
    ))
}

/// The result a phase reports.
pub fn simulate(task: &Task, fail_phases: &[String]) -> ConductorResult<serde_json::Value> {
    let phase = task.task_type.as_str();
    if fail_phases.iter().any(|p| p == phase) {
        return Err(ConductorError::Execution(format!("simulated failure in phase '{phase}'")));
    }
    debug!(task_id = %task.id, phase, "Simulated phase");
    let result = match phase {
        "testing" | "verify" | "unit_tests" | "integration_tests" => serde_json::json!({
            "phase": phase,
            "tests_passed": 48,
            "tests_failed": 0,
            "coverage": 86.5,
            "lint_errors": 0,
        }),
        "benchmark" => serde_json::json!({
            "phase": phase,
            "tests_passed": 12,
            "tests_failed": 0,
            "benchmark_delta": 14.0,
        }),
        review if review == "review" || review.ends_with("_review") => serde_json::json!({
            "phase": phase,
            "approved": true,
            "comments": 0,
        }),
        other => serde_json::json!({
            "phase": other,
            "summary": format!("{other} finished for '{}'", task.title),
        }),
    };
    Ok(result)
}
