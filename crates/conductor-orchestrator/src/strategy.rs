use conductor_core::{AgentTier, ConductorError, ConductorResult, Task};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One phase of a command strategy; becomes one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub tier: AgentTier,
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl PhaseSpec {
    pub fn new(name: &str, tier: AgentTier, estimated_secs: u64, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tier,
            estimated_duration_ms: estimated_secs * 1000,
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Each phase depends on the previous one.
    Sequential,
    /// Phases are independent.
    Parallel,
}

/// How a command type is decomposed and which gates it must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStrategy {
    pub command_type: String,
    pub mode: ExecutionMode,
    pub phases: Vec<PhaseSpec>,
    pub gates: Vec<String>,
}

impl CommandStrategy {
    pub fn estimated_duration_ms(&self) -> u64 {
        match self.mode {
            ExecutionMode::Sequential => self.phases.iter().map(|p| p.estimated_duration_ms).sum(),
            ExecutionMode::Parallel => self
                .phases
                .iter()
                .map(|p| p.estimated_duration_ms)
                .max()
                .unwrap_or(0),
        }
    }

    /// Build the task graph of one command run.
    ///
    /// Every task carries the command id, the command priority, and the
    /// phase's capabilities. Sequential strategies chain each task to the one
    /// before it.
    pub fn plan(&self, command_id: Uuid, title: &str, context: &serde_json::Value, retries: u32) -> Vec<Task> {
        let priority = context
            .get("priority")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();
        let mut tasks: Vec<Task> = Vec::with_capacity(self.phases.len());
        for (index, phase) in self.phases.iter().enumerate() {
            let mut task = Task::new(format!("{title}: {}", phase.name), phase.name.clone(), phase.tier)
                .for_command(command_id)
                .with_priority(priority)
                .with_capabilities(phase.required_capabilities.clone())
                .with_retries(retries)
                .with_payload(serde_json::json!({
                    "command_type": self.command_type,
                    "phase": phase.name,
                    "phase_index": index,
                    "estimated_duration_ms": phase.estimated_duration_ms,
                    "context": context,
                }));
            if self.mode == ExecutionMode::Sequential {
                if let Some(previous) = tasks.last() {
                    task = task.with_dependencies(vec![previous.id]);
                }
            }
            tasks.push(task);
        }
        tasks
    }
}

/// Capabilities a process of each tier offers by default.
pub fn default_capabilities(tier: AgentTier) -> Vec<String> {
    let caps: &[&str] = match tier {
        AgentTier::Planner => &["analysis", "design", "diagnosis"],
        AgentTier::Coordinator => &["review", "security"],
        AgentTier::Executor => &["coding", "testing", "debugging", "profiling", "benchmarking"],
    };
    caps.iter().map(|c| c.to_string()).collect()
}

/// Command types and their strategies. Lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, CommandStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six built-in command types.
    pub fn builtin() -> Self {
        use AgentTier::{Coordinator, Executor, Planner};
        use ExecutionMode::{Parallel, Sequential};

        let mut registry = Self::new();
        let mut add = |command_type: &str, mode, phases: Vec<PhaseSpec>, gates: &[&str]| {
            registry.register(CommandStrategy {
                command_type: command_type.to_string(),
                mode,
                phases,
                gates: gates.iter().map(|g| g.to_string()).collect(),
            });
        };

        add(
            "IMPLEMENT_FEATURE",
            Sequential,
            vec![
                PhaseSpec::new("analysis", Planner, 300, &["analysis"]),
                PhaseSpec::new("design", Planner, 600, &["design"]),
                PhaseSpec::new("implementation", Executor, 1800, &["coding"]),
                PhaseSpec::new("testing", Executor, 900, &["testing"]),
                PhaseSpec::new("review", Coordinator, 300, &["review"]),
            ],
            &["tests_pass", "coverage", "lint"],
        );
        add(
            "FIX_BUG",
            Sequential,
            vec![
                PhaseSpec::new("reproduce", Executor, 300, &["debugging"]),
                PhaseSpec::new("diagnose", Planner, 600, &["diagnosis"]),
                PhaseSpec::new("fix", Executor, 900, &["coding"]),
                PhaseSpec::new("verify", Executor, 300, &["testing"]),
            ],
            &["tests_pass", "lint"],
        );
        add(
            "REFACTOR",
            Sequential,
            vec![
                PhaseSpec::new("analysis", Planner, 600, &["analysis"]),
                PhaseSpec::new("refactor", Executor, 1800, &["coding"]),
                PhaseSpec::new("verify", Executor, 600, &["testing"]),
            ],
            &["tests_pass", "lint", "coverage"],
        );
        add(
            "OPTIMIZE_PERFORMANCE",
            Sequential,
            vec![
                PhaseSpec::new("profile", Executor, 600, &["profiling"]),
                PhaseSpec::new("optimize", Executor, 1800, &["coding"]),
                PhaseSpec::new("benchmark", Executor, 600, &["benchmarking"]),
            ],
            &["benchmark", "tests_pass"],
        );
        add(
            "CODE_REVIEW",
            Parallel,
            vec![
                PhaseSpec::new("security_review", Coordinator, 600, &["review", "security"]),
                PhaseSpec::new("style_review", Coordinator, 300, &["review"]),
                PhaseSpec::new("logic_review", Coordinator, 600, &["review"]),
            ],
            &["review_approval"],
        );
        add(
            "RUN_TESTS",
            Parallel,
            vec![
                PhaseSpec::new("unit_tests", Executor, 300, &["testing"]),
                PhaseSpec::new("integration_tests", Executor, 900, &["testing"]),
            ],
            &["tests_pass", "coverage"],
        );
        registry
    }

    /// Add or replace a strategy.
    pub fn register(&mut self, mut strategy: CommandStrategy) {
        strategy.command_type = strategy.command_type.to_uppercase();
        self.strategies.insert(strategy.command_type.clone(), strategy);
    }

    pub fn get(&self, command_type: &str) -> Option<&CommandStrategy> {
        self.strategies.get(&command_type.to_uppercase())
    }

    /// Strategy for `command_type`, or a validation error naming the known types.
    pub fn resolve(&self, command_type: &str) -> ConductorResult<&CommandStrategy> {
        self.get(command_type).ok_or_else(|| {
            ConductorError::Validation(format!(
                "unknown command type '{command_type}' (known: {})",
                self.types().join(", ")
            ))
        })
    }

    pub fn types(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    pub fn strategies(&self) -> impl Iterator<Item = &CommandStrategy> {
        self.strategies.values()
    }
}
