//! `conductor.toml`: one section per subsystem plus the executor choice of
//! each tier. Every section is optional.

use conductor_core::{AgentTier, ConductorError, ConductorResult};
use conductor_gateway::GatewayConfig;
use conductor_hub::HubConfig;
use conductor_orchestrator::{CommandConfig, ControllerConfig, TierPolicies};
use conductor_pool::WorkerPoolConfig;
use conductor_reporting::ReportingConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub server: GatewayConfig,
    #[serde(default)]
    pub hub: HubConfig,
    /// Worker pool behind every in-process tier.
    #[serde(default)]
    pub pool: WorkerPoolConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub executors: ExecutorsConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
}

/// How the processes of one tier run their tasks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// In-process workers producing simulated results.
    Simulate {
        /// Time each task takes.
        #[serde(default = "default_simulate_delay_ms")]
        delay_ms: u64,
        /// Phases that always fail, e.g. `["fix"]`.
        #[serde(default)]
        fail_phases: Vec<String>,
    },
    /// One child process per task; the task JSON goes to stdin and the
    /// result JSON comes from stdout.
    Subprocess {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_subprocess_timeout_ms")]
        timeout_ms: u64,
    },
    /// No local processes; the tier is served by agents connecting to
    /// `/ws/agents`.
    Remote,
}

fn default_simulate_delay_ms() -> u64 {
    200
}

fn default_subprocess_timeout_ms() -> u64 {
    300_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::Simulate {
            delay_ms: default_simulate_delay_ms(),
            fail_phases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default)]
    pub planner: ExecutorConfig,
    #[serde(default)]
    pub coordinator: ExecutorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl ExecutorsConfig {
    pub fn get(&self, tier: AgentTier) -> &ExecutorConfig {
        match tier {
            AgentTier::Planner => &self.planner,
            AgentTier::Coordinator => &self.coordinator,
            AgentTier::Executor => &self.executor,
        }
    }

    /// Remote tiers have nothing to spawn, so their pools start empty.
    pub fn adjust(&self, mut policies: TierPolicies) -> TierPolicies {
        for tier in AgentTier::ALL {
            if self.get(tier) == &ExecutorConfig::Remote {
                policies.get_mut(tier).min = 0;
            }
        }
        policies
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReloadConfig {
    /// Re-apply scaling policies when the config file changes.
    #[serde(default = "default_reload_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reload_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_reload_enabled() -> bool {
    true
}

fn default_reload_debounce_ms() -> u64 {
    500
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_reload_enabled(),
            debounce_ms: default_reload_debounce_ms(),
        }
    }
}

impl ConductorConfig {
    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        let config = Self::parse(&content)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config '{}': {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        for tier in AgentTier::ALL {
            self.controller.policies.get(tier).validate()?;
            if let ExecutorConfig::Subprocess { program, .. } = self.executors.get(tier) {
                if program.trim().is_empty() {
                    return Err(ConductorError::Config(format!(
                        "executor for tier {tier} has an empty program"
                    )));
                }
            }
        }
        self.commands.validate()?;
        self.reporting.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConductorConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.controller.policies.executor.max, 4);
        assert_eq!(config.executors.planner, ExecutorConfig::default());
        assert!(config.reload.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_full_config() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[server]
port = 9090

[hub]
heartbeat_interval_ms = 5000

[controller.policies.executor]
min = 2
max = 8

[executors.planner]
kind = "subprocess"
program = "./agents/planner.sh"
args = ["--json"]

[executors.coordinator]
kind = "remote"

[executors.executor]
kind = "simulate"
delay_ms = 10
fail_phases = ["fix"]
"#
        )
        .unwrap();

        let config = ConductorConfig::load(tmp.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.hub.heartbeat_interval_ms, 5000);
        assert_eq!(config.controller.policies.executor.min, 2);
        assert_eq!(config.controller.policies.executor.max, 8);
        assert_eq!(config.controller.policies.planner.max, 4);
        assert_eq!(
            config.executors.planner,
            ExecutorConfig::Subprocess {
                program: "./agents/planner.sh".into(),
                args: vec!["--json".into()],
                timeout_ms: 300_000,
            }
        );
        assert_eq!(config.executors.get(AgentTier::Coordinator), &ExecutorConfig::Remote);
        assert_eq!(
            config.executors.executor,
            ExecutorConfig::Simulate {
                delay_ms: 10,
                fail_phases: vec!["fix".into()],
            }
        );
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = ConductorConfig::parse(include_str!("../../../conductor.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.reporting.templates.len(), 3);
        assert_eq!(config.executors.coordinator, ExecutorConfig::Remote);
    }

    #[test]
    fn test_remote_tiers_start_empty() {
        let config = ConductorConfig::parse(
            r#"
[controller.policies.coordinator]
min = 2
max = 6

[executors.coordinator]
kind = "remote"
"#,
        )
        .unwrap();
        let policies = config.executors.adjust(config.controller.policies.clone());
        assert_eq!(policies.coordinator.min, 0);
        assert_eq!(policies.coordinator.max, 6);
        assert_eq!(policies.executor.min, 1);
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[controller.policies.planner]
min = 5
max = 2
"#
        )
        .unwrap();
        assert!(ConductorConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn test_empty_program_is_rejected() {
        let config = ConductorConfig::parse(
            r#"
[executors.executor]
kind = "subprocess"
program = " "
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("empty program"));
    }

    #[test]
    fn test_external_gates() {
        let config = ConductorConfig::parse(
            r#"
[[commands.gates]]
name = "lint"
program = "cargo"
args = ["clippy", "--", "-D", "warnings"]
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.commands.gates.len(), 1);
        assert_eq!(config.commands.gates[0].args.len(), 4);
        assert_eq!(config.commands.gates[0].timeout_ms, 120_000);

        let bad = ConductorConfig::parse(
            r#"
[[commands.gates]]
name = "lint"
program = ""
"#,
        )
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unreadable_file_names_path() {
        let err = ConductorConfig::load(Path::new("/nonexistent/conductor.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
