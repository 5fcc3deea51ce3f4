mod config;
mod config_watcher;
mod simulate;

use clap::{Parser, Subcommand};
use conductor_core::{AgentTier, EventBus, Priority};
use conductor_gateway::{AppState, GatewayServer};
use conductor_hub::CommunicationHub;
use conductor_orchestrator::{
    default_capabilities, CommandContext, CommandSpec, CommandStatus, CommandSystem, ControllerConfig,
    ExecutionMode, ProcessController, StrategyRegistry, SubprocessFactory,
};
use conductor_reporting::ReportingSystem;
use config::{ConductorConfig, ExecutorConfig};
use config_watcher::ConfigWatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "conductor.toml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const REPORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: hierarchical agent orchestration")]
struct Cli {
    /// Path to config file (default: ./conductor.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway with every subsystem behind it
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one command to completion and print the outcome
    Run {
        /// Command type, e.g. FIX_BUG
        command_type: String,
        #[arg(short, long)]
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// low, normal, high, or critical
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: Priority,
        /// Repeatable
        #[arg(long = "requirement")]
        requirements: Vec<String>,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// List command types with their phases and gates
    Strategies {
        #[arg(long)]
        json: bool,
    },
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|_| format!("unknown priority '{raw}'"))
}

/// Every running subsystem, wired to one event bus.
struct Engine {
    hub: Arc<CommunicationHub>,
    controller: Arc<ProcessController>,
    commands: Arc<CommandSystem>,
    reporting: Arc<ReportingSystem>,
}

impl Engine {
    fn start(config: &ConductorConfig) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let hub = CommunicationHub::new(config.hub.clone(), events.clone());
        let reporting = ReportingSystem::new(config.reporting.clone())?;
        // Attached before the controller so initial spawns are reported.
        reporting.attach(&events);

        let controller_config = ControllerConfig {
            policies: config.executors.adjust(config.controller.policies.clone()),
            ..config.controller.clone()
        };
        let mut builder = ProcessController::builder(controller_config, events).hub(hub.clone());
        for tier in AgentTier::ALL {
            match config.executors.get(tier) {
                ExecutorConfig::Simulate { delay_ms, fail_phases } => {
                    builder = builder.factory(
                        tier,
                        simulate::factory(tier, &config.pool, Duration::from_millis(*delay_ms), fail_phases.clone()),
                    );
                }
                ExecutorConfig::Subprocess {
                    program,
                    args,
                    timeout_ms,
                } => {
                    builder = builder.factory(
                        tier,
                        Arc::new(SubprocessFactory::new(
                            program.clone(),
                            args.clone(),
                            default_capabilities(tier),
                            Duration::from_millis(*timeout_ms),
                        )),
                    );
                }
                ExecutorConfig::Remote => info!(tier = %tier, "Tier served by remote agents"),
            }
        }
        let controller = builder.start()?;
        let commands = CommandSystem::new(config.commands.clone(), controller.clone());
        Ok(Self {
            hub,
            controller,
            commands,
            reporting,
        })
    }

    async fn stop(&self, grace: Duration) {
        let abandoned = self.controller.shutdown(grace).await;
        let notified = self.hub.shutdown_all("conductor stopping");
        info!(abandoned, notified, "Engine stopped");
    }
}

/// `--config` must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> anyhow::Result<(ConductorConfig, Option<PathBuf>)> {
    match path {
        Some(path) => Ok((ConductorConfig::load(path)?, Some(path.to_path_buf()))),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok((ConductorConfig::load(&default)?, Some(default)))
            } else {
                info!("No {DEFAULT_CONFIG} found, using defaults");
                Ok((ConductorConfig::default(), None))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let (config, config_path) = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, config_path, host, port).await,
        Commands::Run {
            command_type,
            title,
            description,
            priority,
            requirements,
            timeout_secs,
        } => {
            let spec = CommandSpec {
                command_type,
                title,
                description,
                context: CommandContext {
                    requirements,
                    priority,
                    ..CommandContext::default()
                },
            };
            run(config, spec, Duration::from_secs(timeout_secs)).await
        }
        Commands::Strategies { json } => strategies(json),
    }
}

async fn serve(
    mut config: ConductorConfig,
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    info!(addr = %config.server.addr(), "Starting Conductor");

    let engine = Engine::start(&config)?;
    let heartbeat = engine.hub.start_heartbeat();

    let _watcher = match config_path.filter(|_| config.reload.enabled) {
        Some(path) => {
            let controller = engine.controller.clone();
            let executors = config.executors.clone();
            match ConfigWatcher::start(path, config.reload.debounce_ms, move |reloaded| {
                let policies = executors.adjust(reloaded.controller.policies);
                match controller.update_policies(&policies) {
                    Ok(()) => info!("Scaling policies reloaded"),
                    Err(e) => warn!(error = %e, "Reloaded policies rejected"),
                }
            }) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "Config hot-reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let state = Arc::new(AppState {
        commands: engine.commands.clone(),
        hub: engine.hub.clone(),
        reporting: engine.reporting.clone(),
    });
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    let served = GatewayServer::serve(state, &config.server, shutdown).await;

    engine.stop(SHUTDOWN_GRACE).await;
    heartbeat.abort();
    served?;
    Ok(())
}

async fn run(config: ConductorConfig, spec: CommandSpec, timeout: Duration) -> anyhow::Result<()> {
    let engine = Engine::start(&config)?;
    let command_id = engine.commands.execute_command(spec)?;
    info!(command_id = %command_id, "Command submitted");

    let command = engine.commands.wait_for_command(command_id, timeout).await?;
    if let Err(e) = engine
        .reporting
        .wait_for_command_reports(command_id, REPORT_SETTLE_TIMEOUT)
        .await
    {
        warn!(command_id = %command_id, error = %e, "Reports for the command are incomplete");
    }

    let output = serde_json::json!({
        "command": command,
        "tasks": engine.commands.command_tasks(command_id).unwrap_or_default(),
        "dashboard": engine.reporting.get_dashboard_data(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    engine.stop(Duration::from_secs(5)).await;
    if command.status != CommandStatus::Completed {
        anyhow::bail!("command {command_id} ended {}", command.status);
    }
    Ok(())
}

fn strategies(json: bool) -> anyhow::Result<()> {
    let registry = StrategyRegistry::builtin();
    if json {
        let all: Vec<_> = registry.strategies().collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }
    for strategy in registry.strategies() {
        let mode = match strategy.mode {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        };
        println!(
            "{} ({mode}, ~{} min)",
            strategy.command_type,
            strategy.estimated_duration_ms() / 60_000
        );
        for (index, phase) in strategy.phases.iter().enumerate() {
            println!(
                "  {}. {} [{}] {}",
                index + 1,
                phase.name,
                phase.tier,
                phase.required_capabilities.join(", ")
            );
        }
        println!("  gates: {}", strategy.gates.join(", "));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "FIX_BUG",
            "--title",
            "Crash on start",
            "--priority",
            "HIGH",
            "--requirement",
            "no regressions",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                command_type,
                priority,
                requirements,
                timeout_secs,
                ..
            } => {
                assert_eq!(command_type, "FIX_BUG");
                assert_eq!(priority, Priority::High);
                assert_eq!(requirements, vec!["no regressions".to_string()]);
                assert_eq!(timeout_secs, 600);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_priority() {
        assert!(Cli::try_parse_from(["conductor", "run", "FIX_BUG", "-t", "x", "--priority", "urgent"]).is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/conductor.toml"))).is_err());
    }

    #[tokio::test]
    async fn test_engine_runs_command_with_simulated_tiers() {
        let mut config = ConductorConfig::parse(
            r#"
[pool]
poll_interval_ms = 5

[executors.planner]
kind = "simulate"
delay_ms = 1

[executors.coordinator]
kind = "simulate"
delay_ms = 1

[executors.executor]
kind = "simulate"
delay_ms = 1
"#,
        )
        .unwrap();
        config.reporting.templates.clear();
        let engine = Engine::start(&config).unwrap();

        let spec: CommandSpec = serde_json::from_value(serde_json::json!({
            "type": "IMPLEMENT_FEATURE",
            "title": "Dark mode",
        }))
        .unwrap();
        let id = engine.commands.execute_command(spec).unwrap();
        let command = engine
            .commands
            .wait_for_command(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Completed);
        assert_eq!(command.gate_results.len(), 3);
        assert!(command.gate_results.iter().all(|g| g.passed));

        engine.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_engine_reports_simulated_failure() {
        let config = ConductorConfig::parse(
            r#"
[pool]
poll_interval_ms = 5

[commands]
default_task_retries = 0

[executors.planner]
kind = "simulate"
delay_ms = 1

[executors.executor]
kind = "simulate"
delay_ms = 1
fail_phases = ["fix"]
"#,
        )
        .unwrap();
        let engine = Engine::start(&config).unwrap();

        let spec: CommandSpec = serde_json::from_value(serde_json::json!({
            "type": "FIX_BUG",
            "title": "Null deref",
        }))
        .unwrap();
        let id = engine.commands.execute_command(spec).unwrap();
        let command = engine
            .commands
            .wait_for_command(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(command.status, CommandStatus::Failed);

        engine
            .reporting
            .wait_for_command_reports(id, REPORT_SETTLE_TIMEOUT)
            .await
            .unwrap();
        let dashboard = engine.reporting.get_dashboard_data();
        assert_eq!(dashboard.session.commands_failed, 1);
        assert!(!dashboard.issues.is_empty());

        engine.stop(Duration::from_secs(1)).await;
    }
}
