#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::{AgentTier, ConductorError, EventBus, Task};
use conductor_orchestrator::{
    default_capabilities, CommandConfig, CommandSpec, CommandStatus, CommandSystem, ControllerConfig,
    InProcessFactory, ProcessController, ScalingPolicy,
};
use conductor_pool::{handler_fn, TaskInput, WorkerPool, WorkerPoolConfig};
use conductor_reporting::{
    IssueCategory, ReportKind, ReportLevel, ReportQuery, ReportTemplate, ReportingConfig, ReportingSystem,
};
use std::sync::Arc;
use std::time::Duration;

/// Controller whose tiers all run in-process. The `fix` phase always fails.
fn commands(events: EventBus) -> Arc<CommandSystem> {
    let mut config = ControllerConfig::default();
    let mut builder_factories = Vec::new();
    for tier in AgentTier::ALL {
        *config.policies.get_mut(tier) = ScalingPolicy {
            min: 1,
            max: 2,
            ..ScalingPolicy::default()
        };
        let pool = WorkerPool::new(
            tier.to_string(),
            WorkerPoolConfig {
                max_workers: 2,
                poll_interval_ms: 5,
                ..WorkerPoolConfig::default()
            },
        );
        pool.register_handler(
            "task",
            handler_fn(|input: TaskInput| async move {
                let task: Task = serde_json::from_value(input.payload)?;
                match task.task_type.as_str() {
                    "fix" => Err(ConductorError::Execution("patch does not apply".into())),
                    "verify" => Ok(serde_json::json!({"tests_passed": 12, "tests_failed": 0, "coverage": 91.0})),
                    _ => Ok(serde_json::json!({"phase": task.task_type})),
                }
            }),
        );
        builder_factories.push((
            tier,
            InProcessFactory::new(pool, "task", default_capabilities(tier), Duration::from_secs(5)),
        ));
    }
    let mut builder = ProcessController::builder(config, events);
    for (tier, factory) in builder_factories {
        builder = builder.factory(tier, Arc::new(factory));
    }
    CommandSystem::new(CommandConfig::default(), builder.start().unwrap())
}

#[tokio::test]
async fn test_reporting_follows_command_lifecycle() {
    let events = EventBus::default();
    let reporting = ReportingSystem::new(ReportingConfig {
        templates: vec![
            ReportTemplate::realtime("commands", &["memory"])
                .with_kinds(vec![ReportKind::CommandProgress])
                .with_level(ReportLevel::Command),
            ReportTemplate::realtime("errors", &["stream"]).with_kinds(vec![ReportKind::Error]),
        ],
        ..ReportingConfig::default()
    })
    .unwrap();
    reporting.attach(&events);
    let mut stream = reporting.subscribe_stream();

    let system = commands(events);
    let refactor = system
        .execute_command(CommandSpec::new("REFACTOR", "Split parser"))
        .unwrap();
    let fix = system
        .execute_command(CommandSpec::new("FIX_BUG", "Crash on empty input"))
        .unwrap();
    let done = system.wait_for_command(refactor, Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.status, CommandStatus::Completed, "{:?}", done.failure);
    let failed = system.wait_for_command(fix, Duration::from_secs(5)).await.unwrap();
    assert_eq!(failed.status, CommandStatus::Failed);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dashboard = reporting.get_dashboard_data();
    assert_eq!(dashboard.session.commands_completed, 1);
    assert_eq!(dashboard.session.commands_failed, 1);
    assert_eq!(dashboard.session.commands_active, 0);
    assert!(dashboard.session.tasks_completed >= 4);
    assert!(dashboard.session.tasks_failed >= 1);

    let completed = dashboard.commands.iter().find(|c| c.command_id == refactor).unwrap();
    assert_eq!(completed.progress, 100.0);
    assert_eq!(completed.command_type.as_deref(), Some("REFACTOR"));

    for tier in AgentTier::ALL {
        assert!(
            dashboard.agents.iter().any(|a| a.tier == Some(tier)),
            "no {tier} process on the dashboard"
        );
    }
    assert!(dashboard
        .issues
        .iter()
        .any(|i| i.category == IssueCategory::Execution && i.description.contains("patch does not apply")));

    let command_reports = reporting.get_report_history(&ReportQuery {
        source: Some(fix.to_string()),
        ..ReportQuery::default()
    });
    assert!(command_reports.iter().any(|r| r.kind == ReportKind::Error));
    assert!(command_reports.iter().all(|r| r.level == ReportLevel::Command));

    let deliveries = reporting.memory_channel().deliveries();
    assert!(!deliveries.is_empty());
    assert!(deliveries.iter().all(|d| d.template == "commands"));

    let error_delivery = tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error_delivery.template, "errors");

    let samples = reporting.get_metrics_history(usize::MAX);
    assert!(samples.len() > 10);
    assert!(samples.windows(2).all(|w| w[1].reports_ingested > w[0].reports_ingested));
}
