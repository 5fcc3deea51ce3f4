#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::{AgentTier, ConductorResult, Task};
use conductor_gateway::{AppState, GatewayConfig, GatewayServer};
use conductor_hub::{CommunicationHub, HubConfig};
use conductor_orchestrator::{
    default_capabilities, CommandConfig, CommandSystem, ControllerConfig, InProcessFactory, ProcessController,
    ScalingPolicy,
};
use conductor_pool::{handler_fn, TaskInput, WorkerPool, WorkerPoolConfig};
use conductor_reporting::{ReportingConfig, ReportingSystem};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn in_process(tier: AgentTier) -> Arc<InProcessFactory> {
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
            let result: ConductorResult<serde_json::Value> = Ok(serde_json::json!({
                "phase": task.task_type,
                "tests_passed": 10,
                "tests_failed": 0,
                "coverage": 90.0
            }));
            result
        }),
    );
    Arc::new(InProcessFactory::new(
        pool,
        "task",
        default_capabilities(tier),
        Duration::from_secs(5),
    ))
}

/// Planner and executor tiers run in-process; coordinators must connect
/// over the agent socket.
async fn start_test_server() -> (String, Arc<AppState>) {
    let hub = CommunicationHub::new(HubConfig::default(), conductor_core::EventBus::default());
    let reporting = ReportingSystem::new(ReportingConfig {
        templates: vec![],
        ..ReportingConfig::default()
    })
    .unwrap();
    reporting.attach(hub.events());

    let mut config = ControllerConfig::default();
    for tier in AgentTier::ALL {
        *config.policies.get_mut(tier) = ScalingPolicy {
            min: 1,
            max: 2,
            ..ScalingPolicy::default()
        };
    }
    config.policies.coordinator.min = 0;
    let controller = ProcessController::builder(config, hub.events().clone())
        .hub(hub.clone())
        .factory(AgentTier::Planner, in_process(AgentTier::Planner))
        .factory(AgentTier::Executor, in_process(AgentTier::Executor))
        .start()
        .unwrap();
    let commands = CommandSystem::new(CommandConfig::default(), controller);
    let state = Arc::new(AppState {
        commands,
        hub,
        reporting,
    });

    let app = GatewayServer::build(state.clone(), &GatewayConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn wait_for_status(client: &reqwest::Client, addr: &str, id: &str, status: &str) -> serde_json::Value {
    for _ in 0..200 {
        let body: serde_json::Value = client
            .get(format!("http://{addr}/commands/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("command {id} never reached {status}");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = start_test_server().await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "conductor");
    assert_eq!(body["agents_online"], 0);
}

#[tokio::test]
async fn test_submit_command_runs_to_completion() {
    let (addr, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/commands"))
        .json(&serde_json::json!({
            "type": "RUN_TESTS",
            "title": "Nightly suite",
            "context": {"priority": "high"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: serde_json::Value = resp.json().await.unwrap();
    let id = accepted["command_id"].as_str().unwrap().to_string();

    let command = wait_for_status(&client, &addr, &id, "completed").await;
    assert_eq!(command["progress"], 100.0);
    assert_eq!(command["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(command["type"], "RUN_TESTS");

    let list: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/commands"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let dashboard: serde_json::Value = client
        .get(format!("http://{addr}/dashboard"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dashboard["session"]["commands_completed"], 1);

    let reports: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/reports?kind=command_progress&limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r["kind"] == "command_progress"));

    let metrics: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/metrics?limit=3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics.len(), 3);

    // The command is done; cancelling it is a client error.
    let resp = client
        .delete(format!("http://{addr}/commands/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_error_statuses() {
    let (addr, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/commands"))
        .json(&serde_json::json!({"type": "DEPLOY", "title": "Ship it"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation");
    assert!(body["message"].as_str().unwrap().contains("DEPLOY"));

    let missing = uuid::Uuid::new_v4();
    let resp = client
        .get(format!("http://{addr}/commands/{missing}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let resp = client
        .delete(format!("http://{addr}/commands/{missing}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_pools_and_strategies() {
    let (addr, _state) = start_test_server().await;
    let pools: serde_json::Value = reqwest::get(format!("http://{addr}/pools"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pools["pools"].as_array().unwrap().len(), 3);

    let strategies: Vec<serde_json::Value> = reqwest::get(format!("http://{addr}/strategies"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(strategies.len(), 6);
}

#[tokio::test]
async fn test_remote_reviewer_over_websocket() {
    let (addr, state) = start_test_server().await;
    let client = reqwest::Client::new();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agents"))
        .await
        .unwrap();
    let registration = serde_json::json!({
        "id": "reviewer-1",
        "name": "Reviewer",
        "tier": "coordinator",
        "capabilities": ["review", "security"]
    });
    ws.send(Message::Text(registration.to_string())).await.unwrap();
    let welcome: serde_json::Value =
        serde_json::from_str(&ws.next().await.unwrap().unwrap().into_text().unwrap()).unwrap();
    assert_eq!(welcome["type"], "registered");
    assert_eq!(welcome["agent_id"], "reviewer-1");

    let agents: Vec<serde_json::Value> = client
        .get(format!("http://{addr}/agents"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["tier"], "coordinator");

    let accepted: serde_json::Value = client
        .post(format!("http://{addr}/commands"))
        .json(&serde_json::json!({"type": "CODE_REVIEW", "title": "PR 7"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = accepted["command_id"].as_str().unwrap().to_string();

    // Acknowledge and approve every assignment; a single agent gets the
    // three review tasks one after another.
    let mut reviewed = 0;
    while reviewed < 3 {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let message: serde_json::Value = serde_json::from_str(&frame.into_text().unwrap()).unwrap();
        if message["type"] != "task_assignment" {
            continue;
        }
        let task_id = message["payload"]["task"]["id"].clone();
        let ack = serde_json::json!({
            "type": "task_update",
            "correlation_id": message["id"],
            "payload": {"task_id": task_id, "status": "accepted"}
        });
        ws.send(Message::Text(ack.to_string())).await.unwrap();
        let done = serde_json::json!({
            "type": "task_completion",
            "payload": {"task_id": task_id, "result": {"approved": true}}
        });
        ws.send(Message::Text(done.to_string())).await.unwrap();
        reviewed += 1;
    }

    let command = wait_for_status(&client, &addr, &id, "completed").await;
    assert_eq!(command["gate_results"][0]["gate"], "review_approval");
    assert_eq!(command["assigned_agents"], serde_json::json!(["reviewer-1"]));

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if state.hub.endpoints().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(state.hub.endpoints().is_empty());
}

#[tokio::test]
async fn test_invalid_registration_is_rejected() {
    let (addr, state) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agents"))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"name": "no id or tier"}"#.to_string()))
        .await
        .unwrap();
    let reply: serde_json::Value =
        serde_json::from_str(&ws.next().await.unwrap().unwrap().into_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "validation");
    assert!(state.hub.endpoints().is_empty());
}
