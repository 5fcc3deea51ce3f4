#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::{AgentTier, ConductorError, EventBus};
use conductor_hub::{
    AgentConnection, AgentRegistration, CommunicationHub, HubConfig, Message, MessageType,
};
use std::sync::Arc;
use std::time::Duration;

fn hub_with_timeout(request_timeout_ms: u64) -> Arc<CommunicationHub> {
    let config = HubConfig {
        request_timeout_ms,
        ..HubConfig::default()
    };
    CommunicationHub::new(config, EventBus::default())
}

/// Echo every request back as a correlated `task_update`.
fn spawn_echo_agent(hub: Arc<CommunicationHub>, mut conn: AgentConnection) {
    tokio::spawn(async move {
        while let Some(msg) = conn.recv().await {
            if msg.requires_response {
                let reply = msg.reply(
                    conn.agent_id.clone(),
                    MessageType::TaskUpdate,
                    serde_json::json!({"echo": msg.payload}),
                );
                hub.handle_incoming(&conn.agent_id, reply);
            }
        }
    });
}

#[tokio::test]
async fn test_request_resolves_with_correlated_reply() {
    let hub = hub_with_timeout(1_000);
    let conn = hub
        .connect(AgentRegistration::new("echo", AgentTier::Executor))
        .unwrap();
    spawn_echo_agent(hub.clone(), conn);

    let request = Message::to_agent(MessageType::TaskAssignment, "echo", serde_json::json!(7));
    let request_id = request.id;
    let reply = hub.request("echo", request).await.unwrap();

    assert_eq!(reply.correlation_id, Some(request_id));
    assert_eq!(reply.payload["echo"], 7);
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn test_send_with_requires_response_returns_reply() {
    let hub = hub_with_timeout(1_000);
    let conn = hub
        .connect(AgentRegistration::new("echo", AgentTier::Planner))
        .unwrap();
    spawn_echo_agent(hub.clone(), conn);

    let msg = Message::to_agent(MessageType::Heartbeat, "echo", serde_json::Value::Null)
        .expecting_response();
    let reply = hub.send("echo", msg).await.unwrap();
    assert!(reply.is_some());
}

#[tokio::test]
async fn test_many_concurrent_requests_each_resolve_once() {
    let hub = hub_with_timeout(2_000);
    let conn = hub
        .connect(AgentRegistration::new("echo", AgentTier::Executor))
        .unwrap();
    spawn_echo_agent(hub.clone(), conn);

    let mut handles = Vec::new();
    for i in 0..50 {
        let hub = hub.clone();
        handles.push(tokio::spawn(async move {
            let msg = Message::to_agent(MessageType::TaskAssignment, "echo", serde_json::json!(i));
            hub.request("echo", msg).await.unwrap().payload["echo"].clone()
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), serde_json::json!(i));
    }
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_ignored() {
    let hub = hub_with_timeout(30);
    let mut conn = hub
        .connect(AgentRegistration::new("slow", AgentTier::Executor))
        .unwrap();

    let msg = Message::to_agent(MessageType::TaskAssignment, "slow", serde_json::Value::Null);
    let err = hub.request("slow", msg).await.unwrap_err();
    assert!(matches!(err, ConductorError::Timeout(_)));

    let received = conn.recv().await.unwrap();
    let reply = received.reply("slow", MessageType::TaskUpdate, serde_json::Value::Null);
    hub.handle_incoming("slow", reply);
    assert_eq!(hub.pending_count(), 0);
}

#[tokio::test]
async fn test_disconnect_rejects_pending_request() {
    let hub = hub_with_timeout(5_000);
    let mut conn = hub
        .connect(AgentRegistration::new("leaver", AgentTier::Coordinator))
        .unwrap();

    let requester = {
        let hub = hub.clone();
        tokio::spawn(async move {
            let msg = Message::to_agent(MessageType::TaskAssignment, "leaver", serde_json::Value::Null);
            hub.request("leaver", msg).await
        })
    };

    // Wait until the request is on the wire, then drop the agent.
    conn.recv().await.unwrap();
    assert!(hub.unregister("leaver"));

    let result = tokio::time::timeout(Duration::from_secs(1), requester)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConductorError::Connection(_))));
    assert_eq!(hub.pending_count(), 0);
    assert!(!hub.is_registered("leaver"));
}

#[tokio::test]
async fn test_per_endpoint_ordering() {
    let hub = hub_with_timeout(1_000);
    let mut conn = hub
        .connect(AgentRegistration::new("ordered", AgentTier::Executor))
        .unwrap();

    for i in 0..100 {
        let msg = Message::to_agent(MessageType::TaskUpdate, "ordered", serde_json::json!(i));
        hub.send("ordered", msg).await.unwrap();
    }
    for i in 0..100 {
        assert_eq!(conn.recv().await.unwrap().payload, serde_json::json!(i));
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_live_endpoint() {
    let hub = hub_with_timeout(1_000);
    let mut a = hub
        .connect(AgentRegistration::new("a", AgentTier::Planner))
        .unwrap();
    let mut b = hub
        .connect(AgentRegistration::new("b", AgentTier::Executor))
        .unwrap();
    let c = hub
        .connect(AgentRegistration::new("c", AgentTier::Executor))
        .unwrap();
    drop(c);

    assert_eq!(hub.shutdown_all("maintenance"), 2);
    assert_eq!(a.recv().await.unwrap().message_type, MessageType::Shutdown);
    assert_eq!(b.recv().await.unwrap().message_type, MessageType::Shutdown);
    assert_eq!(hub.online_count(), 2);
}

#[tokio::test]
async fn test_heartbeat_loop_reaches_endpoints() {
    let config = HubConfig {
        heartbeat_interval_ms: 20,
        ..HubConfig::default()
    };
    let hub = CommunicationHub::new(config, EventBus::default());
    let mut conn = hub
        .connect(AgentRegistration::new("beat", AgentTier::Executor))
        .unwrap();
    let loop_handle = hub.start_heartbeat();

    let heartbeat = tokio::time::timeout(Duration::from_secs(1), conn.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(heartbeat.message_type, MessageType::Heartbeat);
    loop_handle.abort();
}
