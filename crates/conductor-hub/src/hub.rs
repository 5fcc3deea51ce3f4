use crate::config::HubConfig;
use crate::endpoint::{AgentConnection, AgentEndpoint, AgentRegistration, EndpointInfo, EndpointStatus};
use crate::message::{Heartbeat, Message, MessageType, Recipient, HUB_ID};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, EventBus, OrchestratorEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message received from an agent, tagged with the endpoint it came from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub agent_id: String,
    pub message: Message,
}

struct PendingRequest {
    agent_id: String,
    tx: oneshot::Sender<ConductorResult<Message>>,
}

/// Removes a pending entry when the awaiting future goes away, whatever the reason.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<Uuid, PendingRequest>>,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Routes messages between the orchestrator and registered agent endpoints.
///
/// Every endpoint owns an unbounded FIFO channel, so messages to one endpoint
/// are delivered in send order. Requests that require a response park a
/// oneshot in the pending table keyed by message id; the first of reply,
/// timeout, or disconnect resolves it and removes the entry.
pub struct CommunicationHub {
    config: HubConfig,
    endpoints: RwLock<HashMap<String, AgentEndpoint>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    inbound: broadcast::Sender<InboundMessage>,
    events: EventBus,
}

impl CommunicationHub {
    pub fn new(config: HubConfig, events: EventBus) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        Arc::new(Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            inbound,
            events,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an endpoint whose outbound messages are written to `tx`.
    ///
    /// Re-registering an id replaces the previous endpoint and rejects any
    /// request still waiting on it.
    pub fn register(
        &self,
        registration: AgentRegistration,
        tx: mpsc::UnboundedSender<Message>,
    ) -> ConductorResult<()> {
        if registration.id.trim().is_empty() {
            return Err(ConductorError::Validation(
                "agent id must not be empty".to_string(),
            ));
        }
        let agent_id = registration.id.clone();
        let tier = registration.tier;
        let replaced = self
            .endpoints
            .write()
            .insert(agent_id.clone(), AgentEndpoint::new(registration, tx));

        if replaced.is_some() {
            warn!(agent_id = %agent_id, "Agent re-registered, replacing previous endpoint");
            self.reject_pending_for(&agent_id, "endpoint was replaced");
        }
        info!(agent_id = %agent_id, tier = %tier, "Agent registered");
        self.events
            .emit(OrchestratorEvent::AgentRegistered { agent_id, tier });
        Ok(())
    }

    /// Register an in-process endpoint and hand back its receiving side.
    pub fn connect(&self, registration: AgentRegistration) -> ConductorResult<AgentConnection> {
        let agent_id = registration.id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(registration, tx)?;
        Ok(AgentConnection { agent_id, rx })
    }

    /// Remove an endpoint. Requests waiting on it fail with a connection error.
    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.endpoints.write().remove(agent_id).is_some();
        if removed {
            self.reject_pending_for(agent_id, "agent disconnected");
            info!(agent_id = %agent_id, "Agent disconnected");
            self.events.emit(OrchestratorEvent::AgentDisconnected {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.endpoints.read().contains_key(agent_id)
    }

    pub fn endpoint(&self, agent_id: &str) -> Option<EndpointInfo> {
        self.endpoints.read().get(agent_id).map(AgentEndpoint::info)
    }

    /// Snapshots of every known endpoint, sorted by id.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut list: Vec<EndpointInfo> = self
            .endpoints
            .read()
            .values()
            .map(AgentEndpoint::info)
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Number of endpoints that are not offline.
    pub fn online_count(&self) -> usize {
        self.endpoints
            .read()
            .values()
            .filter(|e| e.status.is_reachable())
            .count()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Subscribe to every non-heartbeat message received from agents.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// Deliver a message to one endpoint.
    ///
    /// When the message requires a response, waits for the correlated reply
    /// using the configured request timeout and returns it.
    pub async fn send(&self, agent_id: &str, message: Message) -> ConductorResult<Option<Message>> {
        if message.requires_response {
            let timeout = self.config.request_timeout();
            return self
                .request_with_timeout(agent_id, message, timeout)
                .await
                .map(Some);
        }
        self.deliver(agent_id, message)?;
        Ok(None)
    }

    /// Send and wait for the correlated reply using the configured timeout.
    pub async fn request(&self, agent_id: &str, message: Message) -> ConductorResult<Message> {
        let timeout = self.config.request_timeout();
        self.request_with_timeout(agent_id, message, timeout).await
    }

    /// Send and wait at most `timeout` for the correlated reply.
    pub async fn request_with_timeout(
        &self,
        agent_id: &str,
        mut message: Message,
        timeout: Duration,
    ) -> ConductorResult<Message> {
        message.requires_response = true;
        let id = message.id;
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                agent_id: agent_id.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.deliver(agent_id, message)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConductorError::Connection(format!(
                "request {id} to agent '{agent_id}' was dropped"
            ))),
            Err(_) => {
                // A reply that raced the deadline already owns the entry.
                if self.pending.lock().remove(&id).is_none() {
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                warn!(agent_id = %agent_id, request_id = %id, "Request timed out");
                Err(ConductorError::Timeout(format!(
                    "no reply from agent '{agent_id}' within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Deliver to every reachable endpoint. Returns how many accepted it.
    pub fn broadcast(&self, message: Message) -> usize {
        let mut message = message;
        message.to = Recipient::Broadcast;
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let endpoints = self.endpoints.read();
            for endpoint in endpoints.values().filter(|e| e.status.is_reachable()) {
                if endpoint.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(endpoint.id().to_string());
                }
            }
        }
        for agent_id in closed {
            self.mark_offline(&agent_id, "connection closed");
        }
        debug!(message_type = ?message.message_type, delivered, "Broadcast sent");
        delivered
    }

    /// Process a message received from `agent_id`.
    ///
    /// Any traffic counts as a heartbeat. A reply resolves its pending
    /// request; every message other than a heartbeat is also published to
    /// inbound subscribers.
    pub fn handle_incoming(&self, agent_id: &str, message: Message) {
        let reported_cpu = if message.message_type == MessageType::Heartbeat {
            message
                .payload_as::<Heartbeat>()
                .ok()
                .and_then(|h| h.cpu_usage)
                .filter(|cpu| cpu.is_finite())
        } else {
            None
        };
        let revived = {
            let mut endpoints = self.endpoints.write();
            match endpoints.get_mut(agent_id) {
                Some(endpoint) => {
                    endpoint.last_heartbeat = Utc::now();
                    if let Some(cpu) = reported_cpu {
                        endpoint.cpu_usage = Some(cpu.clamp(0.0, 1.0));
                    }
                    if endpoint.status == EndpointStatus::Offline {
                        endpoint.status = EndpointStatus::Online;
                        endpoint.refresh_load();
                        true
                    } else {
                        false
                    }
                }
                None => {
                    warn!(agent_id = %agent_id, message_type = ?message.message_type, "Message from unknown agent");
                    return;
                }
            }
        };
        if revived {
            info!(agent_id = %agent_id, "Agent back online");
        }

        if let Some(correlation_id) = message.correlation_id {
            if self.resolve_reply(agent_id, correlation_id, &message) {
                debug!(agent_id = %agent_id, correlation_id = %correlation_id, "Reply correlated");
            }
        }

        if message.message_type == MessageType::Heartbeat {
            return;
        }
        if message.message_type == MessageType::ErrorReport {
            let text = message
                .payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified error")
                .to_string();
            self.events.emit(OrchestratorEvent::AgentError {
                agent_id: agent_id.to_string(),
                message: text,
            });
        }
        let _ = self.inbound.send(InboundMessage {
            agent_id: agent_id.to_string(),
            message,
        });
    }

    /// Record that `task_id` is now running on `agent_id`.
    pub fn mark_busy(&self, agent_id: &str, task_id: Uuid) {
        self.update_tasks(agent_id, |tasks| {
            if !tasks.contains(&task_id) {
                tasks.push(task_id);
            }
        });
    }

    /// Record that `task_id` no longer runs on `agent_id`.
    pub fn mark_idle(&self, agent_id: &str, task_id: Uuid) {
        self.update_tasks(agent_id, |tasks| tasks.retain(|t| *t != task_id));
    }

    /// Mark silent endpoints offline and fail their pending requests.
    /// Returns the ids that timed out on this pass.
    pub fn check_liveness(&self) -> Vec<String> {
        self.check_liveness_at(Utc::now())
    }

    pub(crate) fn check_liveness_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let limit = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let timed_out: Vec<String> = {
            let mut endpoints = self.endpoints.write();
            endpoints
                .values_mut()
                .filter(|e| e.status.is_reachable() && now - e.last_heartbeat > limit)
                .map(|e| {
                    e.status = EndpointStatus::Offline;
                    e.id().to_string()
                })
                .collect()
        };
        for agent_id in &timed_out {
            warn!(agent_id = %agent_id, "Agent heartbeat timed out");
            self.reject_pending_for(agent_id, "agent heartbeat timed out");
            self.events.emit(OrchestratorEvent::AgentTimeout {
                agent_id: agent_id.clone(),
            });
        }
        timed_out
    }

    /// Send a heartbeat to every reachable endpoint.
    pub fn send_heartbeats(&self) -> usize {
        let heartbeat = Message::new(
            MessageType::Heartbeat,
            HUB_ID,
            Recipient::Broadcast,
            serde_json::json!({ "timestamp": Utc::now() }),
        );
        self.broadcast(heartbeat)
    }

    /// Spawn the periodic liveness loop.
    pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = self.config.heartbeat_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                hub.check_liveness();
                hub.send_heartbeats();
            }
        })
    }

    /// Ask every endpoint to shut down.
    pub fn shutdown_all(&self, reason: &str) -> usize {
        let message = Message::new(
            MessageType::Shutdown,
            HUB_ID,
            Recipient::Broadcast,
            serde_json::json!({ "reason": reason }),
        );
        self.broadcast(message)
    }

    fn deliver(&self, agent_id: &str, message: Message) -> ConductorResult<()> {
        let outcome = {
            let endpoints = self.endpoints.read();
            let endpoint = endpoints.get(agent_id).ok_or_else(|| {
                ConductorError::Connection(format!("unknown agent '{agent_id}'"))
            })?;
            if !endpoint.status.is_reachable() {
                return Err(ConductorError::Connection(format!(
                    "agent '{agent_id}' is offline"
                )));
            }
            endpoint.tx.send(message)
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => {
                self.mark_offline(agent_id, "connection closed");
                Err(ConductorError::Connection(format!(
                    "connection to agent '{agent_id}' is closed"
                )))
            }
        }
    }

    /// Resolve the request `correlation_id` with `reply`, provided it was
    /// addressed to `agent_id`. A reply from any other agent leaves the
    /// request pending.
    fn resolve_reply(&self, agent_id: &str, correlation_id: Uuid, reply: &Message) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&correlation_id) {
            Some(request) if request.agent_id != agent_id => {
                warn!(
                    agent_id = %agent_id,
                    expected = %request.agent_id,
                    correlation_id = %correlation_id,
                    "Reply from an agent the request was not sent to"
                );
                false
            }
            Some(_) => match pending.remove(&correlation_id) {
                Some(request) => {
                    let _ = request.tx.send(Ok(reply.clone()));
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    fn reject_pending_for(&self, agent_id: &str, reason: &str) {
        let mut pending = self.pending.lock();
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, p)| p.agent_id == agent_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(request) = pending.remove(&id) {
                let _ = request.tx.send(Err(ConductorError::Connection(format!(
                    "{reason}: '{agent_id}'"
                ))));
            }
        }
    }

    fn mark_offline(&self, agent_id: &str, reason: &str) {
        let changed = {
            let mut endpoints = self.endpoints.write();
            match endpoints.get_mut(agent_id) {
                Some(e) if e.status != EndpointStatus::Offline => {
                    e.status = EndpointStatus::Offline;
                    true
                }
                _ => false,
            }
        };
        if changed {
            warn!(agent_id = %agent_id, reason, "Agent marked offline");
            self.reject_pending_for(agent_id, reason);
            self.events.emit(OrchestratorEvent::AgentStatusChanged {
                agent_id: agent_id.to_string(),
                status: EndpointStatus::Offline.to_string(),
                load: 0.0,
            });
        }
    }

    fn update_tasks<F>(&self, agent_id: &str, f: F)
    where
        F: FnOnce(&mut Vec<Uuid>),
    {
        let snapshot = {
            let mut endpoints = self.endpoints.write();
            endpoints.get_mut(agent_id).map(|endpoint| {
                f(&mut endpoint.current_tasks);
                endpoint.refresh_load();
                (endpoint.status, endpoint.load)
            })
        };
        if let Some((status, load)) = snapshot {
            self.events.emit(OrchestratorEvent::AgentStatusChanged {
                agent_id: agent_id.to_string(),
                status: status.to_string(),
                load,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::AgentTier;

    fn hub() -> Arc<CommunicationHub> {
        CommunicationHub::new(HubConfig::default(), EventBus::default())
    }

    fn ping(agent: &str) -> Message {
        Message::to_agent(MessageType::Heartbeat, agent, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails_immediately() {
        let hub = hub();
        let err = hub.send("ghost", ping("ghost")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Connection(_)));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let hub = hub();
        let result = hub.connect(AgentRegistration::new("  ", AgentTier::Executor));
        assert!(matches!(result, Err(ConductorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_fire_and_forget_delivery() {
        let hub = hub();
        let mut conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        let reply = hub.send("a1", ping("a1")).await.unwrap();
        assert!(reply.is_none());
        let received = conn.recv().await.unwrap();
        assert_eq!(received.message_type, MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_request_timeout_removes_pending_entry() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Planner))
            .unwrap();
        let err = hub
            .request_with_timeout("a1", ping("a1"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Timeout(_)));
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_future_leaves_no_pending_entry() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Planner))
            .unwrap();
        {
            let fut = hub.request_with_timeout("a1", ping("a1"), Duration::from_secs(5));
            let _ = tokio::time::timeout(Duration::from_millis(10), fut).await;
        }
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_liveness_marks_silent_endpoint_offline() {
        let hub = hub();
        let mut events = hub.events().subscribe();
        let _conn = hub
            .connect(AgentRegistration::new("quiet", AgentTier::Coordinator))
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(hub.check_liveness_at(later), vec!["quiet".to_string()]);
        assert_eq!(hub.endpoint("quiet").unwrap().status, EndpointStatus::Offline);
        assert_eq!(hub.online_count(), 0);
        // already offline: not reported twice
        assert!(hub.check_liveness_at(later).is_empty());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"agent_timeout"));

        let err = hub.send("quiet", ping("quiet")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_traffic_revives_offline_endpoint() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        hub.check_liveness_at(Utc::now() + chrono::Duration::seconds(120));
        assert_eq!(hub.endpoint("a1").unwrap().status, EndpointStatus::Offline);

        let beat = Message::new(
            MessageType::Heartbeat,
            "a1",
            Recipient::Agent(HUB_ID.into()),
            serde_json::Value::Null,
        );
        hub.handle_incoming("a1", beat);
        assert_eq!(hub.endpoint("a1").unwrap().status, EndpointStatus::Idle);
    }

    #[tokio::test]
    async fn test_busy_idle_bookkeeping() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        let task = Uuid::new_v4();
        hub.mark_busy("a1", task);
        let info = hub.endpoint("a1").unwrap();
        assert_eq!(info.status, EndpointStatus::Busy);
        assert_eq!(info.current_tasks, vec![task]);
        assert_eq!(info.load, 1.0);

        hub.mark_idle("a1", task);
        let info = hub.endpoint("a1").unwrap();
        assert_eq!(info.status, EndpointStatus::Idle);
        assert!(info.current_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_marks_offline() {
        let hub = hub();
        let conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        drop(conn);
        let err = hub.send("a1", ping("a1")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Connection(_)));
        assert_eq!(hub.endpoint("a1").unwrap().status, EndpointStatus::Offline);
    }

    #[tokio::test]
    async fn test_heartbeats_are_not_published_inbound() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        let mut inbound = hub.subscribe();
        let beat = Message::new(
            MessageType::Heartbeat,
            "a1",
            Recipient::Agent(HUB_ID.into()),
            serde_json::Value::Null,
        );
        hub.handle_incoming("a1", beat);
        let update = Message::new(
            MessageType::TaskUpdate,
            "a1",
            Recipient::Agent(HUB_ID.into()),
            serde_json::json!({"task_id": Uuid::new_v4(), "status": "working"}),
        );
        hub.handle_incoming("a1", update);

        let first = inbound.try_recv().unwrap();
        assert_eq!(first.message.message_type, MessageType::TaskUpdate);
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_from_other_agent_does_not_resolve() {
        let hub = hub();
        let mut target = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        let _other = hub
            .connect(AgentRegistration::new("a2", AgentTier::Executor))
            .unwrap();

        let request = tokio::spawn({
            let hub = hub.clone();
            async move {
                hub.request_with_timeout("a1", ping("a1"), Duration::from_secs(2))
                    .await
            }
        });
        let sent = target.recv().await.unwrap();

        let forged = sent.reply("a2", MessageType::TaskUpdate, serde_json::Value::Null);
        hub.handle_incoming("a2", forged);
        assert_eq!(hub.pending_count(), 1);

        let genuine = sent.reply("a1", MessageType::Heartbeat, serde_json::json!({"ok": true}));
        hub.handle_incoming("a1", genuine);
        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.from, "a1");
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_records_reported_cpu() {
        let hub = hub();
        let _conn = hub
            .connect(AgentRegistration::new("a1", AgentTier::Executor))
            .unwrap();
        assert_eq!(hub.endpoint("a1").unwrap().cpu_usage, None);

        let beat = |payload: serde_json::Value| {
            Message::new(MessageType::Heartbeat, "a1", Recipient::Agent(HUB_ID.into()), payload)
        };
        hub.handle_incoming("a1", beat(serde_json::json!({"cpu_usage": 0.7})));
        assert_eq!(hub.endpoint("a1").unwrap().cpu_usage, Some(0.7));

        hub.handle_incoming("a1", beat(serde_json::json!({"cpu_usage": 3.0})));
        assert_eq!(hub.endpoint("a1").unwrap().cpu_usage, Some(1.0));

        // a bare heartbeat keeps the last report
        hub.handle_incoming("a1", beat(serde_json::Value::Null));
        assert_eq!(hub.endpoint("a1").unwrap().cpu_usage, Some(1.0));
    }
}
