use crate::error::Failure;
use crate::types::AgentTier;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1024;

/// A lifecycle fact published by one of the orchestration subsystems.
///
/// Serialized with an `event` tag so the wire names match the public event
/// vocabulary (`command_started`, `agent_timeout`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    CommandStarted {
        command_id: Uuid,
        command_type: String,
        title: String,
    },
    CommandProgress {
        command_id: Uuid,
        status: String,
        progress: f64,
        completed_tasks: usize,
        total_tasks: usize,
    },
    CommandCompleted {
        command_id: Uuid,
        duration_ms: u64,
    },
    CommandFailed {
        command_id: Uuid,
        failure: Failure,
    },
    CommandCancelled {
        command_id: Uuid,
    },
    QualityGateFailed {
        command_id: Uuid,
        gate: String,
        reason: String,
    },
    TaskQueued {
        task_id: Uuid,
        tier: AgentTier,
        queue_len: usize,
    },
    TaskAssigned {
        task_id: Uuid,
        command_id: Option<Uuid>,
        tier: AgentTier,
        process_id: String,
    },
    TaskProgress {
        task_id: Uuid,
        agent_id: String,
        progress: f64,
        message: Option<String>,
    },
    TaskCompleted {
        task_id: Uuid,
        command_id: Option<Uuid>,
        process_id: Option<String>,
        duration_ms: u64,
    },
    TaskRequeued {
        task_id: Uuid,
        attempt: u32,
        retries_left: u32,
    },
    TaskFailed {
        task_id: Uuid,
        command_id: Option<Uuid>,
        process_id: Option<String>,
        failure: Failure,
        attempts: u32,
    },
    AgentRegistered {
        agent_id: String,
        tier: AgentTier,
    },
    AgentStatusChanged {
        agent_id: String,
        status: String,
        load: f64,
    },
    AgentTimeout {
        agent_id: String,
    },
    AgentDisconnected {
        agent_id: String,
    },
    AgentError {
        agent_id: String,
        message: String,
    },
    ProcessSpawned {
        tier: AgentTier,
        process_id: String,
    },
    ProcessTerminated {
        tier: AgentTier,
        process_id: String,
        reason: String,
    },
    PoolScaled {
        tier: AgentTier,
        from: usize,
        to: usize,
        reason: String,
    },
    PoolUtilization {
        tier: AgentTier,
        busy: usize,
        total: usize,
        queued: usize,
    },
    IssueEscalated {
        issue_id: Uuid,
        level: String,
        severity: String,
    },
}

impl OrchestratorEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::CommandStarted { .. } => "command_started",
            OrchestratorEvent::CommandProgress { .. } => "command_progress",
            OrchestratorEvent::CommandCompleted { .. } => "command_completed",
            OrchestratorEvent::CommandFailed { .. } => "command_failed",
            OrchestratorEvent::CommandCancelled { .. } => "command_cancelled",
            OrchestratorEvent::QualityGateFailed { .. } => "quality_gate_failed",
            OrchestratorEvent::TaskQueued { .. } => "task_queued",
            OrchestratorEvent::TaskAssigned { .. } => "task_assigned",
            OrchestratorEvent::TaskProgress { .. } => "task_progress",
            OrchestratorEvent::TaskCompleted { .. } => "task_completed",
            OrchestratorEvent::TaskRequeued { .. } => "task_requeued",
            OrchestratorEvent::TaskFailed { .. } => "task_failed",
            OrchestratorEvent::AgentRegistered { .. } => "agent_registered",
            OrchestratorEvent::AgentStatusChanged { .. } => "agent_status_changed",
            OrchestratorEvent::AgentTimeout { .. } => "agent_timeout",
            OrchestratorEvent::AgentDisconnected { .. } => "agent_disconnected",
            OrchestratorEvent::AgentError { .. } => "agent_error",
            OrchestratorEvent::ProcessSpawned { .. } => "process_spawned",
            OrchestratorEvent::ProcessTerminated { .. } => "process_terminated",
            OrchestratorEvent::PoolScaled { .. } => "pool_scaled",
            OrchestratorEvent::PoolUtilization { .. } => "pool_utilization",
            OrchestratorEvent::IssueEscalated { .. } => "issue_escalated",
        }
    }
}

/// Broadcast pub/sub for [`OrchestratorEvent`]s.
///
/// Cloning the bus yields another handle onto the same channel. Every
/// subscriber sees every event published after it subscribed; there is no
/// ordering guarantee between subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: OrchestratorEvent) -> usize {
        tracing::debug!(event = event.name(), "event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a callback invoked for every subsequent event.
    ///
    /// The callback runs on its own task until the bus is dropped or the
    /// returned handle is aborted. Lagged events are skipped with a warning.
    pub fn on<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(OrchestratorEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_many_listeners_see_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let delivered = bus.emit(OrchestratorEvent::AgentTimeout {
            agent_id: "agent-1".into(),
        });
        assert_eq!(delivered, 2);

        assert_eq!(a.recv().await.unwrap().name(), "agent_timeout");
        assert_eq!(b.recv().await.unwrap().name(), "agent_timeout");
    }

    #[test]
    fn test_emit_without_listeners_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(
            bus.emit(OrchestratorEvent::CommandCancelled {
                command_id: Uuid::new_v4()
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_callback_registration() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.on(move |event| sink.lock().unwrap().push(event.name()));
        tokio::task::yield_now().await;

        bus.emit(OrchestratorEvent::AgentDisconnected {
            agent_id: "a".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.abort();

        assert_eq!(seen.lock().unwrap().as_slice(), ["agent_disconnected"]);
    }

    #[test]
    fn test_event_wire_name() {
        let event = OrchestratorEvent::CommandStarted {
            command_id: Uuid::new_v4(),
            command_type: "IMPLEMENT_FEATURE".into(),
            title: "Login".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "command_started");
        assert_eq!(event.name(), "command_started");
    }
}
