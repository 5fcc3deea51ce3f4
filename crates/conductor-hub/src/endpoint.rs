use crate::message::Message;
use chrono::{DateTime, Utc};
use conductor_core::AgentTier;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What an agent announces when it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tier: AgentTier,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, tier: AgentTier) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tier,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Liveness/occupancy of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Online,
    Idle,
    Busy,
    Offline,
}

impl EndpointStatus {
    /// Whether messages may be delivered to an endpoint in this status.
    pub fn is_reachable(self) -> bool {
        !matches!(self, EndpointStatus::Offline)
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointStatus::Online => write!(f, "online"),
            EndpointStatus::Idle => write!(f, "idle"),
            EndpointStatus::Busy => write!(f, "busy"),
            EndpointStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered agent and the channel its messages are written to.
#[derive(Debug)]
pub struct AgentEndpoint {
    pub registration: AgentRegistration,
    pub status: EndpointStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub current_tasks: Vec<Uuid>,
    pub load: f64,
    /// CPU usage in `[0, 1]` from the agent's last heartbeat.
    pub cpu_usage: Option<f64>,
    pub(crate) tx: mpsc::UnboundedSender<Message>,
}

impl AgentEndpoint {
    pub(crate) fn new(registration: AgentRegistration, tx: mpsc::UnboundedSender<Message>) -> Self {
        let now = Utc::now();
        Self {
            registration,
            status: EndpointStatus::Idle,
            last_heartbeat: now,
            connected_at: now,
            current_tasks: Vec::new(),
            load: 0.0,
            cpu_usage: None,
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.registration.id
    }

    pub(crate) fn refresh_load(&mut self) {
        self.load = self.current_tasks.len() as f64;
        if self.status != EndpointStatus::Offline {
            self.status = if self.current_tasks.is_empty() {
                EndpointStatus::Idle
            } else {
                EndpointStatus::Busy
            };
        }
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            id: self.registration.id.clone(),
            name: self.registration.name.clone(),
            tier: self.registration.tier,
            capabilities: self.registration.capabilities.clone(),
            status: self.status,
            last_heartbeat: self.last_heartbeat,
            connected_at: self.connected_at,
            current_tasks: self.current_tasks.clone(),
            load: self.load,
            cpu_usage: self.cpu_usage,
        }
    }
}

/// Serializable snapshot of an [`AgentEndpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: String,
    pub name: String,
    pub tier: AgentTier,
    pub capabilities: Vec<String>,
    pub status: EndpointStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub current_tasks: Vec<Uuid>,
    pub load: f64,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
}

/// The agent side of an in-process connection created by
/// [`CommunicationHub::connect`](crate::CommunicationHub::connect).
pub struct AgentConnection {
    pub agent_id: String,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

impl AgentConnection {
    /// Wait for the next message addressed to this agent.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
