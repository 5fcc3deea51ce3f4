use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, Priority, Task};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender id used for messages originating from the orchestrator itself.
pub const HUB_ID: &str = "conductor";

/// The agent-protocol vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Orchestrator → agent: execute a task.
    TaskAssignment,
    /// Agent → orchestrator: progress or acknowledgement for a task.
    TaskUpdate,
    /// Agent → orchestrator: a task finished successfully.
    TaskCompletion,
    /// Agent → orchestrator: a task's work failed.
    TaskFailure,
    /// Agent → orchestrator: an error not tied to a task outcome.
    ErrorReport,
    /// Liveness check in either direction.
    Heartbeat,
    /// Orchestrator → agent: stop and disconnect.
    Shutdown,
    /// Orchestrator → agent: abandon work for a cancelled command.
    Cancellation,
}

/// Addressee of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single endpoint.
    Agent(String),
    /// Every live endpoint.
    Broadcast,
}

/// A message exchanged between the orchestrator and an agent endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: Recipient,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requires_response: bool,
    /// Id of the message this one answers.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: Recipient,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            from: from.into(),
            to,
            payload,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            requires_response: false,
            correlation_id: None,
        }
    }

    /// A message from the orchestrator to one agent.
    pub fn to_agent(
        message_type: MessageType,
        agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(message_type, HUB_ID, Recipient::Agent(agent_id.into()), payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Build a reply correlated with this message, sent back to its author.
    pub fn reply(
        &self,
        from: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        let mut reply = Self::new(
            message_type,
            from,
            Recipient::Agent(self.from.clone()),
            payload,
        );
        reply.correlation_id = Some(self.id);
        reply
    }

    /// Decode the payload into a typed protocol body.
    pub fn payload_as<T: DeserializeOwned>(&self) -> ConductorResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ConductorError::Validation(format!(
                "malformed {:?} payload in message {}: {e}",
                self.message_type, self.id
            ))
        })
    }
}

/// Body of a `task_assignment` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: Task,
}

/// Body of a `task_update` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Uuid,
    /// Free-form status, `accepted` for an assignment acknowledgement.
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a `task_completion` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: Uuid,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Body of a `task_failure` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub error: String,
}

/// Body of an `error_report` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

/// Body of a `heartbeat` message sent by an agent. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// CPU usage in `[0, 1]`.
    #[serde(default)]
    pub cpu_usage: Option<f64>,
}

/// Body of a `cancellation` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub command_id: Uuid,
    pub task_ids: Vec<Uuid>,
    pub reason: String,
}
