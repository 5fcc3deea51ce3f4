//! Message hub between the Conductor orchestrator and its agent endpoints.
//!
//! The [`CommunicationHub`] keeps a registry of endpoints, delivers messages
//! to them in FIFO order, correlates request/response pairs with timeouts,
//! and tracks liveness through heartbeats.

pub mod config;
pub mod endpoint;
pub mod hub;
pub mod message;

pub use config::HubConfig;
pub use endpoint::{AgentConnection, AgentRegistration, EndpointInfo, EndpointStatus};
pub use hub::{CommunicationHub, InboundMessage};
pub use message::{
    Cancellation, ErrorReport, Heartbeat, Message, MessageType, Recipient, TaskAssignment, TaskCompletion,
    TaskFailure, TaskUpdate, HUB_ID,
};
