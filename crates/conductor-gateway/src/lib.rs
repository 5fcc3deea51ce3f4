//! HTTP and WebSocket gateway for Conductor.
//!
//! Exposes command submission and the reporting views over HTTP, and lets
//! remote agents join the [`CommunicationHub`](conductor_hub::CommunicationHub)
//! over `GET /ws/agents`.
//!
//! # Main types
//!
//! - [`GatewayServer`]: Builds the router and serves it.
//! - [`AppState`]: The subsystems the handlers share.
//! - [`ApiError`]: Maps error kinds to HTTP status codes.

/// Agent protocol over WebSocket.
pub mod agent_socket;
/// Error responses.
pub mod error;
/// HTTP handlers.
pub mod routes;
/// Router construction and serving.
pub mod server;

pub use error::{status_for, ApiError, ApiResult};
pub use server::{AppState, GatewayConfig, GatewayServer};
