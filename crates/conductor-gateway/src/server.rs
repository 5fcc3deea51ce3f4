use crate::agent_socket::agent_socket;
use crate::routes;
use axum::extract::Request;
use axum::middleware::{self as axum_mw, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use conductor_core::ConductorResult;
use conductor_hub::CommunicationHub;
use conductor_orchestrator::CommandSystem;
use conductor_reporting::ReportingSystem;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tracing::{debug, info};

/// Shared application state.
pub struct AppState {
    pub commands: Arc<CommandSystem>,
    pub hub: Arc<CommunicationHub>,
    pub reporting: Arc<ReportingSystem>,
}

/// Where the gateway listens.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requests handled at once; further requests wait.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_concurrent_requests() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The HTTP and WebSocket gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router over the given subsystems.
    pub fn build(state: Arc<AppState>, config: &GatewayConfig) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/commands", get(routes::list_commands).post(routes::submit_command))
            .route(
                "/commands/{id}",
                get(routes::get_command).delete(routes::cancel_command),
            )
            .route("/strategies", get(routes::strategies))
            .route("/dashboard", get(routes::dashboard))
            .route("/reports", get(routes::reports))
            .route("/metrics", get(routes::metrics))
            .route("/agents", get(routes::agents))
            .route("/pools", get(routes::pools))
            .route("/ws/agents", get(agent_socket))
            .layer(
                ServiceBuilder::new()
                    .layer(axum_mw::from_fn(log_request))
                    .layer(ConcurrencyLimitLayer::new(config.max_concurrent_requests.max(1))),
            )
            .with_state(state)
    }

    /// Bind `config.addr()` and serve until `shutdown` resolves.
    pub async fn serve<F>(state: Arc<AppState>, config: &GatewayConfig, shutdown: F) -> ConductorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(config.addr()).await?;
        let addr: SocketAddr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening");
        axum::serve(listener, Self::build(state, config))
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Gateway stopped");
        Ok(())
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if status.is_server_error() || status.is_client_error() {
        info!(method = %method, path = %path, status = status.as_u16(), elapsed_ms, "Request");
    } else {
        debug!(method = %method, path = %path, status = status.as_u16(), elapsed_ms, "Request");
    }
    response
}
