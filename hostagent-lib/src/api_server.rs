use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hostagent_common::{AgentError, ErrorKind};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AgentConfig;
use crate::keys::SshKeyManager;
use crate::lifecycle::LifecycleController;

/// API server configuration
#[derive(Clone, Debug)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
        }
    }
}

impl From<&AgentConfig> for ApiServerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            host: config.api_host.clone(),
            port: config.api_port,
        }
    }
}

/// Shared state for the API server
#[derive(Clone)]
pub struct ApiState {
    pub controller: LifecycleController,
    pub keys: SshKeyManager,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    pub status: StatusCode,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidSpec => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PortConflict | ErrorKind::InvalidState | ErrorKind::SshNotProvisioned => {
            StatusCode::CONFLICT
        }
        ErrorKind::PortExhausted | ErrorKind::RuntimeUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::RuntimeRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Persistence | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let kind = err.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(code = kind.as_str(), error = %err, "Request failed");
        }
        Self {
            error: err.to_string(),
            code: kind.as_str().to_string(),
            status,
        }
    }
}

/// Malformed bodies are reported like any other invalid request.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        AgentError::InvalidSpec(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    config: ApiServerConfig,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = crate::api_routes::build_api_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}
