// Re-export dependencies used in public interfaces of common types

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chrono;
pub use uuid;

pub mod api;
pub mod instance;
pub mod runtime;

pub use api::*;
pub use instance::*;
pub use runtime::*;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error("Host port {port} is already bound to a live instance")]
    PortConflict { port: u16 },

    #[error("No free host port left in {range}")]
    PortExhausted { range: String },

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance is not in a usable state: {0}")]
    InvalidState(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime rejected the request: {0}")]
    RuntimeRejected(String),

    #[error("SSH is not provisioned for instance {0}")]
    SshNotProvisioned(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

/// Stable, machine-readable error kind carried next to every user-visible
/// failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSpec,
    PortConflict,
    PortExhausted,
    NotFound,
    InvalidState,
    RuntimeUnavailable,
    RuntimeRejected,
    SshNotProvisioned,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::PortConflict => "port_conflict",
            ErrorKind::PortExhausted => "port_exhausted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::RuntimeRejected => "runtime_rejected",
            ErrorKind::SshNotProvisioned => "ssh_not_provisioned",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            AgentError::PortConflict { .. } => ErrorKind::PortConflict,
            AgentError::PortExhausted { .. } => ErrorKind::PortExhausted,
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::InvalidState(_) => ErrorKind::InvalidState,
            AgentError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            AgentError::RuntimeRejected(_) => ErrorKind::RuntimeRejected,
            AgentError::SshNotProvisioned(_) => ErrorKind::SshNotProvisioned,
            AgentError::Persistence(_) => ErrorKind::Persistence,
            AgentError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures may succeed if the caller simply retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::RuntimeUnavailable(_))
    }
}

impl From<RuntimeError> for AgentError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => {
                AgentError::RuntimeRejected(format!("container {what} does not exist"))
            }
            RuntimeError::Unavailable(msg) => AgentError::RuntimeUnavailable(msg),
            RuntimeError::Rejected(msg) => AgentError::RuntimeRejected(msg),
        }
    }
}

// Define the primary Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        let err = AgentError::PortConflict { port: 3000 };
        assert_eq!(err.kind(), ErrorKind::PortConflict);
        assert_eq!(err.kind().as_str(), "port_conflict");
        assert!(err.to_string().contains("3000"));

        let json = serde_json::to_string(&ErrorKind::SshNotProvisioned).unwrap();
        assert_eq!(json, "\"ssh_not_provisioned\"");
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(AgentError::RuntimeUnavailable("timeout".into()).is_transient());
        assert!(!AgentError::RuntimeRejected("bad image".into()).is_transient());
        assert!(!AgentError::InvalidSpec("empty image".into()).is_transient());
    }

    #[test]
    fn test_runtime_error_conversion() {
        let err: AgentError = RuntimeError::Unavailable("daemon down".into()).into();
        assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);

        let err: AgentError = RuntimeError::Rejected("manifest unknown".into()).into();
        assert_eq!(err.kind(), ErrorKind::RuntimeRejected);
    }
}
