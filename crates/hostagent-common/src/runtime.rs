//! Capability interface the core uses to effect and observe container state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Marks every container created by the agent.
pub const MANAGED_LABEL: &str = "io.hostagent.managed";
pub const INSTANCE_ID_LABEL: &str = "io.hostagent.instance-id";
pub const SSH_ENABLED_LABEL: &str = "io.hostagent.ssh-enabled";
pub const STORAGE_GB_LABEL: &str = "io.hostagent.storage-gb";
pub const IMAGE_LABEL: &str = "io.hostagent.image";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("No such container: {0}")]
    NotFound(String),
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Runtime rejected request: {0}")]
    Rejected(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// CPU / memory / GPU limits derived from the reserved environment keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_cores: Option<f64>,
    pub memory_gb: Option<f64>,
    pub gpu_count: Option<u32>,
}

/// Everything the runtime needs to create one workload container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// container port -> host port
    pub port_bindings: BTreeMap<u16, u16>,
    pub storage_gb: u32,
    /// `None` runs the image default (or the idle placeholder when the image
    /// declares nothing).
    pub command: Option<Vec<String>>,
    pub limits: ResourceLimits,
    pub labels: BTreeMap<String, String>,
}

/// Observed container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    pub exists: bool,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
}

impl ContainerInspect {
    pub fn missing() -> Self {
        Self {
            exists: false,
            state: ContainerState::Unknown,
            exit_code: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.exists && self.state == ContainerState::Running
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// A container carrying [`MANAGED_LABEL`], as found by a runtime scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub runtime_ref: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
    /// container port -> host port
    pub port_bindings: BTreeMap<u16, u16>,
}

impl ManagedContainer {
    pub fn instance_id(&self) -> Option<&str> {
        self.labels.get(INSTANCE_ID_LABEL).map(String::as_str)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull (if needed) and create a container; returns its runtime reference.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Start a container. Starting a running container succeeds.
    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()>;

    /// Stop a container. Stopping a stopped container succeeds.
    async fn stop(&self, runtime_ref: &str) -> RuntimeResult<()>;

    /// Force-remove a container. `NotFound` when it is already gone.
    async fn remove(&self, runtime_ref: &str) -> RuntimeResult<()>;

    /// Observe a container; a missing container is `Ok` with `exists == false`.
    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerInspect>;

    async fn exec(&self, runtime_ref: &str, cmd: &[String]) -> RuntimeResult<ExecOutput>;

    async fn stats(&self, runtime_ref: &str) -> RuntimeResult<ContainerStats>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, runtime_ref: &str, tail: usize) -> RuntimeResult<String>;

    /// Every container carrying the management label, running or not.
    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>>;
}
