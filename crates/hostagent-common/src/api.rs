use crate::instance::{InstanceId, InstanceStatus, PortRequest, ProvisioningState, StatsSample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of a create request. Port keys stay raw strings here; the lifecycle
/// controller validates them so malformed keys surface as `InvalidSpec`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub image: String,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub storage_gb: u32,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<String, PortRequest>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    pub instance_id: InstanceId,
    pub allocated_ports: BTreeMap<u16, u16>,
}

/// Read-only snapshot returned by `getState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance_id: InstanceId,
    pub runtime_ref: Option<String>,
    pub image: String,
    pub status: InstanceStatus,
    pub allocated_ports: BTreeMap<u16, u16>,
    pub ssh_enabled: bool,
    pub provisioning: ProvisioningState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stats: Option<StatsSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Stop,
    Start,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageInstanceRequest {
    pub action: InstanceAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyRequest {
    pub ssh_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeysResponse {
    pub keys: Vec<String>,
}
