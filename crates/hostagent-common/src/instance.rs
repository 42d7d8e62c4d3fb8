//! Instance data model shared by the lifecycle core and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type InstanceId = String;

/// Default tag applied when neither the image nor the request names one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Error,
    Deleted,
}

impl InstanceStatus {
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host side of a port mapping request: a caller-fixed port or "auto".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortRequest {
    Auto,
    Fixed(u16),
}

impl PortRequest {
    pub fn is_auto(&self) -> bool {
        matches!(self, PortRequest::Auto)
    }
}

impl fmt::Display for PortRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRequest::Auto => f.write_str("auto"),
            PortRequest::Fixed(port) => write!(f, "{port}"),
        }
    }
}

impl FromStr for PortRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(PortRequest::Auto);
        }
        match trimmed.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!(
                "host port must be \"auto\" or a number in 1..=65535, got {s:?}"
            )),
            Ok(port) => Ok(PortRequest::Fixed(port)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPortRequest {
    Number(u64),
    Text(String),
}

impl Serialize for PortRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PortRequest::Auto => serializer.serialize_str("auto"),
            PortRequest::Fixed(port) => serializer.serialize_u16(*port),
        }
    }
}

impl<'de> Deserialize<'de> for PortRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawPortRequest::deserialize(deserializer)? {
            RawPortRequest::Number(n) => u16::try_from(n)
                .ok()
                .filter(|port| *port != 0)
                .map(PortRequest::Fixed)
                .ok_or_else(|| serde::de::Error::custom(format!("host port {n} out of range"))),
            RawPortRequest::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Progress of the post-create SSH enablement task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisioningState {
    NotRequested,
    Pending,
    Ready,
    Failed { reason: String },
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::NotRequested
                | ProvisioningState::Ready
                | ProvisioningState::Failed { .. }
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProvisioningState::Ready)
    }
}

/// Most recent utilization sample taken by the telemetry sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub status: InstanceStatus,
    pub sampled_at: DateTime<Utc>,
}

/// The agent's logical record of one managed workload container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub runtime_ref: Option<String>,
    pub image: String,
    pub image_tag: String,
    pub storage_gb: u32,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub requested_ports: BTreeMap<u16, PortRequest>,
    #[serde(default)]
    pub allocated_ports: BTreeMap<u16, u16>,
    pub command: Option<String>,
    pub ssh_enabled: bool,
    #[serde(default)]
    pub ssh_keys: BTreeSet<String>,
    pub provisioning: ProvisioningState,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_stats: Option<StatsSample>,
}

impl Instance {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.allocated_ports.values().copied()
    }

    /// Full image reference as handed to the runtime.
    pub fn image_reference(&self) -> String {
        image_reference(&self.image, Some(&self.image_tag))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Resolve `image` + optional `tag` into a single reference.
///
/// A tag or digest already embedded in `image` wins; `host:5000/app` is not
/// mistaken for a tagged image.
pub fn image_reference(image: &str, tag: Option<&str>) -> String {
    let image = image.trim();
    let stripped = image.strip_suffix(':').unwrap_or(image);
    let last_segment = stripped.rsplit('/').next().unwrap_or(stripped);
    if stripped.contains('@') || (last_segment.contains(':') && stripped.len() == image.len()) {
        return stripped.to_string();
    }
    let tag = tag
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_IMAGE_TAG);
    format!("{stripped}:{tag}")
}
