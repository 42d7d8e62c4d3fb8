//! Validation and translation of create requests into runtime terms.

use hostagent_common::{
    image_reference, AgentError, CreateInstanceRequest, PortRequest, ResourceLimits, Result,
    DEFAULT_IMAGE_TAG,
};
use std::collections::{BTreeMap, BTreeSet};

pub const SSH_PORT: u16 = 22;

pub const CPU_CORES_KEY: &str = "QUDATA_CPU_CORES";
pub const MEMORY_GB_KEY: &str = "QUDATA_MEMORY_GB";
pub const GPU_COUNT_KEY: &str = "QUDATA_GPU_COUNT";

const SHELL_OPERATORS: [&str; 8] = ["&&", "||", "|", ";", ">", "<", "$(", "`"];

/// A create request after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSpec {
    pub image: String,
    pub image_tag: String,
    /// `image:tag` as handed to the runtime.
    pub image_reference: String,
    pub storage_gb: u32,
    /// Environment with the reserved resource keys removed.
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub ports: BTreeMap<u16, PortRequest>,
    pub command: Option<String>,
    pub argv: Option<Vec<String>>,
    pub ssh_enabled: bool,
}

pub fn normalize(request: &CreateInstanceRequest) -> Result<NormalizedSpec> {
    let image = request.image.trim();
    if image.is_empty() {
        return Err(AgentError::InvalidSpec("image must not be empty".to_string()));
    }
    if image.chars().any(char::is_whitespace) {
        return Err(AgentError::InvalidSpec(format!(
            "image {image:?} contains whitespace"
        )));
    }

    let image_tag = request
        .image_tag
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_IMAGE_TAG)
        .to_string();

    let mut ports = parse_ports(&request.ports)?;
    if request.ssh_enabled {
        ports.entry(SSH_PORT).or_insert(PortRequest::Auto);
    }

    let (env, limits) = split_resource_keys(&request.env_variables)?;

    let command = request
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let argv = command.as_deref().map(translate_command).transpose()?;

    Ok(NormalizedSpec {
        image_reference: image_reference(image, Some(&image_tag)),
        image: image.to_string(),
        image_tag,
        storage_gb: request.storage_gb,
        env,
        limits,
        ports,
        command,
        argv,
        ssh_enabled: request.ssh_enabled,
    })
}

fn parse_ports(raw: &BTreeMap<String, PortRequest>) -> Result<BTreeMap<u16, PortRequest>> {
    let mut ports = BTreeMap::new();
    let mut fixed = BTreeSet::new();
    for (key, request) in raw {
        let container_port = key
            .trim()
            .trim_end_matches("/tcp")
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                AgentError::InvalidSpec(format!("container port {key:?} is not in 1..=65535"))
            })?;
        if let PortRequest::Fixed(host_port) = request {
            if !fixed.insert(*host_port) {
                return Err(AgentError::InvalidSpec(format!(
                    "host port {host_port} requested for more than one container port"
                )));
            }
        }
        if ports.insert(container_port, *request).is_some() {
            return Err(AgentError::InvalidSpec(format!(
                "container port {container_port} listed twice"
            )));
        }
    }
    Ok(ports)
}

fn split_resource_keys(
    env: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, String>, ResourceLimits)> {
    let mut remaining = env.clone();
    let mut limits = ResourceLimits::default();

    if let Some(raw) = remaining.remove(CPU_CORES_KEY) {
        limits.cpu_cores = Some(parse_positive(CPU_CORES_KEY, &raw)?);
    }
    if let Some(raw) = remaining.remove(MEMORY_GB_KEY) {
        limits.memory_gb = Some(parse_positive(MEMORY_GB_KEY, &raw)?);
    }
    if let Some(raw) = remaining.remove(GPU_COUNT_KEY) {
        let count = raw.trim().parse::<u32>().map_err(|_| {
            AgentError::InvalidSpec(format!("{GPU_COUNT_KEY} must be a whole number, got {raw:?}"))
        })?;
        limits.gpu_count = Some(count);
    }
    Ok((remaining, limits))
}

fn parse_positive(key: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| {
            AgentError::InvalidSpec(format!("{key} must be a positive number, got {raw:?}"))
        })
}

/// Turn a command string into an argv. Anything using shell syntax runs under
/// `sh -c`; plain commands are split with shell quoting rules.
pub fn translate_command(command: &str) -> Result<Vec<String>> {
    if SHELL_OPERATORS.iter().any(|op| command.contains(op)) {
        return Ok(vec!["sh".to_string(), "-c".to_string(), command.to_string()]);
    }
    let argv = shell_words::split(command)
        .map_err(|e| AgentError::InvalidSpec(format!("command {command:?}: {e}")))?;
    if argv.is_empty() {
        return Err(AgentError::InvalidSpec("command is empty".to_string()));
    }
    Ok(argv)
}
