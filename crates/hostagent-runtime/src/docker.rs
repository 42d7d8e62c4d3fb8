//! Docker implementation of the container runtime contract, on top of bollard.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use hostagent_common::{
    ContainerInspect, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats,
    ExecOutput, ManagedContainer, ResourceLimits, RuntimeError, RuntimeResult, MANAGED_LABEL,
    STORAGE_GB_LABEL,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Keeps a container alive when neither the request nor the image names a
/// process to run.
pub const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Grace period handed to `docker stop` before it kills the workload.
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    enforce_storage_quota: bool,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            enforce_storage_quota: false,
        }
    }

    /// Pass `storage_gb` to the storage driver as a hard `size` option. Only
    /// drivers with quota support (overlay2 on xfs with pquota, devicemapper,
    /// zfs, btrfs) accept it, so it is off by default.
    pub fn with_storage_quota(mut self, enforce: bool) -> Self {
        self.enforce_storage_quota = enforce;
        self
    }

    pub fn connect_local() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("cannot connect to docker: {e}")))?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub async fn ping(&self) -> RuntimeResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_docker_error("ping", e))
    }

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(%image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(|e| match map_docker_error("image pull", e) {
                RuntimeError::NotFound(msg) => RuntimeError::Rejected(msg),
                other => other,
            })?;

        if let Some(err) = progress.iter().find_map(|p| p.error.clone()) {
            return Err(RuntimeError::Rejected(format!("image pull {image}: {err}")));
        }
        info!(%image, "Image pulled");
        Ok(())
    }

    /// True when the image declares neither `Cmd` nor `Entrypoint`.
    async fn image_declares_no_command(&self, image: &str) -> bool {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect
                .config
                .map(|config| {
                    config.cmd.unwrap_or_default().is_empty()
                        && config.entrypoint.unwrap_or_default().is_empty()
                })
                .unwrap_or(true),
            Err(e) => {
                warn!(%image, error = %e, "Image inspect failed, falling back to idle command");
                true
            }
        }
    }

    fn host_config(&self, spec: &ContainerSpec) -> HostConfig {
        let port_bindings = spec
            .port_bindings
            .iter()
            .map(|(container_port, host_port)| {
                (
                    format!("{container_port}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect::<HashMap<_, _>>();

        let storage_opt = (self.enforce_storage_quota && spec.storage_gb > 0)
            .then(|| HashMap::from([("size".to_string(), format!("{}G", spec.storage_gb))]));

        let ResourceLimits {
            cpu_cores,
            memory_gb,
            gpu_count,
        } = &spec.limits;

        HostConfig {
            port_bindings: Some(port_bindings),
            storage_opt,
            nano_cpus: cpu_cores.map(|cores| (cores * 1_000_000_000.0) as i64),
            memory: memory_gb.map(|gb| (gb * 1024.0 * 1024.0 * 1024.0) as i64),
            device_requests: gpu_count.filter(|n| *n > 0).map(|n| {
                vec![DeviceRequest {
                    driver: Some("nvidia".to_string()),
                    count: Some(i64::from(n)),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.ensure_image(&spec.image).await?;

        let cmd = match &spec.command {
            Some(cmd) => Some(cmd.clone()),
            None if self.image_declares_no_command(&spec.image).await => {
                debug!("Image declares no command, using idle placeholder");
                Some(IDLE_COMMAND.iter().map(|s| s.to_string()).collect())
            }
            None => None,
        };

        let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(STORAGE_GB_LABEL.to_string(), spec.storage_gb.to_string());

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(env_list(&spec.env)),
            labels: Some(labels),
            exposed_ports: Some(
                spec.port_bindings
                    .keys()
                    .map(|port| (format!("{port}/tcp"), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(self.host_config(spec)),
            // Shell-default images (bash, sh) exit immediately without a TTY.
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match map_docker_error("container create", e) {
                RuntimeError::NotFound(msg) => RuntimeError::Rejected(msg),
                other => other,
            })?;

        for warning in &created.warnings {
            warn!(container_id = %created.id, %warning, "Docker create warning");
        }
        info!(container_id = %created.id, "Container created");
        Ok(created.id)
    }

    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()> {
        match self
            .docker
            .start_container(runtime_ref, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error("container start", e)),
        }
    }

    async fn stop(&self, runtime_ref: &str) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(runtime_ref, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error("container stop", e)),
        }
    }

    async fn remove(&self, runtime_ref: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(runtime_ref, Some(options))
            .await
            .map_err(|e| map_docker_error("container remove", e))
    }

    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerInspect> {
        match self
            .docker
            .inspect_container(runtime_ref, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                Ok(ContainerInspect {
                    exists: true,
                    state: state
                        .status
                        .map(|s| ContainerState::parse(&s.to_string()))
                        .unwrap_or(ContainerState::Unknown),
                    exit_code: state.exit_code,
                })
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerInspect::missing()),
            Err(e) => Err(map_docker_error("container inspect", e)),
        }
    }

    async fn exec(&self, runtime_ref: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        let exec_config = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(runtime_ref, exec_config)
            .await
            .map_err(|e| map_docker_error("exec create", e))?;

        let start_config = StartExecOptions {
            detach: false,
            tty: false,
            output_capacity: None,
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, Some(start_config))
            .await
            .map_err(|e| map_docker_error("exec start", e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| map_docker_error("exec output", e))? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_docker_error("exec inspect", e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn stats(&self, runtime_ref: &str) -> RuntimeResult<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let stats = self
            .docker
            .stats(runtime_ref, Some(options))
            .next()
            .await
            .ok_or_else(|| RuntimeError::Unavailable("stats stream ended early".to_string()))?
            .map_err(|e| map_docker_error("container stats", e))?;

        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
                .unwrap_or(1)
        });

        Ok(ContainerStats {
            cpu_pct: cpu_percent(
                stats.cpu_stats.cpu_usage.total_usage,
                stats.precpu_stats.cpu_usage.total_usage,
                stats.cpu_stats.system_cpu_usage.unwrap_or(0),
                stats.precpu_stats.system_cpu_usage.unwrap_or(0),
                online_cpus,
            ),
            mem_pct: mem_percent(
                stats.memory_stats.usage.unwrap_or(0),
                stats.memory_stats.limit.unwrap_or(0),
            ),
        })
    }

    async fn logs(&self, runtime_ref: &str, tail: usize) -> RuntimeResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let chunks: Vec<LogOutput> = self
            .docker
            .logs(runtime_ref, Some(options))
            .try_collect()
            .await
            .map_err(|e| map_docker_error("container logs", e))?;

        Ok(chunks.iter().map(|chunk| chunk.to_string()).collect())
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{MANAGED_LABEL}=true")],
            )]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_error("container list", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let runtime_ref = summary.id?;
                let port_bindings = summary
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|port| port.public_port.map(|public| (port.private_port, public)))
                    .collect::<BTreeMap<_, _>>();
                Some(ManagedContainer {
                    runtime_ref,
                    state: summary
                        .state
                        .as_deref()
                        .map(ContainerState::parse)
                        .unwrap_or(ContainerState::Unknown),
                    labels: summary.labels.unwrap_or_default().into_iter().collect(),
                    port_bindings,
                })
            })
            .collect())
    }
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Same formula `docker stats` uses.
pub fn cpu_percent(
    total_usage: u64,
    prev_total_usage: u64,
    system_usage: u64,
    prev_system_usage: u64,
    online_cpus: u64,
) -> f64 {
    let cpu_delta = total_usage.saturating_sub(prev_total_usage) as f64;
    let system_delta = system_usage.saturating_sub(prev_system_usage) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * online_cpus.max(1) as f64 * 100.0
}

pub fn mem_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

/// 404 is "no such object"; other 4xx are permanent refusals; everything else
/// (5xx, socket and timeout failures) is treated as transient.
fn map_docker_error(context: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{context}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) => {
            RuntimeError::Rejected(format!("{context}: {message}"))
        }
        other => RuntimeError::Unavailable(format!("{context}: {other}")),
    }
}
