use crate::config::AgentConfig;
use crate::context::{AgentContext, EventReceiver, LifecycleSettings};
use crate::guarded::{GuardedRuntime, RuntimeLimits};
use crate::keys::SshKeyManager;
use crate::lifecycle::LifecycleController;
use crate::ports::{host_bind_probe, PortAllocator};
use crate::provisioner::LOST_ACROSS_RESTART;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::scheduler::spawn_periodic;
use crate::state::StateStore;
use crate::telemetry::TelemetrySampler;
use chrono::Utc;
use hostagent_common::{
    ContainerRuntime, ContainerState, Instance, InstanceStatus, ManagedContainer, PortRequest,
    ProvisioningState, Result, DEFAULT_IMAGE_TAG, IMAGE_LABEL, SSH_ENABLED_LABEL, STORAGE_GB_LABEL,
};
use hostagent_telemetry::{HttpSink, LogSink, TelemetryError, TelemetrySink};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What start-up recovered before serving requests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub restored: usize,
    pub adopted: usize,
    pub reconcile: Option<ReconcileReport>,
}

/// Sink for the configured collector, or a log-only sink when none is set.
pub fn telemetry_sink(
    config: &AgentConfig,
) -> std::result::Result<Arc<dyn TelemetrySink>, TelemetryError> {
    match &config.telemetry_url {
        Some(url) => Ok(Arc::new(HttpSink::new(url, config.telemetry_secret.clone())?)),
        None => Ok(Arc::new(LogSink)),
    }
}

/// Every agent component wired over one shared context.
pub struct Agent {
    config: AgentConfig,
    ctx: Arc<AgentContext>,
    controller: LifecycleController,
    keys: SshKeyManager,
    reconciler: Arc<Reconciler>,
    sampler: TelemetrySampler,
    events: Mutex<Option<EventReceiver>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let limits = RuntimeLimits {
            call_timeout: config.runtime_timeout,
            create_timeout: config.create_timeout,
            exec_timeout: config.provision_timeout,
            attempts: config.runtime_retries,
        };
        let mut ports = PortAllocator::new(config.port_range_start..=config.port_range_end);
        if config.probe_host_ports {
            ports = ports.with_probe(host_bind_probe());
        }
        let settings = LifecycleSettings {
            startup_check: config.startup_check,
            ..Default::default()
        };

        let (ctx, events) = AgentContext::new(
            GuardedRuntime::new(runtime, limits),
            ports,
            StateStore::new(config.state_file.clone()),
            settings,
        );

        Self {
            controller: LifecycleController::new(ctx.clone()),
            keys: SshKeyManager::new(ctx.clone()),
            reconciler: Arc::new(Reconciler::new(ctx.clone())),
            sampler: TelemetrySampler::new(ctx.clone(), sink),
            events: Mutex::new(Some(events)),
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn keys(&self) -> &SshKeyManager {
        &self.keys
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    /// Rebuild state before serving: restore the persisted registry, seed the
    /// port allocator, adopt managed containers the registry does not know
    /// and run one reconciliation pass.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        for mut instance in self.ctx.store.load().await? {
            if instance.provisioning == ProvisioningState::Pending {
                instance.provisioning = ProvisioningState::Failed {
                    reason: LOST_ACROSS_RESTART.to_string(),
                };
            }
            for port in instance.host_ports() {
                self.ctx.ports.reserve(port);
            }
            if instance.ssh_enabled {
                self.ctx
                    .provisioning
                    .publish(&instance.id, instance.provisioning.clone());
            }
            self.ctx.registry.upsert(instance);
            report.restored += 1;
        }
        self.ctx.ports.reserve(self.config.api_port);

        for container in self.ctx.runtime.list_managed().await? {
            if self
                .ctx
                .registry
                .find_by_runtime_ref(&container.runtime_ref)
                .is_some()
            {
                continue;
            }
            let instance = adopted_instance(&container);
            if self.ctx.registry.contains(&instance.id) {
                warn!(
                    instance_id = %instance.id,
                    runtime_ref = %container.runtime_ref,
                    "Managed container claims an id already bound to another container, ignoring"
                );
                continue;
            }
            for port in instance.host_ports() {
                self.ctx.ports.reserve(port);
            }
            if instance.ssh_enabled {
                self.ctx
                    .provisioning
                    .publish(&instance.id, instance.provisioning.clone());
            }
            info!(instance_id = %instance.id, runtime_ref = %container.runtime_ref, "Adopted managed container");
            self.ctx.registry.upsert(instance);
            report.adopted += 1;
        }

        self.ctx.persist().await;
        report.reconcile = self.reconciler.run_once().await;
        info!(
            restored = report.restored,
            adopted = report.adopted,
            "Agent state rebuilt"
        );
        Ok(report)
    }

    /// Start the reconciliation loop, the telemetry loop and the lifecycle
    /// event consumer. They all stop when `token` is cancelled.
    pub fn start_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let reconciler = self.reconciler.clone();
        handles.push(spawn_periodic(
            "reconcile",
            self.config.reconcile_interval,
            token.clone(),
            move || {
                let reconciler = reconciler.clone();
                async move {
                    reconciler.run_once().await;
                }
            },
        ));

        let sampler = self.sampler.clone();
        handles.push(spawn_periodic(
            "telemetry",
            self.config.telemetry_interval,
            token.clone(),
            move || {
                let sampler = sampler.clone();
                async move {
                    sampler.sample_all().await;
                }
            },
        ));

        match self.events.lock().take() {
            Some(events) => {
                handles.push(tokio::spawn(self.sampler.clone().run_events(events, token)));
            }
            None => warn!("Lifecycle event consumer already started"),
        }
        handles
    }
}

/// Registry entry for a managed container found in the runtime. Identity and
/// configuration come from the labels written at create time.
fn adopted_instance(container: &ManagedContainer) -> Instance {
    let id = container
        .instance_id()
        .map(str::to_string)
        .unwrap_or_else(|| container.runtime_ref.chars().take(12).collect());
    let label = |key: &str| container.labels.get(key).map(String::as_str);
    let ssh_enabled = label(SSH_ENABLED_LABEL) == Some("true");
    let status = match container.state {
        ContainerState::Running => InstanceStatus::Running,
        ContainerState::Dead => InstanceStatus::Error,
        _ => InstanceStatus::Stopped,
    };
    let now = Utc::now();

    Instance {
        id,
        runtime_ref: Some(container.runtime_ref.clone()),
        image: label(IMAGE_LABEL).unwrap_or_default().to_string(),
        image_tag: DEFAULT_IMAGE_TAG.to_string(),
        storage_gb: label(STORAGE_GB_LABEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        env_variables: Default::default(),
        requested_ports: container
            .port_bindings
            .iter()
            .map(|(container_port, host_port)| (*container_port, PortRequest::Fixed(*host_port)))
            .collect(),
        allocated_ports: container.port_bindings.clone(),
        command: None,
        ssh_enabled,
        ssh_keys: BTreeSet::new(),
        provisioning: if ssh_enabled {
            ProvisioningState::Failed {
                reason: LOST_ACROSS_RESTART.to_string(),
            }
        } else {
            ProvisioningState::NotRequested
        },
        status,
        created_at: now,
        updated_at: now,
        last_stats: None,
    }
}
