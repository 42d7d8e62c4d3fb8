use crate::context::AgentContext;
use crate::provisioner::Provisioner;
use crate::request::{normalize, NormalizedSpec};
use chrono::Utc;
use hostagent_common::{
    AgentError, ContainerSpec, ContainerState, CreateInstanceRequest, CreateInstanceResponse,
    Instance, InstanceAction, InstanceStatus, InstanceView, ProvisioningState, Result,
    RuntimeError, IMAGE_LABEL, INSTANCE_ID_LABEL, SSH_ENABLED_LABEL,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Lines of output attached to a failed startup check.
const STARTUP_LOG_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The id was unknown or already deleted. Reported to callers as success.
    AlreadyGone,
}

pub fn instance_view(instance: &Instance) -> InstanceView {
    InstanceView {
        instance_id: instance.id.clone(),
        runtime_ref: instance.runtime_ref.clone(),
        image: instance.image_reference(),
        status: instance.status,
        allocated_ports: instance.allocated_ports.clone(),
        ssh_enabled: instance.ssh_enabled,
        provisioning: instance.provisioning.clone(),
        last_stats: instance.last_stats.clone(),
        logs: None,
        logs_error: None,
    }
}

/// Drives instance state transitions. Every operation holds the instance's
/// lock for its whole duration; runtime I/O happens under that lock only.
#[derive(Clone)]
pub struct LifecycleController {
    ctx: Arc<AgentContext>,
    provisioner: Provisioner,
}

impl LifecycleController {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let provisioner = Provisioner::new(ctx.clone());
        Self { ctx, provisioner }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    #[instrument(skip(self, request), fields(image = %request.image))]
    pub async fn create(&self, request: CreateInstanceRequest) -> Result<CreateInstanceResponse> {
        let spec = normalize(&request)?;
        let id = Uuid::new_v4().to_string();
        let guard = self.ctx.locks.lock(&id).await;

        let allocated = self.ctx.ports.allocate_all(&spec.ports)?;
        let container = ContainerSpec {
            name: format!("hostagent-{id}"),
            image: spec.image_reference.clone(),
            env: spec.env.clone(),
            port_bindings: allocated.clone(),
            storage_gb: spec.storage_gb,
            command: spec.argv.clone(),
            limits: spec.limits.clone(),
            labels: [
                (INSTANCE_ID_LABEL.to_string(), id.clone()),
                (SSH_ENABLED_LABEL.to_string(), spec.ssh_enabled.to_string()),
                (IMAGE_LABEL.to_string(), spec.image_reference.clone()),
            ]
            .into_iter()
            .collect(),
        };

        let runtime_ref = match self.launch(&container).await {
            Ok(runtime_ref) => runtime_ref,
            Err(e) => {
                self.ctx.ports.release_all(allocated.values().copied());
                self.ctx.locks.forget(&id);
                error!(instance_id = %id, error = %e, "Create failed, ports released");
                return Err(e);
            }
        };

        let instance = new_instance(&id, runtime_ref.clone(), &spec, allocated.clone());
        self.ctx.registry.upsert(instance);
        if spec.ssh_enabled {
            self.ctx
                .provisioning
                .publish(&id, ProvisioningState::Pending);
        }
        drop(guard);

        info!(instance_id = %id, %runtime_ref, ports = ?allocated, "Instance running");
        self.ctx.persist().await;
        self.ctx.emit(&id, InstanceStatus::Running);

        if spec.ssh_enabled {
            self.provisioner.spawn(id.clone(), runtime_ref);
        }

        Ok(CreateInstanceResponse {
            instance_id: id,
            allocated_ports: allocated,
        })
    }

    /// Create and start the container, then make sure it survived start-up.
    /// Leaves nothing behind in the runtime on failure.
    async fn launch(&self, container: &ContainerSpec) -> Result<String> {
        let runtime_ref = self.ctx.runtime.create(container).await?;

        if let Err(e) = self.ctx.runtime.start(&runtime_ref).await {
            self.discard(&runtime_ref).await;
            return Err(e.into());
        }

        let delay = self.ctx.settings.startup_check;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.ctx.runtime.inspect_once(&runtime_ref).await {
            Ok(observed) if !observed.exists => Err(AgentError::RuntimeRejected(
                "container disappeared right after start".to_string(),
            )),
            Ok(observed)
                if matches!(observed.state, ContainerState::Exited | ContainerState::Dead) =>
            {
                let logs = self
                    .ctx
                    .runtime
                    .logs(&runtime_ref, STARTUP_LOG_LINES)
                    .await
                    .unwrap_or_default();
                self.discard(&runtime_ref).await;
                let code = observed
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(AgentError::RuntimeRejected(format!(
                    "container exited during startup with code {code}: {}",
                    logs.trim()
                )))
            }
            Ok(_) => Ok(runtime_ref),
            Err(e) => {
                warn!(%runtime_ref, error = %e, "Startup check failed, assuming container is up");
                Ok(runtime_ref)
            }
        }
    }

    async fn discard(&self, runtime_ref: &str) {
        match self.ctx.runtime.remove(runtime_ref).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => error!(%runtime_ref, error = %e, "Failed to remove container after failed create"),
        }
    }

    /// The instance and its runtime reference, for operations that act on an
    /// existing container.
    fn live_instance(&self, id: &str) -> Result<(Instance, String)> {
        let instance = self
            .ctx
            .registry
            .get(id)
            .filter(Instance::is_live)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        let runtime_ref = instance
            .runtime_ref
            .clone()
            .ok_or_else(|| AgentError::InvalidState(format!("instance {id} has no container")))?;
        Ok((instance, runtime_ref))
    }

    fn set_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        self.ctx
            .registry
            .update(id, |instance| instance.status = status)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }

    async fn committed(&self, id: &str, status: InstanceStatus) {
        self.ctx.persist().await;
        self.ctx.emit(id, status);
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<InstanceStatus> {
        let guard = self.ctx.locks.lock(id).await;
        let (_, runtime_ref) = self.live_instance(id)?;
        self.ctx.runtime.stop(&runtime_ref).await?;
        self.set_status(id, InstanceStatus::Stopped)?;
        drop(guard);

        info!(instance_id = %id, "Instance stopped");
        self.committed(id, InstanceStatus::Stopped).await;
        Ok(InstanceStatus::Stopped)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<InstanceStatus> {
        let guard = self.ctx.locks.lock(id).await;
        let (_, runtime_ref) = self.live_instance(id)?;
        self.ctx.runtime.start(&runtime_ref).await?;
        let instance = self.set_status(id, InstanceStatus::Running)?;
        drop(guard);

        info!(instance_id = %id, "Instance started");
        self.committed(id, InstanceStatus::Running).await;
        if instance.provisioning.is_ready() {
            self.provisioner.spawn_sshd_restart(id.to_string(), runtime_ref);
        }
        Ok(InstanceStatus::Running)
    }

    /// Stop then start without releasing the instance lock in between.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: &str) -> Result<InstanceStatus> {
        let guard = self.ctx.locks.lock(id).await;
        let (_, runtime_ref) = self.live_instance(id)?;

        self.ctx.runtime.stop(&runtime_ref).await?;
        self.set_status(id, InstanceStatus::Stopped)?;
        if let Err(e) = self.ctx.runtime.start(&runtime_ref).await {
            drop(guard);
            warn!(instance_id = %id, error = %e, "Restart stopped the instance but could not start it");
            self.committed(id, InstanceStatus::Stopped).await;
            return Err(e.into());
        }
        let instance = self.set_status(id, InstanceStatus::Running)?;
        drop(guard);

        info!(instance_id = %id, "Instance restarted");
        self.committed(id, InstanceStatus::Running).await;
        if instance.provisioning.is_ready() {
            self.provisioner.spawn_sshd_restart(id.to_string(), runtime_ref);
        }
        Ok(InstanceStatus::Running)
    }

    pub async fn apply(&self, id: &str, action: InstanceAction) -> Result<InstanceStatus> {
        match action {
            InstanceAction::Stop => self.stop(id).await,
            InstanceAction::Start => self.start(id).await,
            InstanceAction::Restart => self.restart(id).await,
        }
    }

    /// Remove the container and forget the instance. Deleting an unknown id
    /// succeeds with [`DeleteOutcome::AlreadyGone`].
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let guard = self.ctx.locks.lock(id).await;
        let Some(instance) = self.ctx.registry.get(id) else {
            debug!(instance_id = %id, "Delete of unknown instance");
            return Ok(DeleteOutcome::AlreadyGone);
        };

        if let Some(runtime_ref) = &instance.runtime_ref {
            match self.ctx.runtime.inspect(runtime_ref).await {
                Ok(observed) if observed.is_running() => {
                    if let Err(e) = self.ctx.runtime.stop(runtime_ref).await {
                        warn!(instance_id = %id, error = %e, "Stop before removal failed, forcing removal");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(instance_id = %id, error = %e, "Inspect before removal failed"),
            }
            match self.ctx.runtime.remove(runtime_ref).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.ctx.forget_instance(id);
        self.ctx.locks.forget(id);
        drop(guard);

        info!(instance_id = %id, ports = ?instance.allocated_ports, "Instance deleted");
        self.committed(id, InstanceStatus::Deleted).await;
        Ok(DeleteOutcome::Deleted)
    }

    /// Registry snapshot, optionally with the tail of the container output.
    /// A failed log fetch is reported in `logs_error` and leaves status alone.
    pub async fn get_state(&self, id: &str, include_logs: bool) -> Result<InstanceView> {
        let instance = self
            .ctx
            .registry
            .get(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        let mut view = instance_view(&instance);

        if include_logs {
            match &instance.runtime_ref {
                Some(runtime_ref) => {
                    match self
                        .ctx
                        .runtime
                        .logs(runtime_ref, self.ctx.settings.logs_tail)
                        .await
                    {
                        Ok(logs) => view.logs = Some(logs),
                        Err(e) => {
                            warn!(instance_id = %id, error = %e, "Log fetch failed");
                            view.logs_error = Some(e.to_string());
                        }
                    }
                }
                None => view.logs_error = Some("instance has no container".to_string()),
            }
        }
        Ok(view)
    }

    pub fn list(&self) -> Vec<InstanceView> {
        self.ctx.registry.list().iter().map(instance_view).collect()
    }

    /// Resolves once provisioning of `id` is `ready` or `failed`. `NotFound`
    /// when the instance is (or gets) deleted first.
    pub async fn wait_provisioned(&self, id: &str) -> Result<ProvisioningState> {
        if let Some(mut rx) = self.ctx.provisioning.subscribe(id) {
            if let Ok(state) = rx.wait_for(ProvisioningState::is_terminal).await {
                return Ok(state.clone());
            }
        }
        self.ctx
            .registry
            .get(id)
            .map(|instance| instance.provisioning)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))
    }
}

fn new_instance(
    id: &str,
    runtime_ref: String,
    spec: &NormalizedSpec,
    allocated_ports: std::collections::BTreeMap<u16, u16>,
) -> Instance {
    let now = Utc::now();
    Instance {
        id: id.to_string(),
        runtime_ref: Some(runtime_ref),
        image: spec.image.clone(),
        image_tag: spec.image_tag.clone(),
        storage_gb: spec.storage_gb,
        env_variables: spec.env.clone(),
        requested_ports: spec.ports.clone(),
        allocated_ports,
        command: spec.command.clone(),
        ssh_enabled: spec.ssh_enabled,
        ssh_keys: BTreeSet::new(),
        provisioning: if spec.ssh_enabled {
            ProvisioningState::Pending
        } else {
            ProvisioningState::NotRequested
        },
        status: InstanceStatus::Running,
        created_at: now,
        updated_at: now,
        last_stats: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, request};
    use hostagent_common::PortRequest;
    use hostagent_runtime::FakeOp;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_create_allocates_and_registers() {
        let h = harness();
        let mut req = request("ubuntu");
        req.ports = BTreeMap::from([
            ("8080".to_string(), PortRequest::Auto),
            ("3000".to_string(), PortRequest::Fixed(3000)),
        ]);
        let created = h.controller.create(req).await.unwrap();
        assert_eq!(created.allocated_ports[&3000], 3000);
        assert_eq!(created.allocated_ports[&8080], 20000);

        let view = h.controller.get_state(&created.instance_id, false).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Running);
        assert_eq!(view.image, "ubuntu:latest");
        assert_eq!(view.provisioning, ProvisioningState::NotRequested);

        let runtime_ref = view.runtime_ref.unwrap();
        let spec = h.runtime.spec_of(&runtime_ref).unwrap();
        assert_eq!(spec.port_bindings, created.allocated_ports);
        assert_eq!(spec.labels[INSTANCE_ID_LABEL], created.instance_id);
    }

    #[tokio::test]
    async fn test_invalid_request_touches_nothing() {
        let h = harness();
        let err = h.controller.create(request("")).await.unwrap_err();
        assert_eq!(err.kind(), hostagent_common::ErrorKind::InvalidSpec);
        assert_eq!(h.runtime.calls(FakeOp::Create), 0);
        assert!(h.ctx.ports.bound().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_failure_rolls_back_ports() {
        let h = harness();
        h.runtime
            .fail_next(FakeOp::Create, RuntimeError::Rejected("manifest unknown".into()));
        let mut req = request("nosuch");
        req.ports = BTreeMap::from([("80".to_string(), PortRequest::Auto)]);
        let err = h.controller.create(req).await.unwrap_err();
        assert!(matches!(err, AgentError::RuntimeRejected(_)));
        assert!(h.ctx.ports.bound().is_empty());
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_removes_container() {
        let h = harness();
        h.runtime
            .fail_next(FakeOp::Start, RuntimeError::Rejected("port is already allocated".into()));
        let mut req = request("ubuntu");
        req.ports = BTreeMap::from([("80".to_string(), PortRequest::Auto)]);
        assert!(h.controller.create(req).await.is_err());
        assert_eq!(h.runtime.container_count(), 0);
        assert!(h.ctx.ports.bound().is_empty());
    }

    #[tokio::test]
    async fn test_container_exiting_at_startup_is_rejected() {
        let h = harness();
        h.runtime
            .exit_on_start("broken:latest", 127, "sh: exec: not found");
        let mut req = request("broken");
        req.ports = BTreeMap::from([("80".to_string(), PortRequest::Auto)]);
        let err = h.controller.create(req).await.unwrap_err();
        match err {
            AgentError::RuntimeRejected(msg) => {
                assert!(msg.contains("127"));
                assert!(msg.contains("not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.runtime.container_count(), 0);
        assert!(h.ctx.ports.bound().is_empty());
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_start_preserves_ports_and_ref() {
        let h = harness();
        let mut req = request("ubuntu");
        req.ports = BTreeMap::from([("22".to_string(), PortRequest::Auto)]);
        let created = h.controller.create(req).await.unwrap();
        let id = created.instance_id;
        let before = h.controller.get_state(&id, false).await.unwrap();

        assert_eq!(h.controller.stop(&id).await.unwrap(), InstanceStatus::Stopped);
        let stopped = h.controller.get_state(&id, false).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(h.ctx.ports.is_bound(created.allocated_ports[&22]));

        assert_eq!(h.controller.start(&id).await.unwrap(), InstanceStatus::Running);
        let after = h.controller.get_state(&id, false).await.unwrap();
        assert_eq!(after.allocated_ports, before.allocated_ports);
        assert_eq!(after.runtime_ref, before.runtime_ref);
        assert_eq!(after.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        h.controller.stop(&id).await.unwrap();
        assert_eq!(h.controller.stop(&id).await.unwrap(), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_failed_stop_leaves_status() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        h.runtime
            .fail_next(FakeOp::Stop, RuntimeError::Rejected("cannot stop".into()));
        assert!(h.controller.stop(&id).await.is_err());
        assert_eq!(
            h.controller.get_state(&id, false).await.unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_restart() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        assert_eq!(
            h.controller.apply(&id, InstanceAction::Restart).await.unwrap(),
            InstanceStatus::Running
        );
        assert_eq!(h.runtime.calls(FakeOp::Stop), 1);
        assert_eq!(h.runtime.calls(FakeOp::Start), 2);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let h = harness();
        assert!(matches!(h.controller.stop("nope").await, Err(AgentError::NotFound(_))));
        assert!(matches!(h.controller.start("nope").await, Err(AgentError::NotFound(_))));
        assert!(matches!(
            h.controller.get_state("nope", true).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_releases_ports() {
        let h = harness();
        let mut req = request("ubuntu");
        req.ports = BTreeMap::from([
            ("22".to_string(), PortRequest::Auto),
            ("3000".to_string(), PortRequest::Fixed(3000)),
        ]);
        let created = h.controller.create(req).await.unwrap();
        let id = created.instance_id;

        assert_eq!(h.controller.delete(&id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(h.controller.delete(&id).await.unwrap(), DeleteOutcome::AlreadyGone);
        assert!(h.ctx.ports.bound().is_empty());
        assert!(h.ctx.registry.is_empty());
        assert_eq!(h.runtime.container_count(), 0);
        assert!(matches!(h.controller.stop(&id).await, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_tolerates_vanished_container() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        let runtime_ref = h.ctx.registry.get(&id).unwrap().runtime_ref.unwrap();
        h.runtime.vanish(&runtime_ref);
        assert_eq!(h.controller.delete(&id).await.unwrap(), DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_instance() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        h.runtime
            .fail_next(FakeOp::Remove, RuntimeError::Rejected("removal in progress".into()));
        assert!(h.controller.delete(&id).await.is_err());
        assert!(h.ctx.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_logs_failure_degrades() {
        let h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        let runtime_ref = h.ctx.registry.get(&id).unwrap().runtime_ref.unwrap();
        h.runtime.set_logs(&runtime_ref, "line one\nline two");

        let view = h.controller.get_state(&id, true).await.unwrap();
        assert_eq!(view.logs.as_deref(), Some("line one\nline two"));

        h.runtime
            .fail_next(FakeOp::Logs, RuntimeError::Unavailable("daemon busy".into()));
        let view = h.controller.get_state(&id, true).await.unwrap();
        assert!(view.logs.is_none());
        assert!(view.logs_error.unwrap().contains("daemon busy"));
        assert_eq!(view.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_emitted() {
        let mut h = harness();
        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        h.controller.stop(&id).await.unwrap();
        h.controller.delete(&id).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            assert_eq!(event.instance_id, id);
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                InstanceStatus::Running,
                InstanceStatus::Stopped,
                InstanceStatus::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn test_list_returns_all() {
        let h = harness();
        h.controller.create(request("ubuntu")).await.unwrap();
        h.controller.create(request("alpine")).await.unwrap();
        assert_eq!(h.controller.list().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_lock_entries() {
        let h = harness();
        let keys = crate::keys::SshKeyManager::new(h.ctx.clone());
        let key = crate::ssh::tests::generate_key("ops@bastion");
        for i in 0..200 {
            let id = format!("ghost-{i}");
            assert_eq!(
                h.controller.delete(&id).await.unwrap(),
                DeleteOutcome::AlreadyGone
            );
            assert!(h.controller.stop(&id).await.is_err());
            assert!(h.controller.start(&id).await.is_err());
            assert!(h.controller.restart(&id).await.is_err());
            assert!(keys.add_key(&id, &key).await.is_err());
            assert!(keys.remove_key(&id, &key).await.is_err());
        }
        assert!(h.ctx.locks.is_empty());

        let id = h.controller.create(request("ubuntu")).await.unwrap().instance_id;
        h.controller.stop(&id).await.unwrap();
        assert!(h.ctx.locks.is_empty());
        h.controller.delete(&id).await.unwrap();
        assert!(h.ctx.locks.is_empty());
    }
}
