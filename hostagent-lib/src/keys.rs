use crate::context::AgentContext;
use crate::ssh;
use hostagent_common::{AgentError, Instance, InstanceStatus, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};

/// Maintains the authorized key set of SSH-provisioned instances. The registry
/// set and the in-container `authorized_keys` file change together: the file is
/// rewritten first and the registry only follows on success.
#[derive(Clone)]
pub struct SshKeyManager {
    ctx: Arc<AgentContext>,
}

impl SshKeyManager {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Returns `false` when an identical key was already present.
    #[instrument(skip(self, pubkey))]
    pub async fn add_key(&self, id: &str, pubkey: &str) -> Result<bool> {
        let key = ssh::parse_public_key(pubkey)?;
        let line = ssh::canonical_line(&key)?;

        let _guard = self.ctx.locks.lock(id).await;
        let instance = self.provisioned(id)?;
        if ssh::find_key(&instance.ssh_keys, &key).is_some() {
            return Ok(false);
        }
        let runtime_ref = running(&instance)?;

        let mut keys = instance.ssh_keys.clone();
        keys.insert(line);
        self.write(id, runtime_ref, keys).await?;
        info!(instance_id = %id, fingerprint = %ssh::fingerprint(&key), "SSH key added");
        Ok(true)
    }

    /// Returns `false` when the key was not present.
    #[instrument(skip(self, pubkey))]
    pub async fn remove_key(&self, id: &str, pubkey: &str) -> Result<bool> {
        let key = ssh::parse_public_key(pubkey)?;

        let _guard = self.ctx.locks.lock(id).await;
        let instance = self.provisioned(id)?;
        let Some(existing) = ssh::find_key(&instance.ssh_keys, &key) else {
            return Ok(false);
        };
        let runtime_ref = running(&instance)?;

        let mut keys = instance.ssh_keys.clone();
        keys.remove(existing);
        self.write(id, runtime_ref, keys).await?;
        info!(instance_id = %id, fingerprint = %ssh::fingerprint(&key), "SSH key removed");
        Ok(true)
    }

    pub async fn list_keys(&self, id: &str) -> Result<Vec<String>> {
        let instance = self.provisioned(id)?;
        Ok(instance.ssh_keys.into_iter().collect())
    }

    fn provisioned(&self, id: &str) -> Result<Instance> {
        let instance = self
            .ctx
            .registry
            .get(id)
            .filter(Instance::is_live)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        if !instance.ssh_enabled || !instance.provisioning.is_ready() {
            return Err(AgentError::SshNotProvisioned(id.to_string()));
        }
        Ok(instance)
    }

    /// Rewrite the file with exactly `keys`, then record them. Caller holds the
    /// instance lock.
    async fn write(&self, id: &str, runtime_ref: &str, keys: BTreeSet<String>) -> Result<()> {
        let output = self
            .ctx
            .runtime
            .exec(runtime_ref, &ssh::write_keys_command(&keys))
            .await?;
        if !output.success() {
            return Err(AgentError::RuntimeRejected(format!(
                "writing authorized_keys exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        self.ctx
            .registry
            .update(id, |instance| instance.ssh_keys = keys)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        self.ctx.persist().await;
        Ok(())
    }
}

fn running(instance: &Instance) -> Result<&str> {
    match (&instance.runtime_ref, instance.status) {
        (Some(runtime_ref), InstanceStatus::Running) => Ok(runtime_ref),
        (_, status) => Err(AgentError::InvalidState(format!(
            "instance {} is {}; keys can only change while it is running",
            instance.id,
            status.as_str()
        ))),
    }
}
