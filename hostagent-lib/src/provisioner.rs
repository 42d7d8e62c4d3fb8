//! Makes a running container reachable over SSH.
//!
//! Provisioning runs in the background after create. The provisioner takes
//! the instance lock only to commit its result, so stop and delete are never
//! blocked behind a package install. Before and after every step it re-reads
//! the registry and abandons the work if the instance is gone or now points at
//! another container.

use crate::context::AgentContext;
use crate::ssh;
use hostagent_common::{ExecOutput, Instance, ProvisioningState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const EXCERPT_CHARS: usize = 400;

/// Restored instances whose provisioning never finished are marked failed with
/// this reason.
pub const LOST_ACROSS_RESTART: &str = "provisioning state lost across agent restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Install,
    WriteKeys,
    Configure,
    StartDaemon,
}

const STEPS: [Step; 4] = [
    Step::Install,
    Step::WriteKeys,
    Step::Configure,
    Step::StartDaemon,
];

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::Install => "install openssh-server",
            Step::WriteKeys => "write authorized_keys",
            Step::Configure => "configure sshd",
            Step::StartDaemon => "start sshd",
        }
    }

    fn command(self, instance: &Instance) -> Vec<String> {
        match self {
            Step::Install => ssh::install_command(),
            Step::WriteKeys => ssh::write_keys_command(&instance.ssh_keys),
            Step::Configure => ssh::configure_command(),
            Step::StartDaemon => ssh::start_command(),
        }
    }
}

#[derive(Clone)]
pub struct Provisioner {
    ctx: Arc<AgentContext>,
}

impl Provisioner {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(&self, id: String, runtime_ref: String) -> JoinHandle<Option<ProvisioningState>> {
        let provisioner = self.clone();
        tokio::spawn(async move { provisioner.run(&id, &runtime_ref).await })
    }

    /// Run every step against `runtime_ref`. Returns the committed terminal
    /// state, or `None` when the instance went away underneath.
    #[instrument(skip(self))]
    pub async fn run(&self, id: &str, runtime_ref: &str) -> Option<ProvisioningState> {
        for step in STEPS {
            let Some(instance) = self.current(id, runtime_ref) else {
                debug!(instance_id = %id, "Instance gone, abandoning provisioning");
                return None;
            };

            debug!(instance_id = %id, step = step.label(), "Provisioning step");
            let result = self.ctx.runtime.exec(runtime_ref, &step.command(&instance)).await;

            if self.current(id, runtime_ref).is_none() {
                debug!(instance_id = %id, "Instance gone, abandoning provisioning");
                return None;
            }

            let failure = match result {
                Ok(output) if output.success() => None,
                Ok(output) => Some(format!(
                    "{} exited with code {}: {}",
                    step.label(),
                    output.exit_code,
                    excerpt(&output)
                )),
                Err(e) => Some(format!("{} failed: {e}", step.label())),
            };
            if let Some(reason) = failure {
                return self
                    .finish(id, runtime_ref, ProvisioningState::Failed { reason })
                    .await;
            }
        }
        self.finish(id, runtime_ref, ProvisioningState::Ready).await
    }

    fn current(&self, id: &str, runtime_ref: &str) -> Option<Instance> {
        self.ctx
            .registry
            .get(id)
            .filter(|instance| instance.is_live())
            .filter(|instance| instance.runtime_ref.as_deref() == Some(runtime_ref))
    }

    async fn finish(
        &self,
        id: &str,
        runtime_ref: &str,
        state: ProvisioningState,
    ) -> Option<ProvisioningState> {
        let guard = self.ctx.locks.lock(id).await;
        self.current(id, runtime_ref)?;
        self.ctx
            .registry
            .update(id, |instance| instance.provisioning = state.clone())?;
        self.ctx.provisioning.publish(id, state.clone());
        drop(guard);

        match &state {
            ProvisioningState::Failed { reason } => {
                warn!(instance_id = %id, %reason, "SSH provisioning failed")
            }
            _ => info!(instance_id = %id, "SSH provisioning complete"),
        }
        self.ctx.persist().await;
        Some(state)
    }

    /// Bring sshd back after the container was (re)started. Best effort.
    pub fn spawn_sshd_restart(&self, id: String, runtime_ref: String) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            match ctx.runtime.exec(&runtime_ref, &ssh::restart_command()).await {
                Ok(output) if output.success() => {
                    debug!(instance_id = %id, "sshd restarted")
                }
                Ok(output) => warn!(
                    instance_id = %id,
                    exit_code = output.exit_code,
                    output = %excerpt(&output),
                    "sshd restart failed"
                ),
                Err(e) => warn!(instance_id = %id, error = %e, "sshd restart failed"),
            }
        })
    }
}

/// Tail of the step's output, preferring stderr.
fn excerpt(output: &ExecOutput) -> String {
    let text = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(EXCERPT_CHARS);
    chars[start..].iter().collect()
}
