//! Periodic convergence of the registry toward what the runtime reports.
//!
//! Each pass inspects every registered instance under its lock. Instances are
//! handled concurrently so one slow container does not hold up the rest, and
//! a failure on one instance is logged and retried next pass.

use crate::context::AgentContext;
use futures::future::join_all;
use hostagent_common::{ContainerState, InstanceStatus};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Updated,
    Removed,
    Failed,
}

/// Status the registry should hold given what the runtime observed, or `None`
/// when the observation does not warrant a change.
pub fn corrected_status(
    current: InstanceStatus,
    observed: ContainerState,
) -> Option<InstanceStatus> {
    use ContainerState as C;
    use InstanceStatus as S;

    let corrected = match (current, observed) {
        (S::Running, C::Exited) | (_, C::Dead) => S::Error,
        (S::Stopped | S::Error | S::Pending, C::Running) => S::Running,
        (S::Running, C::Paused) => S::Stopped,
        _ => return None,
    };
    (corrected != current).then_some(corrected)
}

pub struct Reconciler {
    ctx: Arc<AgentContext>,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
        }
    }

    /// One pass over the registry. Returns `None` if another pass is still in
    /// progress.
    pub async fn run_once(&self) -> Option<ReconcileReport> {
        let Ok(_pass) = self.running.try_lock() else {
            debug!("Reconciliation already in progress, skipping");
            return None;
        };

        let ids = self.ctx.registry.ids();
        let outcomes = join_all(ids.iter().map(|id| self.reconcile_instance(id))).await;

        let mut report = ReconcileReport {
            checked: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Updated => report.updated += 1,
                Outcome::Removed => report.removed += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        if report.updated + report.removed + report.failed > 0 {
            info!(?report, "Reconciliation pass complete");
        } else {
            debug!(checked = report.checked, "Reconciliation pass complete");
        }
        Some(report)
    }

    async fn reconcile_instance(&self, id: &str) -> Outcome {
        let guard = self.ctx.locks.lock(id).await;
        let Some(instance) = self.ctx.registry.get(id) else {
            return Outcome::Unchanged;
        };
        let Some(runtime_ref) = instance.runtime_ref.clone() else {
            return Outcome::Unchanged;
        };

        let observed = match self.ctx.runtime.inspect_once(&runtime_ref).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(instance_id = %id, error = %e, "Reconcile inspect failed");
                return Outcome::Failed;
            }
        };

        if !observed.exists {
            warn!(instance_id = %id, %runtime_ref, "Container no longer exists, dropping instance");
            self.ctx.forget_instance(id);
            self.ctx.locks.forget(id);
            drop(guard);
            self.ctx.persist().await;
            self.ctx.emit(id, InstanceStatus::Deleted);
            return Outcome::Removed;
        }

        let Some(status) = corrected_status(instance.status, observed.state) else {
            return Outcome::Unchanged;
        };
        self.ctx
            .registry
            .update(id, |instance| instance.status = status);
        drop(guard);

        info!(
            instance_id = %id,
            from = instance.status.as_str(),
            to = status.as_str(),
            state = ?observed.state,
            exit_code = ?observed.exit_code,
            "Corrected instance status"
        );
        self.ctx.persist().await;
        self.ctx.emit(id, status);
        Outcome::Updated
    }
}
