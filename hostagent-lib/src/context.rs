use crate::guarded::GuardedRuntime;
use crate::locks::InstanceLocks;
use crate::ports::PortAllocator;
use crate::registry::InstanceRegistry;
use crate::state::StateStore;
use dashmap::DashMap;
use hostagent_common::{InstanceId, InstanceStatus, ProvisioningState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Published after every successful state change made by the lifecycle
/// controller or the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
}

pub type EventSender = mpsc::UnboundedSender<LifecycleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LifecycleEvent>;

/// Timing knobs of the lifecycle controller that are not runtime call limits.
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// Delay before checking that a freshly started container is still up.
    pub startup_check: Duration,
    /// Lines of container output returned by `get_state(include_logs)`.
    pub logs_tail: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            startup_check: Duration::from_millis(2000),
            logs_tail: 100,
        }
    }
}

/// Per-instance provisioning state channels, so callers can await completion.
#[derive(Default)]
pub struct ProvisioningTracker {
    channels: DashMap<InstanceId, watch::Sender<ProvisioningState>>,
}

impl ProvisioningTracker {
    pub fn publish(&self, id: &str, state: ProvisioningState) {
        match self.channels.get(id) {
            Some(sender) => {
                sender.send_replace(state);
            }
            None => {
                let (sender, _) = watch::channel(state);
                self.channels.insert(id.to_string(), sender);
            }
        }
    }

    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<ProvisioningState>> {
        self.channels.get(id).map(|sender| sender.subscribe())
    }

    /// Closing the channel wakes every waiter of a removed instance.
    pub fn forget(&self, id: &str) {
        self.channels.remove(id);
    }
}

/// Shared state behind every agent component.
pub struct AgentContext {
    pub runtime: GuardedRuntime,
    pub registry: InstanceRegistry,
    pub ports: PortAllocator,
    pub locks: InstanceLocks,
    pub store: StateStore,
    pub provisioning: ProvisioningTracker,
    pub settings: LifecycleSettings,
    events: EventSender,
}

impl AgentContext {
    pub fn new(
        runtime: GuardedRuntime,
        ports: PortAllocator,
        store: StateStore,
        settings: LifecycleSettings,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let context = Arc::new(Self {
            runtime,
            registry: InstanceRegistry::new(),
            ports,
            locks: InstanceLocks::new(),
            store,
            provisioning: ProvisioningTracker::default(),
            settings,
            events,
        });
        (context, receiver)
    }

    pub fn emit(&self, instance_id: &str, status: InstanceStatus) {
        let event = LifecycleEvent {
            instance_id: instance_id.to_string(),
            status,
        };
        if self.events.send(event).is_err() {
            debug!(%instance_id, "No lifecycle event consumer");
        }
    }

    /// Write the current registry to the state file. Failures are logged; the
    /// in-memory registry stays authoritative.
    pub async fn persist(&self) {
        if let Err(e) = self.store.save_with(|| self.registry.list()).await {
            error!(error = %e, "Failed to persist registry");
        }
    }

    /// Drop every trace of an instance that no longer exists in the runtime:
    /// registry entry, host ports and provisioning channel.
    pub fn forget_instance(&self, id: &str) -> Option<hostagent_common::Instance> {
        let removed = self.registry.remove(id)?;
        self.ports.release_all(removed.host_ports());
        self.provisioning.forget(id);
        Some(removed)
    }
}
