// Host agent core - instance lifecycle, port allocation, reconciliation,
// SSH provisioning and telemetry over a pluggable container runtime
pub mod agent;
pub mod api_routes;
pub mod api_server;
pub mod config;
pub mod context;
pub mod guarded;
pub mod keys;
pub mod lifecycle;
pub mod locks;
pub mod ports;
pub mod provisioner;
pub mod reconcile;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod ssh;
pub mod state;
pub mod telemetry;

pub use agent::{telemetry_sink, Agent, BootstrapReport};
pub use config::{AgentConfig, ConfigError};
pub use lifecycle::{DeleteOutcome, LifecycleController};
pub use reconcile::{ReconcileReport, Reconciler};
