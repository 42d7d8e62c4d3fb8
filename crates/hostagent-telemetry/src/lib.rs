// Host agent telemetry - utilization reports and the sinks that deliver them
use chrono::{DateTime, Utc};
use hostagent_common::{InstanceId, InstanceStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
mod sink;

pub use http::{HttpSink, SECRET_HEADER};
pub use sink::{InMemorySink, LogSink, TelemetrySink};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Collector responded with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Invalid collector configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// One utilization report as pushed to the upstream collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub instance_id: InstanceId,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub status: InstanceStatus,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryReport {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        cpu_pct: f64,
        mem_pct: f64,
        status: InstanceStatus,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            cpu_pct,
            mem_pct,
            status,
            timestamp: Utc::now(),
        }
    }

    /// Zero-utilization report for an instance that is not consuming
    /// resources (stopped, errored or deleted).
    pub fn idle(instance_id: impl Into<InstanceId>, status: InstanceStatus) -> Self {
        Self::new(instance_id, 0.0, 0.0, status)
    }
}
