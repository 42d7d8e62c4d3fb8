use crate::{Result, TelemetryReport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn push(&self, report: &TelemetryReport) -> Result<()>;
}

// Collects every report; used by tests to observe what would have been sent
#[derive(Clone, Default)]
pub struct InMemorySink {
    reports: Arc<RwLock<Vec<TelemetryReport>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<TelemetryReport> {
        self.reports.read().await.clone()
    }

    pub async fn reports_for(&self, instance_id: &str) -> Vec<TelemetryReport> {
        self.reports
            .read()
            .await
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.reports.write().await.clear();
    }
}

#[async_trait]
impl TelemetrySink for InMemorySink {
    async fn push(&self, report: &TelemetryReport) -> Result<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }
}

/// Used when no collector URL is configured.
#[derive(Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn push(&self, report: &TelemetryReport) -> Result<()> {
        info!(
            instance_id = %report.instance_id,
            cpu_pct = report.cpu_pct,
            mem_pct = report.mem_pct,
            status = %report.status,
            "Telemetry report"
        );
        Ok(())
    }
}
