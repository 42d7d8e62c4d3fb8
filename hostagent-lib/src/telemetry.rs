use crate::context::{AgentContext, EventReceiver, LifecycleEvent};
use futures::future::join_all;
use hostagent_common::{InstanceStatus, StatsSample};
use hostagent_telemetry::{TelemetryReport, TelemetrySink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Samples utilization of registered instances and hands reports to a sink.
///
/// Pushes never block sampling: each report is delivered on its own task and
/// delivery errors are only logged.
#[derive(Clone)]
pub struct TelemetrySampler {
    ctx: Arc<AgentContext>,
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetrySampler {
    pub fn new(ctx: Arc<AgentContext>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { ctx, sink }
    }

    /// Periodic pass. Instances whose lock is held by a lifecycle operation are
    /// skipped until the next tick. Instances are sampled concurrently, so a
    /// slow stats call delays only its own report.
    pub async fn sample_all(&self) -> Vec<TelemetryReport> {
        let ids = self.ctx.registry.ids();
        let samples = ids.iter().map(|id| async move {
            let Some(_guard) = self.ctx.locks.try_lock(id) else {
                debug!(instance_id = %id, "Instance busy, skipping sample");
                return None;
            };
            self.sample(id).await
        });
        join_all(samples).await.into_iter().flatten().collect()
    }

    /// Immediate report after a lifecycle change.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Option<TelemetryReport> {
        if event.status == InstanceStatus::Deleted {
            let report = TelemetryReport::idle(&event.instance_id, InstanceStatus::Deleted);
            self.deliver(report.clone());
            return Some(report);
        }
        let _guard = self.ctx.locks.lock(&event.instance_id).await;
        self.sample(&event.instance_id).await
    }

    /// Caller holds the instance lock. The report carries the registry status;
    /// correcting drift against the runtime is left to the reconciler.
    async fn sample(&self, id: &str) -> Option<TelemetryReport> {
        let instance = self.ctx.registry.get(id)?;
        let report = match (instance.status, &instance.runtime_ref) {
            (InstanceStatus::Running, Some(runtime_ref)) => {
                match self.ctx.runtime.stats(runtime_ref).await {
                    Ok(stats) => {
                        TelemetryReport::new(id, stats.cpu_pct, stats.mem_pct, instance.status)
                    }
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Stats sample failed");
                        return None;
                    }
                }
            }
            (status, _) => TelemetryReport::idle(id, status),
        };

        let sample = StatsSample {
            cpu_pct: report.cpu_pct,
            mem_pct: report.mem_pct,
            status: report.status,
            sampled_at: report.timestamp,
        };
        self.ctx
            .registry
            .update(id, |instance| instance.last_stats = Some(sample));
        self.deliver(report.clone());
        Some(report)
    }

    fn deliver(&self, report: TelemetryReport) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.push(&report).await {
                warn!(instance_id = %report.instance_id, error = %e, "Telemetry push failed");
            }
        });
    }

    /// Consume lifecycle events until cancelled or every sender is gone.
    pub async fn run_events(self, mut events: EventReceiver, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let sampler = self.clone();
                        tokio::spawn(async move { sampler.handle_event(event).await });
                    }
                    None => break,
                },
            }
        }
        debug!("Lifecycle event consumer stopped");
    }
}
