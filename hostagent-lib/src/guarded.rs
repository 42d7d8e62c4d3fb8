//! Bounded access to the container runtime.
//!
//! Every call is wrapped in a timeout; expiry becomes `Unavailable`.
//! Idempotent calls are retried with exponential backoff while the runtime
//! reports itself unavailable.

use hostagent_common::{
    ContainerInspect, ContainerRuntime, ContainerSpec, ContainerStats, ExecOutput,
    ManagedContainer, RuntimeError, RuntimeResult,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

const BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct RuntimeLimits {
    pub call_timeout: Duration,
    pub create_timeout: Duration,
    pub exec_timeout: Duration,
    pub attempts: u32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(600),
            exec_timeout: Duration::from_secs(600),
            attempts: 3,
        }
    }
}

#[derive(Clone)]
pub struct GuardedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    limits: RuntimeLimits,
}

impl GuardedRuntime {
    pub fn new(inner: Arc<dyn ContainerRuntime>, limits: RuntimeLimits) -> Self {
        Self { inner, limits }
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    async fn bounded<T, Fut>(op: &str, limit: Duration, fut: Fut) -> RuntimeResult<T>
    where
        Fut: Future<Output = RuntimeResult<T>>,
    {
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Unavailable(format!(
                "{op} timed out after {}s",
                limit.as_secs_f64()
            ))),
        }
    }

    async fn retrying<T, F, Fut>(&self, op: &str, mut call: F) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let attempts = self.limits.attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::bounded(op, self.limits.call_timeout, call()).await {
                Err(RuntimeError::Unavailable(msg)) if attempt < attempts => {
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(op, attempt, error = %msg, ?backoff, "Runtime unavailable, retrying");
                    sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Not retried: a timed-out create may still complete in the background.
    pub async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        Self::bounded("create", self.limits.create_timeout, self.inner.create(spec)).await
    }

    pub async fn start(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.retrying("start", || self.inner.start(runtime_ref)).await
    }

    pub async fn stop(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.retrying("stop", || self.inner.stop(runtime_ref)).await
    }

    pub async fn remove(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.retrying("remove", || self.inner.remove(runtime_ref)).await
    }

    pub async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerInspect> {
        self.retrying("inspect", || self.inner.inspect(runtime_ref)).await
    }

    /// Single bounded attempt, for periodic callers that retry next cycle.
    pub async fn inspect_once(&self, runtime_ref: &str) -> RuntimeResult<ContainerInspect> {
        Self::bounded("inspect", self.limits.call_timeout, self.inner.inspect(runtime_ref)).await
    }

    /// Not retried: exec'd commands are not assumed idempotent.
    pub async fn exec(&self, runtime_ref: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        Self::bounded("exec", self.limits.exec_timeout, self.inner.exec(runtime_ref, cmd)).await
    }

    pub async fn stats(&self, runtime_ref: &str) -> RuntimeResult<ContainerStats> {
        Self::bounded("stats", self.limits.call_timeout, self.inner.stats(runtime_ref)).await
    }

    pub async fn logs(&self, runtime_ref: &str, tail: usize) -> RuntimeResult<String> {
        Self::bounded("logs", self.limits.call_timeout, self.inner.logs(runtime_ref, tail)).await
    }

    pub async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>> {
        self.retrying("list", || self.inner.list_managed()).await
    }
}
