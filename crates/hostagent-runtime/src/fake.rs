//! In-memory container runtime used by the agent's tests. Supports failure
//! injection, latency and out-of-band state changes (crashes, vanishing
//! containers) so recovery paths can be exercised without a Docker daemon.

use async_trait::async_trait;
use hostagent_common::{
    ContainerInspect, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats,
    ExecOutput, ManagedContainer, RuntimeError, RuntimeResult, MANAGED_LABEL,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    Exec,
    Stats,
    Logs,
    List,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
    exit_code: Option<i64>,
    stats: ContainerStats,
    logs: String,
}

#[derive(Debug, Clone)]
struct ExecRule {
    pattern: String,
    output: ExecOutput,
}

#[derive(Debug, Clone)]
struct ExitOnStart {
    exit_code: i64,
    logs: String,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    one_shot_failures: HashMap<FakeOp, VecDeque<RuntimeError>>,
    sticky_failures: HashMap<FakeOp, RuntimeError>,
    latency: HashMap<FakeOp, Duration>,
    calls: HashMap<FakeOp, usize>,
    exec_log: Vec<(String, Vec<String>)>,
    exec_rules: Vec<ExecRule>,
    exit_on_start: HashMap<String, ExitOnStart>,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call of `op` fails with `err`. Queued failures are consumed in
    /// order.
    pub fn fail_next(&self, op: FakeOp, err: RuntimeError) {
        self.state
            .lock()
            .one_shot_failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Every call of `op` fails with `err` until [`FakeRuntime::clear_failures`].
    pub fn fail_always(&self, op: FakeOp, err: RuntimeError) {
        self.state.lock().sticky_failures.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.one_shot_failures.clear();
        state.sticky_failures.clear();
    }

    /// Delay every call of `op` by `delay` before it takes effect.
    pub fn set_latency(&self, op: FakeOp, delay: Duration) {
        self.state.lock().latency.insert(op, delay);
    }

    pub fn clear_latency(&self) {
        self.state.lock().latency.clear();
    }

    /// Containers created from `image` exit with `exit_code` as soon as they
    /// are started, leaving `logs` behind.
    pub fn exit_on_start(&self, image: &str, exit_code: i64, logs: &str) {
        self.state.lock().exit_on_start.insert(
            image.to_string(),
            ExitOnStart {
                exit_code,
                logs: logs.to_string(),
            },
        );
    }

    /// Execs whose joined command line contains `pattern` return `output`
    /// instead of succeeding silently.
    pub fn on_exec(&self, pattern: &str, output: ExecOutput) {
        self.state.lock().exec_rules.push(ExecRule {
            pattern: pattern.to_string(),
            output,
        });
    }

    /// Remove a container behind the agent's back.
    pub fn vanish(&self, runtime_ref: &str) {
        self.state.lock().containers.remove(runtime_ref);
    }

    /// Make a container exit behind the agent's back.
    pub fn crash(&self, runtime_ref: &str, exit_code: i64) {
        if let Some(container) = self.state.lock().containers.get_mut(runtime_ref) {
            container.state = ContainerState::Exited;
            container.exit_code = Some(exit_code);
        }
    }

    /// Force the observed state of a container.
    pub fn set_state(&self, runtime_ref: &str, new_state: ContainerState) {
        if let Some(container) = self.state.lock().containers.get_mut(runtime_ref) {
            container.state = new_state;
        }
    }

    pub fn set_stats(&self, runtime_ref: &str, stats: ContainerStats) {
        if let Some(container) = self.state.lock().containers.get_mut(runtime_ref) {
            container.stats = stats;
        }
    }

    pub fn set_logs(&self, runtime_ref: &str, logs: &str) {
        if let Some(container) = self.state.lock().containers.get_mut(runtime_ref) {
            container.logs = logs.to_string();
        }
    }

    /// Register a container the agent did not create in this process, as left
    /// behind by a previous agent run.
    pub fn insert_existing(
        &self,
        labels: BTreeMap<String, String>,
        port_bindings: BTreeMap<u16, u16>,
        state: ContainerState,
    ) -> String {
        let mut guard = self.state.lock();
        let runtime_ref = next_ref(&mut guard);
        let spec = ContainerSpec {
            name: runtime_ref.clone(),
            image: labels
                .get(hostagent_common::IMAGE_LABEL)
                .cloned()
                .unwrap_or_else(|| "unknown:latest".to_string()),
            env: BTreeMap::new(),
            port_bindings,
            storage_gb: 0,
            command: None,
            limits: Default::default(),
            labels,
        };
        guard.containers.insert(
            runtime_ref.clone(),
            FakeContainer {
                spec,
                state,
                exit_code: None,
                stats: ContainerStats::default(),
                logs: String::new(),
            },
        );
        runtime_ref
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn state_of(&self, runtime_ref: &str) -> Option<ContainerState> {
        self.state
            .lock()
            .containers
            .get(runtime_ref)
            .map(|container| container.state)
    }

    pub fn spec_of(&self, runtime_ref: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .containers
            .get(runtime_ref)
            .map(|container| container.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Commands executed against `runtime_ref`, oldest first.
    pub fn exec_log(&self, runtime_ref: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .exec_log
            .iter()
            .filter(|(target, _)| target == runtime_ref)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Count the call, sleep for any configured latency, then report an
    /// injected failure if one is armed.
    async fn enter(&self, op: FakeOp) -> RuntimeResult<()> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            state.latency.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state
            .one_shot_failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            debug!(?op, %err, "Injected one-shot failure");
            return Err(err);
        }
        if let Some(err) = state.sticky_failures.get(&op) {
            return Err(err.clone());
        }
        Ok(())
    }
}

fn next_ref(state: &mut FakeState) -> String {
    state.next_id += 1;
    format!("fake{:012x}", state.next_id)
}

fn not_found(runtime_ref: &str) -> RuntimeError {
    RuntimeError::NotFound(runtime_ref.to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.enter(FakeOp::Create).await?;
        let mut state = self.state.lock();
        if state
            .containers
            .values()
            .any(|container| container.spec.name == spec.name)
        {
            return Err(RuntimeError::Rejected(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let runtime_ref = next_ref(&mut state);
        let mut spec = spec.clone();
        spec.labels
            .insert(MANAGED_LABEL.to_string(), "true".to_string());
        state.containers.insert(
            runtime_ref.clone(),
            FakeContainer {
                spec,
                state: ContainerState::Created,
                exit_code: None,
                stats: ContainerStats::default(),
                logs: String::new(),
            },
        );
        Ok(runtime_ref)
    }

    async fn start(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.enter(FakeOp::Start).await?;
        let mut state = self.state.lock();
        let exits = {
            let container = state
                .containers
                .get(runtime_ref)
                .ok_or_else(|| not_found(runtime_ref))?;
            state.exit_on_start.get(&container.spec.image).cloned()
        };
        let container = state
            .containers
            .get_mut(runtime_ref)
            .ok_or_else(|| not_found(runtime_ref))?;
        match exits {
            Some(exit) => {
                container.state = ContainerState::Exited;
                container.exit_code = Some(exit.exit_code);
                container.logs = exit.logs;
            }
            None => {
                container.state = ContainerState::Running;
                container.exit_code = None;
            }
        }
        Ok(())
    }

    async fn stop(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.enter(FakeOp::Stop).await?;
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(runtime_ref)
            .ok_or_else(|| not_found(runtime_ref))?;
        if container.state != ContainerState::Exited {
            container.state = ContainerState::Exited;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove(&self, runtime_ref: &str) -> RuntimeResult<()> {
        self.enter(FakeOp::Remove).await?;
        self.state
            .lock()
            .containers
            .remove(runtime_ref)
            .map(|_| ())
            .ok_or_else(|| not_found(runtime_ref))
    }

    async fn inspect(&self, runtime_ref: &str) -> RuntimeResult<ContainerInspect> {
        self.enter(FakeOp::Inspect).await?;
        Ok(self
            .state
            .lock()
            .containers
            .get(runtime_ref)
            .map(|container| ContainerInspect {
                exists: true,
                state: container.state,
                exit_code: container.exit_code,
            })
            .unwrap_or_else(ContainerInspect::missing))
    }

    async fn exec(&self, runtime_ref: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        self.enter(FakeOp::Exec).await?;
        let mut state = self.state.lock();
        let running = state
            .containers
            .get(runtime_ref)
            .map(|container| container.state == ContainerState::Running)
            .ok_or_else(|| not_found(runtime_ref))?;
        if !running {
            return Err(RuntimeError::Rejected(format!(
                "container {runtime_ref} is not running"
            )));
        }
        state
            .exec_log
            .push((runtime_ref.to_string(), cmd.to_vec()));

        let line = cmd.join(" ");
        Ok(state
            .exec_rules
            .iter()
            .find(|rule| line.contains(&rule.pattern))
            .map(|rule| rule.output.clone())
            .unwrap_or_default())
    }

    async fn stats(&self, runtime_ref: &str) -> RuntimeResult<ContainerStats> {
        self.enter(FakeOp::Stats).await?;
        self.state
            .lock()
            .containers
            .get(runtime_ref)
            .map(|container| container.stats)
            .ok_or_else(|| not_found(runtime_ref))
    }

    async fn logs(&self, runtime_ref: &str, tail: usize) -> RuntimeResult<String> {
        self.enter(FakeOp::Logs).await?;
        let state = self.state.lock();
        let container = state
            .containers
            .get(runtime_ref)
            .ok_or_else(|| not_found(runtime_ref))?;
        let lines: Vec<&str> = container.logs.lines().collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>> {
        self.enter(FakeOp::List).await?;
        let state = self.state.lock();
        let mut managed: Vec<ManagedContainer> = state
            .containers
            .iter()
            .filter(|(_, container)| container.spec.labels.contains_key(MANAGED_LABEL))
            .map(|(runtime_ref, container)| ManagedContainer {
                runtime_ref: runtime_ref.clone(),
                state: container.state,
                labels: container.spec.labels.clone(),
                port_bindings: container.spec.port_bindings.clone(),
            })
            .collect();
        managed.sort_by(|a, b| a.runtime_ref.cmp(&b.runtime_ref));
        Ok(managed)
    }
}
