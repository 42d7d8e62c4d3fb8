//! Host port allocation.
//!
//! The allocator owns the set of host ports bound to live instances. Auto
//! requests get the lowest free port of the configured range; fixed requests
//! are honored verbatim or rejected, never remapped.

use hostagent_common::{AgentError, PortRequest, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, warn};

/// Extra availability check for auto candidates, on top of the allocator's own
/// bookkeeping. Returns `true` when the port is usable.
pub type BindProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Auto candidates rejected by the probe before a pick gives up. Each probe is
/// a blocking bind made while the allocator is locked.
pub const MAX_PROBE_MISSES: usize = 64;

/// Probe that tries to bind the port on all interfaces.
pub fn host_bind_probe() -> BindProbe {
    Arc::new(|port| TcpListener::bind(("0.0.0.0", port)).is_ok())
}

pub struct PortAllocator {
    range: RangeInclusive<u16>,
    bound: Mutex<BTreeSet<u16>>,
    probe: Option<BindProbe>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            bound: Mutex::new(BTreeSet::new()),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: BindProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn range_label(&self) -> String {
        format!("{}-{}", self.range.start(), self.range.end())
    }

    /// Bind a host port for `container_port`.
    pub fn allocate(&self, container_port: u16, request: PortRequest) -> Result<u16> {
        let mut bound = self.bound.lock();
        let host_port = self.pick(&bound, request)?;
        bound.insert(host_port);
        debug!(container_port, host_port, %request, "Allocated host port");
        Ok(host_port)
    }

    /// Allocate every request or none. Fixed ports are taken before auto ones
    /// so an auto pick never lands on a port the same request names.
    pub fn allocate_all(
        &self,
        requests: &BTreeMap<u16, PortRequest>,
    ) -> Result<BTreeMap<u16, u16>> {
        let mut bound = self.bound.lock();
        let mut taken: Vec<u16> = Vec::with_capacity(requests.len());
        let mut allocated = BTreeMap::new();

        let ordered = requests
            .iter()
            .filter(|(_, r)| !r.is_auto())
            .chain(requests.iter().filter(|(_, r)| r.is_auto()));

        for (container_port, request) in ordered {
            match self.pick(&bound, *request) {
                Ok(host_port) => {
                    bound.insert(host_port);
                    taken.push(host_port);
                    allocated.insert(*container_port, host_port);
                }
                Err(err) => {
                    for port in taken {
                        bound.remove(&port);
                    }
                    debug!(container_port, %request, error = %err, "Port allocation rolled back");
                    return Err(err);
                }
            }
        }
        Ok(allocated)
    }

    fn pick(&self, bound: &BTreeSet<u16>, request: PortRequest) -> Result<u16> {
        match request {
            PortRequest::Fixed(port) if bound.contains(&port) => {
                Err(AgentError::PortConflict { port })
            }
            PortRequest::Fixed(port) => Ok(port),
            PortRequest::Auto => {
                let mut candidates = self.range.clone().filter(|port| !bound.contains(port));
                let picked = match &self.probe {
                    None => candidates.next(),
                    Some(probe) => candidates.take(MAX_PROBE_MISSES).find(|port| probe(*port)),
                };
                picked.ok_or_else(|| AgentError::PortExhausted {
                    range: self.range_label(),
                })
            }
        }
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, host_port: u16) {
        if self.bound.lock().remove(&host_port) {
            debug!(host_port, "Released host port");
        }
    }

    pub fn release_all(&self, host_ports: impl IntoIterator<Item = u16>) {
        let mut bound = self.bound.lock();
        for port in host_ports {
            bound.remove(&port);
        }
    }

    /// Mark a port as bound without conflict checking. Used while rebuilding
    /// state at start-up, where the port is already in use.
    pub fn reserve(&self, host_port: u16) {
        if !self.bound.lock().insert(host_port) {
            warn!(host_port, "Host port claimed twice during state rebuild");
        }
    }

    pub fn is_bound(&self, host_port: u16) -> bool {
        self.bound.lock().contains(&host_port)
    }

    pub fn bound(&self) -> Vec<u16> {
        self.bound.lock().iter().copied().collect()
    }
}
