mod common;

use common::{agent, public_key, request, RANGE_START};
use hostagent_common::{AgentError, InstanceStatus, PortRequest, ProvisioningState};
use std::collections::{BTreeMap, BTreeSet};

fn auto_ports(keys: &[&str]) -> BTreeMap<String, PortRequest> {
    keys.iter()
        .map(|k| (k.to_string(), PortRequest::Auto))
        .collect()
}

/// Host ports across the registry, asserting none is bound twice.
fn assert_unique_ports(t: &common::TestAgent) -> BTreeSet<u16> {
    let mut seen = BTreeSet::new();
    for view in t.agent.controller().list() {
        for host_port in view.allocated_ports.values() {
            assert!(seen.insert(*host_port), "host port {host_port} bound twice");
        }
    }
    let allocator: BTreeSet<u16> = t.agent.context().ports.bound().into_iter().collect();
    assert_eq!(seen, allocator);
    seen
}

#[tokio::test]
async fn test_ports_never_duplicated_across_create_delete_sequences() {
    let t = agent();
    let controller = t.agent.controller();
    let mut live = Vec::new();

    // Deterministic mix of creates and deletes that keeps reusing freed ports.
    for round in 0..24u32 {
        if round % 3 == 2 && !live.is_empty() {
            let victim: String = live.remove((round as usize * 7) % live.len());
            controller.delete(&victim).await.unwrap();
        } else {
            let container_ports: &[&str] = if round % 2 == 0 {
                &["80"]
            } else {
                &["80", "443"]
            };
            let mut req = request("ubuntu");
            req.ports = auto_ports(container_ports);
            match controller.create(req).await {
                Ok(created) => live.push(created.instance_id),
                Err(AgentError::PortExhausted { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_unique_ports(&t);
    }
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let t = agent();
    let creates = (0..8).map(|_| {
        let controller = t.agent.controller().clone();
        async move {
            let mut req = request("ubuntu");
            req.ports = auto_ports(&["8080"]);
            controller.create(req).await
        }
    });
    let results = futures::future::join_all(creates).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(assert_unique_ports(&t).len(), 8);
}

#[tokio::test]
async fn test_fixed_port_conflict_leaves_no_trace() {
    let t = agent();
    let controller = t.agent.controller();
    let mut first = request("ubuntu");
    first.ports = BTreeMap::from([("3000".to_string(), PortRequest::Fixed(3000))]);
    controller.create(first).await.unwrap();
    let bound_before = t.agent.context().ports.bound();

    let mut second = request("ubuntu");
    second.ports = BTreeMap::from([
        ("22".to_string(), PortRequest::Auto),
        ("3000".to_string(), PortRequest::Fixed(3000)),
    ]);
    let err = controller.create(second).await.unwrap_err();
    assert_eq!(err, AgentError::PortConflict { port: 3000 });
    assert_eq!(controller.list().len(), 1);
    assert_eq!(t.agent.context().ports.bound(), bound_before);
}

#[tokio::test]
async fn test_two_auto_requests_get_distinct_ports() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("nginx");
    req.ports = auto_ports(&["8080"]);

    let a = controller.create(req.clone()).await.unwrap();
    let b = controller.create(req).await.unwrap();
    assert_eq!(a.allocated_ports[&8080], RANGE_START);
    assert_eq!(b.allocated_ports[&8080], RANGE_START + 1);
}

#[tokio::test]
async fn test_auto_range_exhaustion() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("ubuntu");
    req.ports = auto_ports(&["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]);
    controller.create(req.clone()).await.unwrap();

    req.ports = auto_ports(&["80"]);
    assert!(matches!(
        controller.create(req).await,
        Err(AgentError::PortExhausted { .. })
    ));
    assert_eq!(controller.list().len(), 1);
}

#[tokio::test]
async fn test_delete_twice_releases_everything() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("ubuntu");
    req.ports = BTreeMap::from([
        ("22".to_string(), PortRequest::Auto),
        ("3000".to_string(), PortRequest::Fixed(3000)),
    ]);
    let created = controller.create(req.clone()).await.unwrap();

    controller.delete(&created.instance_id).await.unwrap();
    controller.delete(&created.instance_id).await.unwrap();
    assert!(t.agent.context().ports.bound().is_empty());
    assert!(controller.list().is_empty());

    // The same fixed port is available again.
    let again = controller.create(req).await.unwrap();
    assert_eq!(again.allocated_ports[&3000], 3000);
}

#[tokio::test]
async fn test_stop_start_preserves_identity() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("ubuntu");
    req.ports = auto_ports(&["22", "80"]);
    let id = controller.create(req).await.unwrap().instance_id;
    let before = controller.get_state(&id, false).await.unwrap();

    controller.stop(&id).await.unwrap();
    controller.start(&id).await.unwrap();
    let after = controller.get_state(&id, false).await.unwrap();

    assert_eq!(after.allocated_ports, before.allocated_ports);
    assert_eq!(after.runtime_ref, before.runtime_ref);
    assert_eq!(after.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_vanished_container_is_dropped_by_reconcile() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("ubuntu");
    req.ports = auto_ports(&["80"]);
    let created = controller.create(req).await.unwrap();
    let view = controller.get_state(&created.instance_id, false).await.unwrap();

    t.runtime.vanish(&view.runtime_ref.unwrap());
    let report = t.agent.reconciler().run_once().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(controller.list().is_empty());
    assert!(!t.agent.context().ports.is_bound(created.allocated_ports[&80]));
    assert!(matches!(
        controller.get_state(&created.instance_id, false).await,
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_add_key_twice_lists_once() {
    let t = agent();
    let controller = t.agent.controller();
    let mut req = request("ubuntu");
    req.ssh_enabled = true;
    let id = controller.create(req).await.unwrap().instance_id;
    assert_eq!(
        controller.wait_provisioned(&id).await.unwrap(),
        ProvisioningState::Ready
    );

    let key = public_key("ops@bastion");
    assert!(t.agent.keys().add_key(&id, &key).await.unwrap());
    assert!(!t.agent.keys().add_key(&id, &key).await.unwrap());
    assert_eq!(t.agent.keys().list_keys(&id).await.unwrap(), vec![key]);
}
