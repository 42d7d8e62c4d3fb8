mod common;

use common::{agent, agent_with, persistent_config, request, test_config, RANGE_START};
use hostagent_common::{
    AgentError, ContainerState, ContainerStats, InstanceStatus, PortRequest, ProvisioningState,
    IMAGE_LABEL, INSTANCE_ID_LABEL, MANAGED_LABEL, SSH_ENABLED_LABEL,
};
use hostagent_lib::provisioner::LOST_ACROSS_RESTART;
use hostagent_runtime::{FakeOp, FakeRuntime};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_delete_during_provisioning_wins() {
    let t = agent();
    t.runtime.set_latency(FakeOp::Exec, Duration::from_millis(200));
    let controller = t.agent.controller();

    let mut req = request("ubuntu");
    req.ssh_enabled = true;
    let created = controller.create(req).await.unwrap();
    let id = created.instance_id;

    let waiter = {
        let controller = controller.clone();
        let id = id.clone();
        tokio::spawn(async move { controller.wait_provisioned(&id).await })
    };

    // The first provisioning step is now in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.runtime.calls(FakeOp::Exec), 1);

    controller.delete(&id).await.unwrap();
    assert!(matches!(waiter.await.unwrap(), Err(AgentError::NotFound(_))));

    // Let the in-flight exec finish; the provisioner must not resurrect anything.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(controller.list().is_empty());
    assert!(t.agent.context().ports.bound().is_empty());
    assert_eq!(t.runtime.container_count(), 0);
    assert_eq!(t.runtime.calls(FakeOp::Exec), 1);
}

#[tokio::test]
async fn test_crashed_container_is_marked_error() {
    let t = agent();
    let controller = t.agent.controller();
    let id = controller.create(request("ubuntu")).await.unwrap().instance_id;
    let runtime_ref = controller
        .get_state(&id, false)
        .await
        .unwrap()
        .runtime_ref
        .unwrap();

    t.runtime.crash(&runtime_ref, 137);
    let report = t.agent.reconciler().run_once().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(
        controller.get_state(&id, false).await.unwrap().status,
        InstanceStatus::Error
    );

    // An out-of-band restart brings it back.
    t.runtime.set_state(&runtime_ref, ContainerState::Running);
    let report = t.agent.reconciler().run_once().await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(
        controller.get_state(&id, false).await.unwrap().status,
        InstanceStatus::Running
    );

    let report = t.agent.reconciler().run_once().await.unwrap();
    assert_eq!(report.unchanged, 1);
}

#[tokio::test]
async fn test_reconcile_isolates_runtime_failures() {
    let t = agent();
    let controller = t.agent.controller();
    controller.create(request("ubuntu")).await.unwrap();
    controller.create(request("alpine")).await.unwrap();

    t.runtime.fail_next(
        FakeOp::Inspect,
        hostagent_common::RuntimeError::Unavailable("connection reset".into()),
    );
    let report = t.agent.reconciler().run_once().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(controller.list().len(), 2);
}

#[tokio::test]
async fn test_restart_restores_registry_and_ports() {
    let dir = tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let runtime = FakeRuntime::new();

    let first = agent_with(persistent_config(state_file.clone()), runtime.clone());
    first.agent.bootstrap().await.unwrap();
    let mut req = request("ubuntu");
    req.ports = BTreeMap::from([
        ("80".to_string(), PortRequest::Auto),
        ("3000".to_string(), PortRequest::Fixed(3000)),
    ]);
    let kept = first.agent.controller().create(req).await.unwrap();
    let doomed = first
        .agent
        .controller()
        .create(request("alpine"))
        .await
        .unwrap();
    let doomed_ref = first
        .agent
        .controller()
        .get_state(&doomed.instance_id, false)
        .await
        .unwrap()
        .runtime_ref
        .unwrap();
    drop(first);
    runtime.vanish(&doomed_ref);

    let second = agent_with(persistent_config(state_file), runtime);
    let report = second.agent.bootstrap().await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.adopted, 0);
    assert_eq!(report.reconcile.unwrap().removed, 1);

    let controller = second.agent.controller();
    let view = controller.get_state(&kept.instance_id, false).await.unwrap();
    assert_eq!(view.allocated_ports, kept.allocated_ports);
    assert_eq!(view.status, InstanceStatus::Running);

    // Restored ports are not handed out again.
    let mut req = request("nginx");
    req.ports = BTreeMap::from([("8080".to_string(), PortRequest::Auto)]);
    let fresh = controller.create(req).await.unwrap();
    assert_eq!(fresh.allocated_ports[&8080], RANGE_START + 1);

    let mut req = request("nginx");
    req.ports = BTreeMap::from([("3000".to_string(), PortRequest::Fixed(3000))]);
    assert_eq!(
        controller.create(req).await.unwrap_err(),
        AgentError::PortConflict { port: 3000 }
    );
}

#[tokio::test]
async fn test_pending_provisioning_is_failed_after_restart() {
    let dir = tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let runtime = FakeRuntime::new();
    runtime.set_latency(FakeOp::Exec, Duration::from_secs(60));

    let first = agent_with(persistent_config(state_file.clone()), runtime.clone());
    let mut req = request("ubuntu");
    req.ssh_enabled = true;
    let id = first
        .agent
        .controller()
        .create(req)
        .await
        .unwrap()
        .instance_id;

    let second = agent_with(persistent_config(state_file), runtime);
    second.agent.bootstrap().await.unwrap();
    let expected = ProvisioningState::Failed {
        reason: LOST_ACROSS_RESTART.to_string(),
    };
    assert_eq!(
        second.agent.controller().wait_provisioned(&id).await.unwrap(),
        expected
    );
    assert!(matches!(
        second.agent.keys().list_keys(&id).await,
        Err(AgentError::SshNotProvisioned(_))
    ));
}

#[tokio::test]
async fn test_unknown_managed_containers_are_adopted() {
    let runtime = FakeRuntime::new();
    let legacy_ref = runtime.insert_existing(
        BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (INSTANCE_ID_LABEL.to_string(), "legacy-1".to_string()),
            (IMAGE_LABEL.to_string(), "ubuntu:22.04".to_string()),
            (SSH_ENABLED_LABEL.to_string(), "true".to_string()),
        ]),
        BTreeMap::from([(22, RANGE_START)]),
        ContainerState::Running,
    );
    // Not ours: no management label.
    runtime.insert_existing(
        BTreeMap::new(),
        BTreeMap::from([(80, RANGE_START + 1)]),
        ContainerState::Running,
    );

    let t = agent_with(test_config(), runtime);
    let report = t.agent.bootstrap().await.unwrap();
    assert_eq!(report.adopted, 1);

    let view = t.agent.controller().get_state("legacy-1", false).await.unwrap();
    assert_eq!(view.runtime_ref.as_deref(), Some(legacy_ref.as_str()));
    assert_eq!(view.image, "ubuntu:22.04");
    assert_eq!(view.status, InstanceStatus::Running);
    assert!(matches!(view.provisioning, ProvisioningState::Failed { .. }));
    assert!(t.agent.context().ports.is_bound(RANGE_START));

    let mut req = request("nginx");
    req.ports = BTreeMap::from([("8080".to_string(), PortRequest::Auto)]);
    let created = t.agent.controller().create(req).await.unwrap();
    assert_ne!(created.allocated_ports[&8080], RANGE_START);
}

#[tokio::test]
async fn test_bootstrap_fails_without_runtime() {
    let runtime = FakeRuntime::new();
    runtime.fail_always(
        FakeOp::List,
        hostagent_common::RuntimeError::Unavailable("cannot connect to the Docker daemon".into()),
    );
    let t = agent_with(test_config(), runtime);
    assert!(matches!(
        t.agent.bootstrap().await,
        Err(AgentError::RuntimeUnavailable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_background_loops_report_and_reconcile() {
    let t = agent();
    let token = CancellationToken::new();
    let handles = t.agent.start_background(token.clone());
    let controller = t.agent.controller();

    let id = controller.create(request("ubuntu")).await.unwrap().instance_id;
    let runtime_ref = controller
        .get_state(&id, false)
        .await
        .unwrap()
        .runtime_ref
        .unwrap();
    t.runtime.set_stats(
        &runtime_ref,
        ContainerStats {
            cpu_pct: 55.0,
            mem_pct: 10.0,
        },
    );

    // Event-driven report right away, then one per telemetry period.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let on_create = t.sink.reports_for(&id).await.len();
    assert!(on_create >= 1);
    tokio::time::sleep(Duration::from_secs(7)).await;
    let reports = t.sink.reports_for(&id).await;
    assert!(reports.len() >= on_create + 2);
    assert!(reports.iter().any(|r| r.cpu_pct == 55.0));

    // The container dies; the next reconcile pass (30s) notices.
    t.runtime.crash(&runtime_ref, 1);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        controller.get_state(&id, false).await.unwrap().status,
        InstanceStatus::Error
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t
        .sink
        .reports_for(&id)
        .await
        .iter()
        .any(|r| r.status == InstanceStatus::Error));

    controller.delete(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let last = t.sink.reports_for(&id).await.pop().unwrap();
    assert_eq!(last.status, InstanceStatus::Deleted);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
