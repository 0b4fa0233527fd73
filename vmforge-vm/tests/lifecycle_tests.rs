mod common;

use common::{named, simulated, spec, vm1, Harness};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use vmforge_core::{
    abstractions::{cancel_pair, CancelToken},
    config::ControllerConfig,
    platform::{HypervisorClient, ObjectKind, PlatformError, TaskKind},
};
use vmforge_vm::{
    AddressHints, ConvergencePoller, FaultPoint, PlatformCall, ReconcileOutcome, StateReconciler,
    VmforgeError,
};

fn never() -> CancelToken {
    CancelToken::never()
}

#[tokio::test]
async fn test_end_to_end_vm1() {
    let harness = Harness::new();
    harness
        .platform
        .script_guest_ips("vm1", [None, Some("10.0.0.5")]);

    let tracked = harness.resource.create(vm1(30), &never()).await.unwrap();

    assert_eq!(
        harness.platform.submitted_tasks(),
        vec![TaskKind::Create, TaskKind::PowerOn]
    );
    // Freshly booted: the whole boot delay is waited out before polling
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(30)]);

    assert_eq!(tracked.id, "vm1");
    assert_eq!(tracked.memory_mb, Some(2048));
    assert_eq!(tracked.cpu, Some(2));
    assert_eq!(tracked.ip_address.as_deref(), Some("10.0.0.5"));
    assert_eq!(tracked.datacenter.as_deref(), Some(simulated::DEFAULT_DATACENTER));

    let expected: BTreeMap<String, String> =
        [("host".to_string(), "10.0.0.5".to_string())].into_iter().collect();
    assert_eq!(tracked.connection_info, expected);
}

#[tokio::test]
async fn test_validation_error_issues_no_platform_call() {
    let harness = Harness::new();
    let mut invalid = vm1(0);
    invalid.hard_disks[0].size_gb = None;

    let result = harness.resource.create(invalid, &never()).await;

    assert!(matches!(
        result,
        Err(VmforgeError::Validation { ref field, .. }) if field == "disk.0.size"
    ));
    assert!(harness.platform.calls().is_empty());
}

#[tokio::test]
async fn test_clone_path_attaches_disks_and_customizes() {
    let harness = Harness::instant_dhcp();
    let clone = spec(&format!(
        r#"
name: app
vcpu: 4
memory: 8192
gateway: 10.0.0.1
network_interface:
  - label: frontend
disk:
  - template: {}
  - size: 50
    iops: 500
"#,
        simulated::DEFAULT_TEMPLATE
    ));

    let tracked = harness.resource.create(clone, &never()).await.unwrap();

    assert_eq!(
        harness.platform.submitted_tasks(),
        vec![
            TaskKind::Clone,
            TaskKind::Reconfigure,
            TaskKind::Customize,
            TaskKind::PowerOn
        ]
    );
    assert_eq!(tracked.cpu, Some(4));

    let vm = harness.platform.vm("app").unwrap();
    // Template disk plus the additional one
    assert_eq!(vm.disks.len(), 2);
    assert_eq!(vm.disks[1].capacity_gb, 50);
    assert_eq!(vm.nics[0].network_label, "frontend");
    let customization = vm.customization.unwrap();
    assert_eq!(customization.hostname, "app");
    assert_eq!(customization.domain, "vsphere.local");
    assert_eq!(customization.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
}

#[tokio::test]
async fn test_missing_template_is_a_provisioning_error() {
    let harness = Harness::new();
    let clone = spec(
        r#"
name: app
vcpu: 1
memory: 1024
network_interface:
  - label: eth0
disk:
  - template: does-not-exist
"#,
    );

    let err = harness.resource.create(clone, &never()).await.unwrap_err();

    assert!(matches!(err, VmforgeError::Provisioning { ref operation, .. } if operation == "find template"));
    assert!(harness.platform.submitted_tasks().is_empty());
}

#[tokio::test]
async fn test_static_address_skips_polling() {
    let harness = Harness::new();
    let static_vm = spec(
        r#"
name: db
vcpu: 2
memory: 4096
boot_delay: 120
network_interface:
  - label: backend
    ip_address: 192.168.10.5
    subnet_mask: 255.255.255.0
disk:
  - size: 40
"#,
    );

    let tracked = harness.resource.create(static_vm, &never()).await.unwrap();

    assert_eq!(tracked.ip_address.as_deref(), Some("192.168.10.5"));
    // One retrieval for sizing, none for the address, and no waiting
    assert_eq!(harness.platform.summary_retrievals("db"), 1);
    assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_zero_boot_delay_polls_immediately() {
    let harness = Harness::instant_dhcp();

    let tracked = harness.resource.create(vm1(0), &never()).await.unwrap();

    assert_eq!(tracked.ip_address.as_deref(), Some("10.0.0.10"));
    assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_poll_retries_until_address_appears() {
    let harness = Harness::new();
    let vm = harness.platform.seed_powered_on("web").unwrap();
    harness
        .platform
        .script_guest_ips("web", [None, None, Some("10.0.0.5")]);

    let poller = ConvergencePoller::new(
        harness.platform.clone(),
        Arc::new(harness.clock.clone()),
        ControllerConfig::default().convergence,
    );
    let ip = poller
        .resolve_address("web", &vm, AddressHints::default(), &never())
        .await
        .unwrap();

    assert_eq!(ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(harness.platform.summary_retrievals("web"), 3);
    assert_eq!(
        harness.clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(1)]
    );
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let harness = Harness::new();
    harness.platform.seed_powered_on("web").unwrap();
    harness.platform.script_guest_ips("web", [Some("10.0.0.42")]);

    let poller = ConvergencePoller::new(
        harness.platform.clone(),
        Arc::new(harness.clock.clone()),
        ControllerConfig::default().convergence,
    );
    let reconciler = StateReconciler::new(harness.platform.clone(), poller);

    let first = reconciler
        .reconcile("web", None, AddressHints::default(), &never())
        .await
        .unwrap();
    let second = reconciler
        .reconcile("web", None, AddressHints::default(), &never())
        .await
        .unwrap();

    assert!(matches!(first, ReconcileOutcome::Found(_)));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_reconcile_unknown_name_is_not_found() {
    let harness = Harness::new();
    let poller = ConvergencePoller::new(
        harness.platform.clone(),
        Arc::new(harness.clock.clone()),
        ControllerConfig::default().convergence,
    );
    let reconciler = StateReconciler::new(harness.platform.clone(), poller);

    let missing_vm = reconciler
        .reconcile("ghost", None, AddressHints::default(), &never())
        .await
        .unwrap();
    let missing_datacenter = reconciler
        .reconcile("ghost", Some("dc-elsewhere"), AddressHints::default(), &never())
        .await
        .unwrap();

    assert_eq!(missing_vm, ReconcileOutcome::NotFound);
    assert_eq!(missing_datacenter, ReconcileOutcome::NotFound);
}

#[tokio::test]
async fn test_read_after_external_delete_clears_identity() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();
    assert!(tracked.is_tracked());

    assert!(harness.platform.remove_vm("vm1"));
    harness.resource.read(&mut tracked, &never()).await.unwrap();

    assert!(!tracked.is_tracked());
    assert!(tracked.connection_info.is_empty());
}

#[tokio::test]
async fn test_delete_powers_off_before_destroy() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();
    harness.platform.clear_calls();

    harness.resource.delete(&mut tracked, &never()).await.unwrap();

    let tasks: Vec<PlatformCall> = harness
        .platform
        .calls()
        .into_iter()
        .filter(|call| matches!(call, PlatformCall::Submit { .. } | PlatformCall::Wait { .. }))
        .collect();
    let vm = "vm1".to_string();
    assert_eq!(
        tasks,
        vec![
            PlatformCall::Submit { kind: TaskKind::PowerOff, vm: vm.clone() },
            PlatformCall::Wait { kind: TaskKind::PowerOff, vm: vm.clone() },
            PlatformCall::Submit { kind: TaskKind::Destroy, vm: vm.clone() },
            PlatformCall::Wait { kind: TaskKind::Destroy, vm },
        ]
    );
    assert!(!tracked.is_tracked());
    assert!(harness.platform.vm("vm1").is_none());
}

#[tokio::test]
async fn test_power_off_failure_never_submits_destroy() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();
    harness.platform.fail_next(
        FaultPoint::Wait(TaskKind::PowerOff),
        PlatformError::task_failed("power-off", "host not responding"),
    );

    let err = harness.resource.delete(&mut tracked, &never()).await.unwrap_err();

    assert!(matches!(err, VmforgeError::Teardown { ref operation, .. } if operation == "wait power-off"));
    assert!(!harness
        .platform
        .submitted_tasks()
        .contains(&TaskKind::Destroy));
    // Identity survives so the delete can be retried
    assert_eq!(tracked.id, "vm1");

    harness.resource.delete(&mut tracked, &never()).await.unwrap();
    assert!(!tracked.is_tracked());
}

#[tokio::test]
async fn test_delete_of_missing_vm_is_not_found() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();
    harness.platform.remove_vm("vm1");

    let err = harness.resource.delete(&mut tracked, &never()).await.unwrap_err();

    assert!(matches!(err, VmforgeError::NotFound { .. }));
    assert_eq!(tracked.id, "vm1");
}

#[tokio::test]
async fn test_failed_create_task_surfaces_provisioning_error() {
    let harness = Harness::new();
    harness.platform.fail_next(
        FaultPoint::Wait(TaskKind::Create),
        PlatformError::task_failed("create", "insufficient disk space"),
    );

    let err = harness.resource.create(vm1(0), &never()).await.unwrap_err();

    match err {
        VmforgeError::Provisioning {
            operation,
            vm_name,
            source,
        } => {
            assert_eq!(operation, "wait create");
            assert_eq!(vm_name, "vm1");
            assert_eq!(
                source,
                PlatformError::task_failed("create", "insufficient disk space")
            );
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }
    assert!(!harness.platform.submitted_tasks().contains(&TaskKind::PowerOn));
}

#[tokio::test]
async fn test_update_resizes_through_reconfigure() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();

    let mut desired = vm1(0);
    desired.vcpu = 4;
    desired.memory_mb = 8192;
    harness
        .resource
        .update(&mut tracked, desired, &never())
        .await
        .unwrap();

    assert_eq!(harness.platform.submitted_tasks().last(), Some(&TaskKind::Reconfigure));
    assert_eq!(tracked.cpu, Some(4));
    assert_eq!(tracked.memory_mb, Some(8192));
    assert_eq!(tracked.spec.vcpu, 4);

    // Unchanged sizing submits nothing
    let before = harness.platform.submitted_tasks().len();
    let unchanged = tracked.spec.clone();
    harness
        .resource
        .update(&mut tracked, unchanged, &never())
        .await
        .unwrap();
    assert_eq!(harness.platform.submitted_tasks().len(), before);
}

#[tokio::test]
async fn test_update_cannot_rename() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();

    let result = harness
        .resource
        .update(&mut tracked, named("vm2"), &never())
        .await;

    assert!(matches!(result, Err(VmforgeError::Validation { ref field, .. }) if field == "name"));
}

#[tokio::test]
async fn test_poll_bound_is_enforced() {
    let mut config = ControllerConfig::default();
    config.convergence.max_poll_attempts = 3;
    let harness = Harness::with_config(config);
    harness.platform.script_guest_ips("vm1", [None]);

    let err = harness.resource.create(vm1(0), &never()).await.unwrap_err();

    assert!(matches!(err, VmforgeError::ConvergenceExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_cancelled_create_submits_nothing() {
    let harness = Harness::new();
    let (handle, token) = cancel_pair();
    handle.cancel();

    let err = harness.resource.create(vm1(0), &token).await.unwrap_err();

    assert!(matches!(err, VmforgeError::Cancelled { .. }));
    assert!(harness.platform.submitted_tasks().is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_an_endless_poll() {
    let mut config = ControllerConfig::default();
    config.convergence.max_poll_attempts = u32::MAX;
    let harness = Harness::with_config(config);
    harness.platform.script_guest_ips("vm1", [None]);
    let (handle, token) = cancel_pair();

    let resource = harness.resource.clone();
    let create = tokio::spawn(async move { resource.create(vm1(0), &token).await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    handle.cancel();

    let err = create.await.unwrap().unwrap_err();
    assert!(matches!(err, VmforgeError::Cancelled { .. }));
}

#[tokio::test]
async fn test_stuck_task_hits_operation_timeout() {
    let mut config = ControllerConfig::default();
    config.operation_timeout = Duration::from_millis(50);
    let harness = Harness::with_config(config);
    harness.platform.stall_waits(TaskKind::Create);

    let err = harness.resource.create(vm1(0), &never()).await.unwrap_err();

    assert!(matches!(err, VmforgeError::Timeout { .. }));
}

#[tokio::test]
async fn test_concurrent_lifecycles_on_shared_platform() {
    let harness = Harness::new();
    let names: Vec<String> = (0..8).map(|i| format!("worker-{i}")).collect();
    let cancel = never();

    let results = futures::future::join_all(
        names
            .iter()
            .map(|name| harness.resource.create(named(name), &cancel)),
    )
    .await;

    let mut addresses: Vec<String> = results
        .into_iter()
        .map(|result| result.unwrap().ip_address.unwrap())
        .collect();
    addresses.sort();
    addresses.dedup();

    assert_eq!(addresses.len(), 8);
    assert_eq!(harness.platform.vms().len(), 8);
}

#[tokio::test]
async fn test_read_of_powered_off_vm_keeps_identity_without_address() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(120), &never()).await.unwrap();
    assert_eq!(tracked.ip_address.as_deref(), Some("10.0.0.10"));

    // Powered off behind the controller's back
    let datacenter = harness.platform.find_datacenter(None).await.unwrap();
    let vm = harness.platform.find_vm(&datacenter, "vm1").await.unwrap();
    let task = harness.platform.power_off(&vm).await.unwrap();
    harness.platform.wait_for_task(&task).await.unwrap();
    harness.platform.clear_calls();
    let slept_before = harness.clock.sleeps().len();

    harness.resource.read(&mut tracked, &never()).await.unwrap();

    assert!(tracked.is_tracked());
    assert_eq!(tracked.cpu, Some(2));
    assert_eq!(tracked.ip_address, None);
    assert!(tracked.connection_info.is_empty());
    assert_eq!(harness.platform.summary_retrievals("vm1"), 1);
    assert_eq!(harness.clock.sleeps().len(), slept_before);

    // Still updatable while stopped
    let mut bigger = vm1(120);
    bigger.vcpu = 4;
    harness
        .resource
        .update(&mut tracked, bigger, &never())
        .await
        .unwrap();
    assert_eq!(tracked.cpu, Some(4));
}

#[tokio::test]
async fn test_read_retries_transient_summary_fault() {
    let harness = Harness::instant_dhcp();
    let mut tracked = harness.resource.create(vm1(0), &never()).await.unwrap();
    harness.platform.fail_next(
        FaultPoint::RetrieveSummary,
        PlatformError::fault("collector busy"),
    );

    harness.resource.read(&mut tracked, &never()).await.unwrap();

    assert!(tracked.is_tracked());
    assert_eq!(tracked.ip_address.as_deref(), Some("10.0.0.10"));
}

#[tokio::test]
async fn test_create_fails_when_vm_vanishes_before_read_back() {
    let harness = Harness::instant_dhcp();
    harness.platform.fail_next(
        FaultPoint::FindVm,
        PlatformError::not_found(ObjectKind::VirtualMachine.to_string(), "vm1"),
    );

    let err = harness.resource.create(vm1(0), &never()).await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(
        harness.platform.submitted_tasks(),
        vec![TaskKind::Create, TaskKind::PowerOn]
    );
}
