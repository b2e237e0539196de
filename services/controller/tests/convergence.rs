//! End-to-end convergence behavior against the mock runtime.
//!
//! Each test drives reconcile passes and health sweeps by hand instead
//! of spawning the background workers, so every assertion runs against a
//! quiesced controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_controller::config::Config;
use fleet_controller::health::StatusObservation;
use fleet_controller::store::{StoreError, WorkloadSpec};
use fleet_controller::{Controller, MockRuntime};
use fleet_events::{
    event_types, FailureReason, InstanceStatus, ObservedReadiness, RolloutPhase,
};
use fleet_id::EventId;
use fleet_reconcile::RolloutPolicy;

fn test_config() -> Config {
    Config {
        runtime_timeout: Duration::from_millis(200),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        liveness_miss_threshold: 1,
        rollout_stall_budget: Duration::from_secs(60),
        ..Config::default()
    }
}

fn setup() -> (Arc<Controller>, Arc<MockRuntime>) {
    let runtime = Arc::new(MockRuntime::new());
    let controller = Controller::new(runtime.clone(), test_config());
    (controller, runtime)
}

fn workload(name: &str, replicas: u32, image: &str, policy: RolloutPolicy) -> WorkloadSpec {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    WorkloadSpec {
        name: name.to_string(),
        replicas,
        template: serde_json::json!({ "image": image, "cmd": ["serve"] }),
        selector: labels.clone(),
        labels,
        rollout: policy,
        autoscale: None,
    }
}

/// Drives reconcile + health sweeps until the workload converges.
async fn converge(controller: &Controller, name: &str) {
    for _ in 0..20 {
        let outcome = controller.reconcile_now(name).await;
        controller.poll_health_now().await;
        if outcome.converged {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workload {name} did not converge");
}

#[tokio::test]
async fn convergence_reaches_fixed_point() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 3, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();

    converge(&controller, "web").await;

    let status = controller.get_workload_status("web").await.unwrap();
    assert_eq!(status.desired, 3);
    assert_eq!(status.ready, 3);
    assert_eq!(status.updated, 3);
    assert_eq!(status.available, 3);
    assert_eq!(runtime.create_count(), 3);

    // Redundant passes are no-ops: level-triggered, not edge-triggered.
    for _ in 0..3 {
        let outcome = controller.reconcile_now("web").await;
        assert!(outcome.converged);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.terminated, 0);
    }
    assert_eq!(runtime.create_count(), 3);
}

#[tokio::test]
async fn auto_heal_replaces_dead_instance() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 3, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;

    // One instance dies out from under the controller.
    let victim = controller.list_instances("web").await.unwrap()[0].id;
    runtime.kill(victim).await;
    controller.poll_health_now().await;

    let failed = controller
        .list_instances("web")
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id == victim)
        .unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::LivenessLost));

    converge(&controller, "web").await;

    let status = controller.get_workload_status("web").await.unwrap();
    assert_eq!(status.ready, 3);
    // Exactly one replacement was created.
    assert_eq!(runtime.create_count(), 4);
    assert!(!runtime.live_instances().await.contains(&victim));
}

#[tokio::test]
async fn deleted_workload_is_never_healed() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 2, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;
    assert_eq!(runtime.create_count(), 2);

    controller.delete_workload("web").await.unwrap();
    assert!(matches!(
        controller.get_workload_status("web").await,
        Err(StoreError::NotFound(_))
    ));

    // The pass for the deleted name falls through to the orphan sweep.
    let outcome = controller.reconcile_now("web").await;
    assert_eq!(outcome.terminated, 2);
    assert!(runtime.live_instances().await.is_empty());

    // Nothing resurrects the fleet afterwards.
    for _ in 0..3 {
        controller.scan_now().await;
        controller.poll_health_now().await;
    }
    assert_eq!(runtime.create_count(), 2);
    assert!(runtime.live_instances().await.is_empty());
}

#[tokio::test]
async fn delete_mid_startup_leaves_no_orphans() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 2, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();

    // Instances created but not yet observed Ready.
    controller.reconcile_now("web").await;
    assert_eq!(runtime.create_count(), 2);

    controller.delete_workload("web").await.unwrap();
    controller.reconcile_now("web").await;
    assert!(runtime.live_instances().await.is_empty());
}

#[tokio::test]
async fn scale_up_then_down_never_overshoots() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 1, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;

    controller.scale_workload("web", 5).await.unwrap();
    let mut max_seen = 0usize;
    for _ in 0..20 {
        let outcome = controller.reconcile_now("web").await;
        controller.poll_health_now().await;
        let active = controller
            .list_instances("web")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .count();
        max_seen = max_seen.max(active);
        if outcome.converged {
            break;
        }
    }
    assert_eq!(controller.get_workload_status("web").await.unwrap().ready, 5);

    controller.scale_workload("web", 1).await.unwrap();
    for _ in 0..20 {
        let outcome = controller.reconcile_now("web").await;
        controller.poll_health_now().await;
        let active = controller
            .list_instances("web")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .count();
        max_seen = max_seen.max(active);
        if outcome.converged {
            break;
        }
    }

    let status = controller.get_workload_status("web").await.unwrap();
    assert_eq!(status.ready, 1);
    assert!(max_seen <= 5, "fleet overshot to {max_seen}");
    assert_eq!(runtime.live_instances().await.len(), 1);
}

#[tokio::test]
async fn scale_down_prefers_failed_instances() {
    let (controller, runtime) = setup();
    controller
        .apply_workload(workload("web", 3, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;

    let victim = controller.list_instances("web").await.unwrap()[1].id;
    runtime.kill(victim).await;
    controller.poll_health_now().await;

    controller.scale_workload("web", 2).await.unwrap();
    controller.reconcile_now("web").await;

    // The failed instance was selected for termination first.
    let survivors: Vec<_> = controller
        .list_instances("web")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| !r.status.is_terminal())
        .collect();
    assert_eq!(survivors.len(), 2);
    assert!(survivors.iter().all(|r| r.id != victim));
}

#[tokio::test]
async fn rollout_honors_surge_and_availability_bounds() {
    let policy = RolloutPolicy {
        max_surge: 1,
        max_unavailable: 1,
    };
    let (controller, _runtime) = setup();
    controller
        .apply_workload(workload("web", 3, "app:v1", policy))
        .await
        .unwrap();
    converge(&controller, "web").await;

    let v1_instances: Vec<_> = controller.list_instances("web").await.unwrap();
    let v1_revision = v1_instances[0].revision.clone();

    controller
        .apply_workload(workload("web", 3, "app:v2", policy))
        .await
        .unwrap();

    for _ in 0..30 {
        let outcome = controller.reconcile_now("web").await;

        let records = controller.list_instances("web").await.unwrap();
        let ready = records
            .iter()
            .filter(|r| r.status == InstanceStatus::Ready)
            .count();
        let in_flight = records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count();
        assert!(ready >= 2, "availability floor broken: {ready} ready");
        assert!(in_flight <= 4, "surge ceiling broken: {in_flight} in flight");

        controller.poll_health_now().await;
        if outcome.converged {
            break;
        }
    }

    assert_eq!(
        controller.rollout_phase("web").await.unwrap(),
        RolloutPhase::Succeeded
    );
    let records = controller.list_instances("web").await.unwrap();
    let active: Vec<_> = records
        .iter()
        .filter(|r| !r.status.is_terminal())
        .collect();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|r| r.revision != v1_revision));
}

#[tokio::test]
async fn rollback_converges_like_a_forward_rollout() {
    let policy = RolloutPolicy {
        max_surge: 1,
        max_unavailable: 1,
    };
    let (controller, _runtime) = setup();
    controller
        .apply_workload(workload("web", 3, "app:v1", policy))
        .await
        .unwrap();
    converge(&controller, "web").await;
    let v1_revision = controller.list_instances("web").await.unwrap()[0]
        .revision
        .clone();

    controller
        .apply_workload(workload("web", 3, "app:v2", policy))
        .await
        .unwrap();
    converge(&controller, "web").await;
    assert_eq!(
        controller.rollout_phase("web").await.unwrap(),
        RolloutPhase::Succeeded
    );

    controller
        .rollback_workload("web", v1_revision.as_str())
        .await
        .unwrap();
    converge(&controller, "web").await;

    assert_eq!(
        controller.rollout_phase("web").await.unwrap(),
        RolloutPhase::RolledBack
    );
    let active: Vec<_> = controller
        .list_instances("web")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| !r.status.is_terminal())
        .collect();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|r| r.revision == v1_revision));
}

#[tokio::test]
async fn failing_creates_back_off_and_alert() {
    let runtime = Arc::new(MockRuntime::new());
    let controller = Controller::new(runtime.clone(), test_config());
    controller
        .apply_workload(workload("web", 1, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();

    // Every create fails: the first pass fails once, retries spend the
    // rest of the budget (3 retries by default).
    runtime.fail_next_creates(100);
    for _ in 0..10 {
        controller.reconcile_now("web").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let records = controller.list_instances("web").await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, InstanceStatus::Failed);
    assert!(record.alerted);
    assert_eq!(record.failure_reason, Some(FailureReason::RetriesExhausted));
}

#[tokio::test]
async fn stalled_rollout_is_reported_not_reverted() {
    let config = Config {
        rollout_stall_budget: Duration::from_millis(10),
        ..test_config()
    };
    let runtime = Arc::new(MockRuntime::new());
    let controller = Controller::new(runtime.clone(), config);

    controller
        .apply_workload(workload("web", 2, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;

    // The new revision can never come up.
    runtime.fail_next_creates(1000);
    controller
        .apply_workload(workload("web", 2, "app:v2", RolloutPolicy::default()))
        .await
        .unwrap();

    for _ in 0..5 {
        controller.reconcile_now("web").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stalled: Vec<_> = controller
        .recent_events(EventId::ZERO)
        .await
        .into_iter()
        .filter(|e| e.event_type == event_types::ROLLOUT_STALLED)
        .collect();
    assert_eq!(stalled.len(), 1);
    // Not auto-reverted: still progressing, awaiting the operator.
    assert_eq!(
        controller.rollout_phase("web").await.unwrap(),
        RolloutPhase::Progressing
    );
}

#[tokio::test]
async fn push_observations_drive_the_same_transitions() {
    let (controller, _runtime) = setup();
    controller
        .apply_workload(workload("web", 1, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    controller.reconcile_now("web").await;

    // Deliver readiness by push instead of the poll sweep.
    let id = controller.list_instances("web").await.unwrap()[0].id;
    controller
        .observe_status(StatusObservation::now(id, ObservedReadiness::Ready))
        .await;

    let status = controller.get_workload_status("web").await.unwrap();
    assert_eq!(status.ready, 1);
    assert_eq!(status.available, 1);
}

#[tokio::test]
async fn workload_events_record_the_story() {
    let (controller, _runtime) = setup();
    controller
        .apply_workload(workload("web", 1, "app:v1", RolloutPolicy::default()))
        .await
        .unwrap();
    converge(&controller, "web").await;
    controller.scale_workload("web", 2).await.unwrap();
    converge(&controller, "web").await;
    controller.delete_workload("web").await.unwrap();
    controller.reconcile_now("web").await;

    let types: Vec<String> = controller
        .recent_events(EventId::ZERO)
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        event_types::WORKLOAD_APPLIED,
        event_types::INSTANCE_CREATED,
        event_types::INSTANCE_STATUS_CHANGED,
        event_types::WORKLOAD_SCALED,
        event_types::WORKLOAD_DELETED,
        event_types::INSTANCE_TERMINATED,
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {expected}");
    }
}
