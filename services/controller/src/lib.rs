//! fleetd controller library.
//!
//! A declarative workload controller: operators declare workloads
//! (replica count + instance template), and the controller converges the
//! observed instance fleet toward the declaration, healing failures,
//! applying scale changes, and rolling template revisions under
//! surge/unavailable bounds.
//!
//! ## Architecture
//!
//! - **WorkloadStore**: desired state, versioned optimistic writes
//! - **InstanceRegistry**: observed state, ownership by back-reference
//! - **Reconciler**: level-triggered diff-and-correct passes
//! - **ScalingController**: the only writer of desired replica counts
//! - **RolloutController**: rollout phase machine and stall reporting
//! - **HealthMonitor**: readiness observations to lifecycle transitions
//! - **ControllerWorker**: periodic scan + nudge-driven passes
//!
//! The [`Controller`] handle assembles all of it and is the only
//! mutation surface; the reconciler never originates a desired-state
//! change.

pub mod config;
pub mod events;
pub mod health;
pub mod reconciler;
pub mod rollout;
pub mod runtime;
pub mod scaling;
pub mod store;
pub mod worker;

use std::sync::Arc;

use fleet_events::{
    event_types, ActorType, EventDraft, EventEnvelope, InstanceStatus, RolloutPhase,
    WorkloadAppliedPayload, WorkloadDeletedPayload,
};
use fleet_id::EventId;
use fleet_reconcile::Backoff;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::Config;
use crate::events::EventLog;
use crate::health::{HealthMonitor, StatusObservation};
use crate::reconciler::{ReconcileOutcome, ReconcileStats, Reconciler};
use crate::rollout::RolloutController;
use crate::runtime::InstanceRuntime;
use crate::scaling::{MetricSample, ScalingController, ScalingPolicy};
use crate::store::{InstanceRecord, InstanceRegistry, StoreError, VersionedWorkload, WorkloadSpec, WorkloadStore};
use crate::worker::{nudge_channel, ControllerWorker, NudgeSender};

// Re-export commonly used types
pub use crate::runtime::MockRuntime;
pub use crate::scaling::TargetUtilizationPolicy;

/// Aggregate status for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadStatus {
    /// Declared replica count.
    pub desired: u32,
    /// Instances in Ready status, any revision.
    pub ready: u32,
    /// Active instances on the current template revision.
    pub updated: u32,
    /// Ready instances that are also traffic-eligible.
    pub available: u32,
}

/// The assembled controller: write boundary, observation boundary, and
/// background workers.
pub struct Controller {
    config: Config,
    store: Arc<WorkloadStore>,
    registry: Arc<InstanceRegistry>,
    events: Arc<EventLog>,
    rollouts: Arc<RolloutController>,
    runtime: Arc<dyn InstanceRuntime>,
    scaling: ScalingController,
    health: Arc<HealthMonitor>,
    worker: Arc<ControllerWorker>,
    nudge: NudgeSender,
    nudge_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Controller {
    /// Assembles a controller over the given runtime.
    pub fn new(runtime: Arc<dyn InstanceRuntime>, config: Config) -> Arc<Self> {
        let store = Arc::new(WorkloadStore::new(config.revision_retention));
        let registry = Arc::new(InstanceRegistry::new());
        let events = Arc::new(EventLog::new());
        let rollouts = Arc::new(RolloutController::new(
            Arc::clone(&store),
            Arc::clone(&events),
            config.rollout_stall_budget,
        ));

        let backoff = Backoff::new(config.backoff_base, config.backoff_cap, config.max_retries);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&runtime),
            Arc::clone(&events),
            Arc::clone(&rollouts),
            backoff,
            config.runtime_timeout,
        ));

        let (nudge, nudge_rx) = nudge_channel();
        let worker = Arc::new(ControllerWorker::new(
            Arc::clone(&reconciler),
            Arc::clone(&store),
            config.reconcile_interval,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            nudge.clone(),
            config.liveness_miss_threshold,
        ));
        let scaling = ScalingController::new(Arc::clone(&store), Arc::clone(&events));

        Arc::new(Self {
            config,
            store,
            registry,
            events,
            rollouts,
            runtime,
            scaling,
            health,
            worker,
            nudge,
            nudge_rx: std::sync::Mutex::new(Some(nudge_rx)),
        })
    }

    /// Spawns the reconciliation worker and the health poll loop.
    /// Call once; panics on a second call.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let nudge_rx = self
            .nudge_rx
            .lock()
            .expect("nudge receiver mutex poisoned")
            .take()
            .expect("spawn_workers called twice");

        let worker_handle = tokio::spawn({
            let worker = Arc::clone(&self.worker);
            let shutdown = shutdown.clone();
            async move {
                worker.run(nudge_rx, shutdown).await;
            }
        });

        let health_handle = tokio::spawn({
            let health = Arc::clone(&self.health);
            let runtime = Arc::clone(&self.runtime);
            let interval = self.config.health_poll_interval;
            async move {
                health.run_poll_loop(runtime, interval, shutdown).await;
            }
        });

        vec![worker_handle, health_handle]
    }

    // -------------------------------------------------------------------------
    // Declarative write boundary
    // -------------------------------------------------------------------------

    /// Applies (creates or updates) a workload declaration.
    pub async fn apply_workload(
        &self,
        spec: WorkloadSpec,
    ) -> Result<VersionedWorkload, StoreError> {
        let outcome = self.store.apply(spec).await?;
        let workload = outcome.workload.clone();

        let draft = EventDraft::new(event_types::WORKLOAD_APPLIED, ActorType::Operator)
            .workload(workload.id)
            .payload(&WorkloadAppliedPayload {
                workload_id: workload.id,
                name: workload.spec.name.clone(),
                replicas: workload.spec.replicas,
                revision: workload.revision.as_str().to_string(),
            });
        match draft {
            Ok(draft) => {
                self.events.append(draft).await;
            }
            Err(e) => error!(error = %e, "Failed to encode workload.applied event"),
        }

        self.nudge.nudge(&workload.spec.name);
        Ok(workload)
    }

    /// Sets the desired replica count for a workload.
    pub async fn scale_workload(&self, name: &str, replicas: u32) -> Result<(), StoreError> {
        self.scaling
            .set_desired_replicas(name, replicas, ActorType::Operator)
            .await?;
        self.nudge.nudge(name);
        Ok(())
    }

    /// Evaluates a scaling policy against a metric sample.
    pub async fn evaluate_scaling_policy(
        &self,
        name: &str,
        policy: &dyn ScalingPolicy,
        sample: &MetricSample,
    ) -> Result<Option<u32>, StoreError> {
        let changed = self.scaling.evaluate_policy(name, policy, sample).await?;
        if changed.is_some() {
            self.nudge.nudge(name);
        }
        Ok(changed)
    }

    /// Deletes a workload. Every owned instance becomes a termination
    /// target; any in-progress rollout is cancelled.
    pub async fn delete_workload(&self, name: &str) -> Result<(), StoreError> {
        let id = self.store.delete(name).await?;
        self.rollouts.on_deleted(id).await;

        let draft = EventDraft::new(event_types::WORKLOAD_DELETED, ActorType::Operator)
            .workload(id)
            .payload(&WorkloadDeletedPayload {
                workload_id: id,
                name: name.to_string(),
            });
        if let Ok(draft) = draft {
            self.events.append(draft).await;
        }

        // The name no longer resolves; the pass falls through to the
        // orphan sweep and terminates the leftovers.
        self.nudge.nudge(name);
        Ok(())
    }

    /// Re-targets a workload at a prior revision. Runs through the same
    /// rollout machinery as a forward template change.
    pub async fn rollback_workload(&self, name: &str, revision: &str) -> Result<(), StoreError> {
        let workload = self.store.rollback(name, revision).await?;
        self.rollouts.mark_rollback(workload.id).await;
        self.nudge.nudge(name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Observation boundary
    // -------------------------------------------------------------------------

    /// Aggregate status for one workload.
    pub async fn get_workload_status(&self, name: &str) -> Result<WorkloadStatus, StoreError> {
        let workload = self
            .store
            .get(name)
            .await
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let owned = self
            .registry
            .owned_by(workload.id, &workload.spec.selector)
            .await;

        let mut status = WorkloadStatus {
            desired: workload.spec.replicas,
            ready: 0,
            updated: 0,
            available: 0,
        };
        for record in &owned {
            if record.status == InstanceStatus::Ready {
                status.ready += 1;
                if record.traffic_ready {
                    status.available += 1;
                }
            }
            if record.revision == workload.revision
                && record.status.is_active()
            {
                status.updated += 1;
            }
        }
        Ok(status)
    }

    /// All instance records owned by a workload, terminated-but-
    /// uncollected ones included.
    pub async fn list_instances(&self, name: &str) -> Result<Vec<InstanceRecord>, StoreError> {
        let workload = self
            .store
            .get(name)
            .await
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(self.registry.all_owned_by(workload.id).await)
    }

    /// Rollout phase for a workload.
    pub async fn rollout_phase(&self, name: &str) -> Result<RolloutPhase, StoreError> {
        let workload = self
            .store
            .get(name)
            .await
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(self.rollouts.phase(workload.id).await)
    }

    /// Revision history for a workload, oldest first. Rollback targets
    /// come from here.
    pub async fn revision_history(
        &self,
        name: &str,
    ) -> Result<Vec<store::RevisionEntry>, StoreError> {
        self.store.history(name).await
    }

    /// Events after the given cursor.
    pub async fn recent_events(&self, after: EventId) -> Vec<EventEnvelope> {
        self.events.read_after(after).await
    }

    // -------------------------------------------------------------------------
    // Direct drive (embedding and tests)
    // -------------------------------------------------------------------------

    /// Runs one reconcile pass for a workload, under its pass lock.
    pub async fn reconcile_now(&self, name: &str) -> ReconcileOutcome {
        self.worker.pass(name).await
    }

    /// Runs a full scan over every workload plus the orphan sweep.
    pub async fn scan_now(&self) -> ReconcileStats {
        self.worker.full_scan().await
    }

    /// Feeds one status observation to the health monitor, as a push
    /// delivery would.
    pub async fn observe_status(&self, observation: StatusObservation) {
        self.health.observe(observation).await;
    }

    /// Runs one probe sweep, as the poll loop would.
    pub async fn poll_health_now(&self) {
        self.health.poll_once(&self.runtime).await;
    }
}
