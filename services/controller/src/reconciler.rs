//! The reconciliation core: one level-triggered pass per workload.
//!
//! A pass re-derives every corrective action from current state:
//! - classify owned instances by template revision
//! - create the current-revision deficit, bounded by the surge ceiling
//! - retire superseded instances without breaching the availability floor
//! - terminate surplus with deterministic selection
//! - retry failed runtime calls under capped backoff
//!
//! Passes are idempotent; a converged workload produces no actions. A
//! failure on one instance never blocks the rest of the fleet, and a
//! failure in one workload never touches another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_events::{
    event_types, ActorType, EventDraft, FailureReason, InstanceCreatedPayload, InstanceStatus,
    InstanceTerminatedPayload,
};
use fleet_id::InstanceId;
use fleet_reconcile::{
    classify_instances, termination_order, Backoff, FleetCounts, InstanceView, RetryDecision,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::events::EventLog;
use crate::rollout::RolloutController;
use crate::runtime::InstanceRuntime;
use crate::store::{InstanceRecord, InstanceRegistry, VersionedWorkload, WorkloadStore};

/// Result of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileOutcome {
    pub created: u32,
    pub terminated: u32,
    pub retried: u32,
    /// True when the pass found nothing to do and the fleet matches the
    /// declared state.
    pub converged: bool,
}

/// Aggregated statistics for a full scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub workloads_processed: u32,
    pub workloads_failed: u32,
    pub instances_created: u32,
    pub instances_terminated: u32,
    pub orphans_terminated: u32,
}

/// The reconciler. Holds no per-workload memory: every pass re-reads
/// desired and observed state in full.
pub struct Reconciler {
    store: Arc<WorkloadStore>,
    registry: Arc<InstanceRegistry>,
    runtime: Arc<dyn InstanceRuntime>,
    events: Arc<EventLog>,
    rollouts: Arc<RolloutController>,
    backoff: Mutex<Backoff>,
    runtime_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<WorkloadStore>,
        registry: Arc<InstanceRegistry>,
        runtime: Arc<dyn InstanceRuntime>,
        events: Arc<EventLog>,
        rollouts: Arc<RolloutController>,
        backoff: Backoff,
        runtime_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            runtime,
            events,
            rollouts,
            backoff: Mutex::new(backoff),
            runtime_timeout,
        }
    }

    /// Runs one reconciliation pass for a workload by name.
    ///
    /// A name with no stored workload triggers an orphan sweep instead:
    /// instances whose owner is gone are terminated and never recreated.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str) -> ReconcileOutcome {
        let Some(workload) = self.store.get(name).await else {
            let orphans = self.sweep_orphans().await;
            return ReconcileOutcome {
                terminated: orphans,
                ..Default::default()
            };
        };

        // Collect records that finished terminating since the last pass
        // and drop their retry bookkeeping.
        let collected = self.registry.gc_terminated(workload.id).await;
        if !collected.is_empty() {
            let mut backoff = self.backoff.lock().await;
            for id in &collected {
                backoff.clear(id);
            }
        }

        let owned = self
            .registry
            .owned_by(workload.id, &workload.spec.selector)
            .await;
        let by_id: HashMap<InstanceId, InstanceRecord> =
            owned.iter().map(|r| (r.id, r.clone())).collect();

        // Terminating records are already on their way out; they only
        // need terminate retries, not counting.
        let (terminating, active): (Vec<_>, Vec<_>) = owned
            .into_iter()
            .partition(|r| r.status == InstanceStatus::Terminating);

        let views: Vec<InstanceView> = active
            .iter()
            .map(|r| InstanceView {
                id: r.id,
                status: r.status,
                revision: r.revision.clone(),
            })
            .collect();
        let (cur, old) = classify_instances(views, &workload.revision);

        let counts = FleetCounts {
            ready_cur: count_status(&cur, InstanceStatus::Ready),
            pending_cur: count_status(&cur, InstanceStatus::Pending)
                + count_status(&cur, InstanceStatus::Starting),
            failed_cur: count_status(&cur, InstanceStatus::Failed),
            active_old: old.len() as u32,
            ready_old: count_status(&old, InstanceStatus::Ready),
        };

        self.rollouts
            .observe(&workload, counts.active_old, counts.ready_cur)
            .await;

        let plan = workload
            .spec
            .rollout
            .calculate_step(workload.spec.replicas, &counts);

        debug!(
            workload = %name,
            desired = workload.spec.replicas,
            ready_cur = counts.ready_cur,
            pending_cur = counts.pending_cur,
            failed_cur = counts.failed_cur,
            active_old = counts.active_old,
            create_new = plan.create_new,
            retire_old = plan.retire_old,
            "Reconcile pass state"
        );

        let mut outcome = ReconcileOutcome::default();

        // Deficit: create current-revision instances. Each creation is
        // independent; one failure never blocks the rest.
        for _ in 0..plan.create_new {
            if self.create_instance(&workload).await {
                outcome.created += 1;
            }
        }

        // Retry instances whose runtime call failed earlier.
        outcome.retried += self.retry_failed(&workload, &cur, &by_id).await;

        // Retire superseded instances. Non-ready old instances carry no
        // availability, so they go unconditionally; ready ones are
        // rationed by the step plan.
        let mut retired = 0u32;
        let (old_ready, old_not_ready): (Vec<_>, Vec<_>) = old
            .iter()
            .partition(|v| v.status == InstanceStatus::Ready);
        for view in &old_not_ready {
            if self.terminate_instance(&by_id[&view.id]).await {
                retired += 1;
            }
        }
        let ordered_old = termination_order(old_ready.into_iter().cloned().collect());
        for view in ordered_old.iter().take(plan.retire_old as usize) {
            if self.terminate_instance(&by_id[&view.id]).await {
                retired += 1;
            }
        }

        // Surplus: more current-revision instances than desired.
        let active_cur = counts.ready_cur + counts.pending_cur + counts.failed_cur;
        let surplus = active_cur.saturating_sub(workload.spec.replicas) as usize;
        if surplus > 0 {
            let ordered = termination_order(cur.clone());
            for view in ordered.iter().take(surplus) {
                if self.terminate_instance(&by_id[&view.id]).await {
                    outcome.terminated += 1;
                }
            }
        }

        // Terminate calls that failed earlier are retried here.
        for record in &terminating {
            if self.should_retry(&record.id).await && self.terminate_instance(record).await {
                outcome.terminated += 1;
            }
        }

        outcome.terminated += retired;
        self.rollouts
            .note_progress(&workload, outcome.created, retired)
            .await;
        self.rollouts.check_stalled(&workload).await;

        outcome.converged = outcome.created == 0
            && outcome.terminated == 0
            && outcome.retried == 0
            && counts.active_old == 0
            && counts.pending_cur == 0
            && counts.failed_cur == 0
            && terminating.is_empty()
            && counts.ready_cur == workload.spec.replicas;

        if outcome.created > 0 || outcome.terminated > 0 {
            info!(
                workload = %name,
                created = outcome.created,
                terminated = outcome.terminated,
                "Reconcile pass applied corrections"
            );
        }

        outcome
    }

    /// Terminates every active instance whose owning workload no longer
    /// exists. Such instances are never recreated.
    pub async fn sweep_orphans(&self) -> u32 {
        let mut terminated = 0;
        for owner in self.registry.active_owners().await {
            if self.store.get_by_id(owner).await.is_some() {
                continue;
            }
            let orphans = self.registry.all_owned_by(owner).await;
            for record in orphans {
                if record.status.is_terminal() {
                    continue;
                }
                if record.status != InstanceStatus::Terminating
                    || self.should_retry(&record.id).await
                {
                    if self.terminate_instance(&record).await {
                        terminated += 1;
                    }
                }
            }
            self.registry.gc_terminated(owner).await;
        }
        if terminated > 0 {
            info!(count = terminated, "Terminated orphaned instances");
        }
        terminated
    }

    /// Creates one instance for a workload. Returns true on success.
    async fn create_instance(&self, workload: &VersionedWorkload) -> bool {
        let record = InstanceRecord::new(
            workload.id,
            &workload.spec.name,
            workload.revision.clone(),
            workload.spec.labels.clone(),
        );
        let id = record.id;
        self.registry.insert(record).await;

        match self.call_create(workload, id).await {
            Ok(()) => {
                let _ = self
                    .registry
                    .update_status(&id, InstanceStatus::Starting, None)
                    .await;
                self.append_created_event(workload, id).await;
                true
            }
            Err(reason) => {
                warn!(
                    instance_id = %id,
                    workload = %workload.spec.name,
                    reason = %reason,
                    "Instance create failed"
                );
                let _ = self
                    .registry
                    .update_status(&id, InstanceStatus::Failed, Some(reason))
                    .await;
                self.record_failure(&id).await;
                false
            }
        }
    }

    /// Retries failed current-revision instances once their backoff
    /// window is open. Liveness-lost instances are reaped instead; the
    /// resulting deficit replaces them on a later pass.
    async fn retry_failed(
        &self,
        workload: &VersionedWorkload,
        cur: &[InstanceView],
        by_id: &HashMap<InstanceId, InstanceRecord>,
    ) -> u32 {
        let mut retried = 0;
        for view in cur {
            if view.status != InstanceStatus::Failed {
                continue;
            }
            let record = &by_id[&view.id];
            if record.alerted {
                // Retry budget spent; reported, awaiting the operator.
                continue;
            }

            match record.failure_reason {
                Some(FailureReason::LivenessLost) => {
                    if self.terminate_instance(record).await {
                        retried += 1;
                    }
                }
                _ => {
                    if !self.should_retry(&record.id).await {
                        continue;
                    }
                    match self.call_create(workload, record.id).await {
                        Ok(()) => {
                            let _ = self
                                .registry
                                .update_status(&record.id, InstanceStatus::Starting, None)
                                .await;
                            retried += 1;
                        }
                        Err(reason) => {
                            debug!(
                                instance_id = %record.id,
                                reason = %reason,
                                "Instance create retry failed"
                            );
                            self.record_failure(&record.id).await;
                        }
                    }
                }
            }
        }
        retried
    }

    /// Terminates one instance. Returns true once the runtime
    /// acknowledged; a failed call leaves the record Terminating for a
    /// later retry.
    async fn terminate_instance(&self, record: &InstanceRecord) -> bool {
        if record.status != InstanceStatus::Terminating {
            if self
                .registry
                .update_status(&record.id, InstanceStatus::Terminating, None)
                .await
                .is_err()
            {
                return false;
            }
        }

        let call = timeout(self.runtime_timeout, self.runtime.terminate(record.id)).await;
        match call {
            Ok(Ok(())) => {
                let _ = self
                    .registry
                    .update_status(&record.id, InstanceStatus::Terminated, None)
                    .await;
                {
                    let mut backoff = self.backoff.lock().await;
                    backoff.clear(&record.id);
                }
                let draft = EventDraft::new(event_types::INSTANCE_TERMINATED, ActorType::System)
                    .workload(record.owner)
                    .instance(record.id)
                    .payload(&InstanceTerminatedPayload {
                        instance_id: record.id,
                        workload_id: record.owner,
                    });
                if let Ok(draft) = draft {
                    self.events.append(draft).await;
                }
                true
            }
            Ok(Err(e)) => {
                warn!(instance_id = %record.id, error = %e, "Instance terminate failed");
                let _ = self
                    .registry
                    .set_failure_reason(&record.id, FailureReason::TerminateFailed)
                    .await;
                self.record_failure(&record.id).await;
                false
            }
            Err(_) => {
                warn!(instance_id = %record.id, "Instance terminate timed out");
                let _ = self
                    .registry
                    .set_failure_reason(&record.id, FailureReason::RuntimeTimeout)
                    .await;
                self.record_failure(&record.id).await;
                false
            }
        }
    }

    /// Issues a bounded-timeout create call. A timeout is
    /// failed-and-retriable, never assumed to have succeeded; the
    /// runtime deduplicates a repeated create for the same id.
    async fn call_create(
        &self,
        workload: &VersionedWorkload,
        id: InstanceId,
    ) -> Result<(), FailureReason> {
        let call = timeout(
            self.runtime_timeout,
            self.runtime
                .create(id, &workload.spec.template, &workload.spec.labels),
        )
        .await;
        match call {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FailureReason::CreateFailed),
            Err(_) => Err(FailureReason::RuntimeTimeout),
        }
    }

    async fn append_created_event(&self, workload: &VersionedWorkload, id: InstanceId) {
        let draft = EventDraft::new(event_types::INSTANCE_CREATED, ActorType::System)
            .workload(workload.id)
            .instance(id)
            .payload(&InstanceCreatedPayload {
                instance_id: id,
                workload_id: workload.id,
                revision: workload.revision.as_str().to_string(),
            });
        if let Ok(draft) = draft {
            self.events.append(draft).await;
        }
    }

    async fn should_retry(&self, id: &InstanceId) -> bool {
        let backoff = self.backoff.lock().await;
        !backoff.is_blocked(id) && !backoff.is_exhausted(id)
    }

    async fn record_failure(&self, id: &InstanceId) {
        let exhausted = {
            let mut backoff = self.backoff.lock().await;
            backoff.record_failure(*id) == RetryDecision::Exhausted
        };
        if exhausted {
            warn!(instance_id = %id, "Retry budget exhausted, alerting");
            let _ = self.registry.mark_alerted(id).await;
        }
    }
}

fn count_status(views: &[InstanceView], status: InstanceStatus) -> u32 {
    views.iter().filter(|v| v.status == status).count() as u32
}
