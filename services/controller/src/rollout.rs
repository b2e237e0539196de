//! Rollout controller: the per-workload rollout state machine.
//!
//! Phases: `Idle → Progressing → {Succeeded, RolledBack} → Idle`.
//! Entry to Progressing is observed, not commanded: the reconcile pass
//! reports the desired revision and the presence of superseded
//! instances, and the controller walks the machine. Step sizing itself
//! is the reconciler's job via [`fleet_reconcile::RolloutPolicy`]; this
//! module owns phase bookkeeping, progress tracking, and stall
//! reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_events::{
    event_types, ActorType, EventDraft, RevisionOutcome, RolloutPhase, RolloutRolledBackPayload,
    RolloutStalledPayload, RolloutStartedPayload, RolloutStepPayload, RolloutSucceededPayload,
};
use fleet_id::WorkloadId;
use fleet_reconcile::RevisionHash;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::events::EventLog;
use crate::store::{VersionedWorkload, WorkloadStore};

#[derive(Debug, Clone)]
struct RolloutState {
    phase: RolloutPhase,
    target_revision: RevisionHash,
    is_rollback: bool,
    last_ready: u32,
    last_progress: Instant,
    stall_reported: bool,
}

impl RolloutState {
    fn new(target_revision: RevisionHash) -> Self {
        Self {
            phase: RolloutPhase::Idle,
            target_revision,
            is_rollback: false,
            last_ready: 0,
            last_progress: Instant::now(),
            stall_reported: false,
        }
    }
}

/// Tracks rollout phase per workload and reports stalls.
pub struct RolloutController {
    store: Arc<WorkloadStore>,
    events: Arc<EventLog>,
    stall_budget: Duration,
    states: RwLock<HashMap<WorkloadId, RolloutState>>,
}

impl RolloutController {
    pub fn new(store: Arc<WorkloadStore>, events: Arc<EventLog>, stall_budget: Duration) -> Self {
        Self {
            store,
            events,
            stall_budget,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Observes one workload at the start of a reconcile pass and drives
    /// the phase machine. Returns the current phase.
    ///
    /// `active_old` / `ready_cur` are the observed counts for superseded
    /// and current-revision instances respectively.
    pub async fn observe(
        &self,
        workload: &VersionedWorkload,
        active_old: u32,
        ready_cur: u32,
    ) -> RolloutPhase {
        let mut states = self.states.write().await;
        let state = states
            .entry(workload.id)
            .or_insert_with(|| RolloutState::new(workload.revision.clone()));

        // A re-targeted revision starts a new rollout, in either direction.
        if state.target_revision != workload.revision {
            let from = state.target_revision.clone();
            state.target_revision = workload.revision.clone();
            state.phase = RolloutPhase::Progressing;
            state.last_progress = Instant::now();
            state.stall_reported = false;
            info!(
                workload = %workload.spec.name,
                from = %from,
                to = %workload.revision,
                rollback = state.is_rollback,
                "Rollout started"
            );
            let draft = EventDraft::new(event_types::ROLLOUT_STARTED, ActorType::System)
                .workload(workload.id)
                .payload(&RolloutStartedPayload {
                    workload_id: workload.id,
                    from_revision: Some(from.as_str().to_string()),
                    to_revision: workload.revision.as_str().to_string(),
                });
            if let Ok(draft) = draft {
                self.events.append(draft).await;
            }
        } else if state.phase == RolloutPhase::Idle && active_old > 0 {
            // Old-revision instances observed without a recorded start
            // (controller restart mid-rollout): resume Progressing.
            state.phase = RolloutPhase::Progressing;
            state.last_progress = Instant::now();
            state.stall_reported = false;
        }

        // Readiness gains count as forward progress.
        if ready_cur > state.last_ready {
            state.last_progress = Instant::now();
            state.stall_reported = false;
        }
        state.last_ready = ready_cur;

        // Completion: no superseded instances left and the fleet is fully
        // ready on the target revision.
        if state.phase == RolloutPhase::Progressing
            && active_old == 0
            && ready_cur >= workload.spec.replicas
        {
            let (phase, event_type) = if state.is_rollback {
                (RolloutPhase::RolledBack, event_types::ROLLOUT_ROLLED_BACK)
            } else {
                (RolloutPhase::Succeeded, event_types::ROLLOUT_SUCCEEDED)
            };
            state.phase = phase;
            state.is_rollback = false;
            info!(
                workload = %workload.spec.name,
                revision = %workload.revision,
                phase = %phase,
                "Rollout complete"
            );

            let draft = match phase {
                RolloutPhase::RolledBack => EventDraft::new(event_type, ActorType::System)
                    .workload(workload.id)
                    .payload(&RolloutRolledBackPayload {
                        workload_id: workload.id,
                        revision: workload.revision.as_str().to_string(),
                    }),
                _ => EventDraft::new(event_type, ActorType::System)
                    .workload(workload.id)
                    .payload(&RolloutSucceededPayload {
                        workload_id: workload.id,
                        revision: workload.revision.as_str().to_string(),
                    }),
            };
            if let Ok(draft) = draft {
                self.events.append(draft).await;
            }

            let _ = self
                .store
                .set_revision_outcome(
                    &workload.spec.name,
                    &workload.revision,
                    RevisionOutcome::Succeeded,
                )
                .await;
        }

        state.phase
    }

    /// Records successful corrective actions as forward progress and
    /// emits a step event while a rollout is in flight.
    pub async fn note_progress(&self, workload: &VersionedWorkload, created: u32, retired: u32) {
        if created == 0 && retired == 0 {
            return;
        }

        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(&workload.id) else {
            return;
        };
        state.last_progress = Instant::now();
        state.stall_reported = false;

        if state.phase == RolloutPhase::Progressing {
            let draft = EventDraft::new(event_types::ROLLOUT_STEP, ActorType::System)
                .workload(workload.id)
                .payload(&RolloutStepPayload {
                    workload_id: workload.id,
                    created,
                    retired,
                });
            if let Ok(draft) = draft {
                self.events.append(draft).await;
            }
        }
    }

    /// Reports a stalled rollout once per quiet period. The phase stays
    /// Progressing; recovery or rollback is the operator's call.
    pub async fn check_stalled(&self, workload: &VersionedWorkload) {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(&workload.id) else {
            return;
        };
        if state.phase != RolloutPhase::Progressing || state.stall_reported {
            return;
        }

        let quiet = state.last_progress.elapsed();
        if quiet <= self.stall_budget {
            return;
        }

        state.stall_reported = true;
        warn!(
            workload = %workload.spec.name,
            revision = %workload.revision,
            quiet_secs = quiet.as_secs(),
            "Rollout stalled"
        );
        let draft = EventDraft::new(event_types::ROLLOUT_STALLED, ActorType::System)
            .workload(workload.id)
            .payload(&RolloutStalledPayload {
                workload_id: workload.id,
                revision: workload.revision.as_str().to_string(),
                seconds_without_progress: quiet.as_secs(),
            });
        if let Ok(draft) = draft {
            self.events.append(draft).await;
        }
    }

    /// Marks the in-flight transition as a rollback so completion lands
    /// on RolledBack instead of Succeeded.
    pub async fn mark_rollback(&self, id: WorkloadId) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&id) {
            state.is_rollback = true;
        }
    }

    /// Deleting a workload cancels its rollout.
    pub async fn on_deleted(&self, id: WorkloadId) {
        let mut states = self.states.write().await;
        states.remove(&id);
    }

    /// Current phase for a workload. Idle when never observed.
    pub async fn phase(&self, id: WorkloadId) -> RolloutPhase {
        let states = self.states.read().await;
        states.get(&id).map(|s| s.phase).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkloadSpec;
    use fleet_reconcile::RolloutPolicy;
    use std::collections::BTreeMap;

    async fn setup() -> (Arc<WorkloadStore>, Arc<EventLog>, RolloutController) {
        let store = Arc::new(WorkloadStore::new(10));
        let events = Arc::new(EventLog::new());
        let controller =
            RolloutController::new(Arc::clone(&store), Arc::clone(&events), Duration::from_secs(60));
        (store, events, controller)
    }

    fn spec(image: &str) -> WorkloadSpec {
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        WorkloadSpec {
            name: "web".to_string(),
            replicas: 3,
            template: serde_json::json!({ "image": image }),
            selector: labels.clone(),
            labels,
            rollout: RolloutPolicy::default(),
            autoscale: None,
        }
    }

    #[tokio::test]
    async fn test_revision_change_enters_progressing() {
        let (store, _events, controller) = setup().await;
        let v1 = store.apply(spec("app:v1")).await.unwrap().workload;

        // Converged on v1: stays idle.
        let phase = controller.observe(&v1, 0, 3).await;
        assert_eq!(phase, RolloutPhase::Idle);

        let v2 = store.apply(spec("app:v2")).await.unwrap().workload;
        let phase = controller.observe(&v2, 3, 0).await;
        assert_eq!(phase, RolloutPhase::Progressing);
    }

    #[tokio::test]
    async fn test_completion_succeeds() {
        let (store, _events, controller) = setup().await;
        let v1 = store.apply(spec("app:v1")).await.unwrap().workload;
        controller.observe(&v1, 0, 3).await;

        let v2 = store.apply(spec("app:v2")).await.unwrap().workload;
        controller.observe(&v2, 3, 0).await;

        // Old gone, target fully ready: Succeeded.
        let phase = controller.observe(&v2, 0, 3).await;
        assert_eq!(phase, RolloutPhase::Succeeded);

        let history = store.history("web").await.unwrap();
        let entry = history
            .iter()
            .find(|e| e.revision == v2.revision)
            .unwrap();
        assert!(matches!(entry.outcome, RevisionOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_rollback_completion_lands_on_rolled_back() {
        let (store, _events, controller) = setup().await;
        let v1 = store.apply(spec("app:v1")).await.unwrap().workload;
        controller.observe(&v1, 0, 3).await;
        let v2 = store.apply(spec("app:v2")).await.unwrap().workload;
        controller.observe(&v2, 3, 0).await;
        controller.observe(&v2, 0, 3).await;

        let rolled = store.rollback("web", v1.revision.as_str()).await.unwrap();
        controller.mark_rollback(rolled.id).await;
        let phase = controller.observe(&rolled, 3, 0).await;
        assert_eq!(phase, RolloutPhase::Progressing);

        let phase = controller.observe(&rolled, 0, 3).await;
        assert_eq!(phase, RolloutPhase::RolledBack);
    }

    #[tokio::test]
    async fn test_stall_reported_once() {
        let (store, events, _) = setup().await;
        let controller = RolloutController::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Duration::from_millis(1),
        );

        let v1 = store.apply(spec("app:v1")).await.unwrap().workload;
        controller.observe(&v1, 0, 3).await;
        let v2 = store.apply(spec("app:v2")).await.unwrap().workload;
        controller.observe(&v2, 3, 0).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.check_stalled(&v2).await;
        controller.check_stalled(&v2).await;

        let stalls: Vec<_> = events
            .read_after(fleet_id::EventId::ZERO)
            .await
            .into_iter()
            .filter(|e| e.event_type == event_types::ROLLOUT_STALLED)
            .collect();
        assert_eq!(stalls.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_resets_to_idle() {
        let (store, _events, controller) = setup().await;
        let v1 = store.apply(spec("app:v1")).await.unwrap().workload;
        controller.observe(&v1, 0, 3).await;
        let v2 = store.apply(spec("app:v2")).await.unwrap().workload;
        controller.observe(&v2, 3, 0).await;

        controller.on_deleted(v2.id).await;
        assert_eq!(controller.phase(v2.id).await, RolloutPhase::Idle);
    }
}
