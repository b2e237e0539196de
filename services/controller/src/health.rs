//! Health monitor: turns runtime readiness signals into lifecycle
//! transitions.
//!
//! The input is a single feed of [`StatusObservation`]s; whether they
//! arrive by push (channel from the runtime) or by poll (periodic probe
//! sweep) makes no difference to the contract. Every applied transition
//! is recorded as an event and nudges the owning workload's reconciler.
//!
//! Liveness and readiness are separate concerns: a missed-liveness
//! streak flips Ready to Failed (and back on recovery), while traffic
//! eligibility is an orthogonal flag updated on every observation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{
    event_types, ActorType, EventDraft, FailureReason, InstanceStatus, InstanceStatusChangedPayload,
    ObservedReadiness,
};
use fleet_id::InstanceId;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::events::EventLog;
use crate::runtime::InstanceRuntime;
use crate::store::{InstanceRecord, InstanceRegistry};
use crate::worker::NudgeSender;

/// One readiness observation for one instance.
#[derive(Debug, Clone)]
pub struct StatusObservation {
    pub instance_id: InstanceId,
    pub observed: ObservedReadiness,
    pub at: DateTime<Utc>,
}

impl StatusObservation {
    pub fn now(instance_id: InstanceId, observed: ObservedReadiness) -> Self {
        Self {
            instance_id,
            observed,
            at: Utc::now(),
        }
    }
}

/// Applies status observations to the registry.
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    events: Arc<EventLog>,
    nudge: NudgeSender,

    /// Consecutive missed liveness signals before Ready flips to Failed.
    miss_threshold: u32,

    /// Current miss streak per instance.
    misses: Mutex<HashMap<InstanceId, u32>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        events: Arc<EventLog>,
        nudge: NudgeSender,
        miss_threshold: u32,
    ) -> Self {
        Self {
            registry,
            events,
            nudge,
            miss_threshold: miss_threshold.max(1),
            misses: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one observation. The single entrypoint for both the push
    /// and poll feeds.
    pub async fn observe(&self, observation: StatusObservation) {
        let id = observation.instance_id;
        let Some(record) = self.registry.get(&id).await else {
            debug!(instance_id = %id, "Observation for unknown instance dropped");
            return;
        };
        if matches!(
            record.status,
            InstanceStatus::Terminating | InstanceStatus::Terminated
        ) {
            return;
        }

        match observation.observed {
            ObservedReadiness::Ready => self.on_ready(&record).await,
            ObservedReadiness::NotReady | ObservedReadiness::Unknown => {
                self.on_not_ready(&record).await
            }
        }
    }

    async fn on_ready(&self, record: &InstanceRecord) {
        {
            let mut misses = self.misses.lock().await;
            misses.remove(&record.id);
        }

        match record.status {
            InstanceStatus::Pending => {
                // The runtime knows the instance before we saw the create
                // acknowledgement; walk it through Starting.
                self.transition(record, InstanceStatus::Starting, None).await;
                self.transition(record, InstanceStatus::Ready, None).await;
            }
            InstanceStatus::Starting => {
                self.transition(record, InstanceStatus::Ready, None).await;
            }
            InstanceStatus::Failed => {
                // Liveness resumed before the reconciler reaped it.
                info!(instance_id = %record.id, "Instance recovered");
                self.transition(record, InstanceStatus::Ready, None).await;
            }
            InstanceStatus::Ready => {}
            InstanceStatus::Terminating | InstanceStatus::Terminated => return,
        }

        let _ = self.registry.set_traffic_ready(&record.id, true).await;
    }

    async fn on_not_ready(&self, record: &InstanceRecord) {
        let _ = self.registry.set_traffic_ready(&record.id, false).await;

        if record.status != InstanceStatus::Ready {
            // Pending/Starting instances are allowed to be not ready;
            // Failed ones already are.
            return;
        }

        let streak = {
            let mut misses = self.misses.lock().await;
            let streak = misses.entry(record.id).or_insert(0);
            *streak += 1;
            *streak
        };

        if streak < self.miss_threshold {
            debug!(
                instance_id = %record.id,
                streak,
                threshold = self.miss_threshold,
                "Liveness miss"
            );
            return;
        }

        warn!(
            instance_id = %record.id,
            workload = %record.owner_name,
            "Liveness lost, marking failed"
        );
        {
            let mut misses = self.misses.lock().await;
            misses.remove(&record.id);
        }
        self.transition(record, InstanceStatus::Failed, Some(FailureReason::LivenessLost))
            .await;
    }

    /// Applies a transition, records the event, and nudges the owner.
    async fn transition(
        &self,
        record: &InstanceRecord,
        next: InstanceStatus,
        reason: Option<FailureReason>,
    ) {
        let old = match self.registry.update_status(&record.id, next, reason).await {
            Ok(old) => old,
            Err(e) => {
                warn!(instance_id = %record.id, error = %e, "Rejected status transition");
                return;
            }
        };
        if old == next {
            return;
        }

        let draft = EventDraft::new(event_types::INSTANCE_STATUS_CHANGED, ActorType::System)
            .workload(record.owner)
            .instance(record.id)
            .payload(&InstanceStatusChangedPayload {
                instance_id: record.id,
                workload_id: record.owner,
                old_status: old,
                new_status: next,
                reason,
            });
        if let Ok(draft) = draft {
            self.events.append(draft).await;
        }

        self.nudge.nudge(&record.owner_name);
    }

    /// Poll loop over the runtime's probe interface. Either this or a
    /// push feed (or both) may drive [`HealthMonitor::observe`].
    #[instrument(skip_all)]
    pub async fn run_poll_loop(
        self: Arc<Self>,
        runtime: Arc<dyn InstanceRuntime>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "Starting health poll loop");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(&runtime).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health poll loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One probe sweep over every live instance.
    pub async fn poll_once(&self, runtime: &Arc<dyn InstanceRuntime>) {
        for record in self.registry.probe_targets().await {
            let observed = match runtime.probe(record.id).await {
                Ok(observed) => observed,
                Err(e) => {
                    debug!(instance_id = %record.id, error = %e, "Probe failed");
                    ObservedReadiness::Unknown
                }
            };
            self.observe(StatusObservation::now(record.id, observed)).await;
        }
    }

    /// Push loop draining a channel of runtime-originated observations.
    #[instrument(skip_all)]
    pub async fn run_push_loop(
        self: Arc<Self>,
        mut feed: mpsc::UnboundedReceiver<StatusObservation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(observation) = feed.recv() => {
                    self.observe(observation).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health push loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
