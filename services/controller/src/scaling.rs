//! Scaling controller: the only writer of desired replica counts.
//!
//! Direct scale requests and metric-driven policy decisions both land
//! here; both write through the workload store under the version-token
//! discipline and never touch the runtime. Creating and terminating
//! instances stays the reconciler's job alone.

use std::sync::Arc;

use fleet_events::{event_types, ActorType, EventDraft, WorkloadScaledPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::EventLog;
use crate::store::{StoreError, WorkloadStore};

/// How often a conflicting write is retried before giving up. Conflicts
/// only come from concurrent writers, so a couple of re-reads settle it.
const CONFLICT_RETRIES: u32 = 5;

/// One observation handed to a scaling policy. Metric sourcing is an
/// external concern; the controller only consumes the sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSample {
    /// Observed average utilization across the workload's fleet, in
    /// percent of the provisioned capacity.
    pub utilization_percent: u32,
}

/// A pluggable scaling decision.
pub trait ScalingPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Maps an observation to a new desired count. The controller clamps
    /// the result to the workload's autoscale bounds.
    fn evaluate(&self, current_desired: u32, sample: &MetricSample) -> u32;
}

/// Scale so observed utilization lands on the target: desired grows in
/// proportion to how far over target the fleet is running.
#[derive(Debug, Clone, Copy)]
pub struct TargetUtilizationPolicy {
    pub target_percent: u32,
}

impl ScalingPolicy for TargetUtilizationPolicy {
    fn name(&self) -> &str {
        "target-utilization"
    }

    fn evaluate(&self, current_desired: u32, sample: &MetricSample) -> u32 {
        if self.target_percent == 0 || current_desired == 0 {
            return current_desired;
        }
        // ceil(current * observed / target)
        let scaled = current_desired as u64 * sample.utilization_percent as u64;
        (scaled.div_ceil(self.target_percent as u64)) as u32
    }
}

/// Mutates desired replica counts through the workload store.
pub struct ScalingController {
    store: Arc<WorkloadStore>,
    events: Arc<EventLog>,
}

impl ScalingController {
    pub fn new(store: Arc<WorkloadStore>, events: Arc<EventLog>) -> Self {
        Self { store, events }
    }

    /// Sets the desired replica count. Returns the previous count.
    ///
    /// Retries on version conflict by re-reading, per the optimistic
    /// write discipline. Negative counts are unrepresentable by type.
    pub async fn set_desired_replicas(
        &self,
        name: &str,
        replicas: u32,
        actor: ActorType,
    ) -> Result<u32, StoreError> {
        let mut attempt = 0;
        loop {
            let current = self
                .store
                .get(name)
                .await
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            let old_replicas = current.spec.replicas;
            if old_replicas == replicas {
                return Ok(old_replicas);
            }

            match self
                .store
                .update(name, current.version, |spec| spec.replicas = replicas)
                .await
            {
                Ok(updated) => {
                    info!(
                        workload = %name,
                        old = old_replicas,
                        new = replicas,
                        actor = %actor,
                        "Desired replicas changed"
                    );
                    let draft = EventDraft::new(event_types::WORKLOAD_SCALED, actor)
                        .workload(updated.id)
                        .payload(&WorkloadScaledPayload {
                            workload_id: updated.id,
                            name: name.to_string(),
                            old_replicas,
                            new_replicas: replicas,
                        });
                    if let Ok(draft) = draft {
                        self.events.append(draft).await;
                    }
                    return Ok(old_replicas);
                }
                Err(StoreError::Conflict { .. }) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(workload = %name, attempt, "Scale write conflicted, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evaluates a scaling policy against a metric sample and applies
    /// the clamped decision. Returns the new desired count when it
    /// changed, `None` when the workload has no autoscale bounds or the
    /// decision was a no-op.
    pub async fn evaluate_policy(
        &self,
        name: &str,
        policy: &dyn ScalingPolicy,
        sample: &MetricSample,
    ) -> Result<Option<u32>, StoreError> {
        let current = self
            .store
            .get(name)
            .await
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let Some(bounds) = current.spec.autoscale else {
            return Ok(None);
        };

        let raw = policy.evaluate(current.spec.replicas, sample);
        let clamped = raw.clamp(bounds.min_replicas, bounds.max_replicas);
        debug!(
            workload = %name,
            policy = policy.name(),
            utilization = sample.utilization_percent,
            raw,
            clamped,
            "Scaling policy evaluated"
        );

        if clamped == current.spec.replicas {
            return Ok(None);
        }

        self.set_desired_replicas(name, clamped, ActorType::Autoscaler)
            .await?;
        Ok(Some(clamped))
    }
}
