//! Instance registry: authoritative record of observed instances.
//!
//! Ownership is a stored back-reference (the owner's workload id); a
//! workload holds no list of its instances and derives membership by
//! querying the registry with its selector. That keeps every layer
//! rebuildable from a registry scan alone.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use fleet_events::{FailureReason, InstanceStatus};
use fleet_id::{InstanceId, WorkloadId};
use fleet_reconcile::RevisionHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

/// One observed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,

    /// Owner back-reference; never a pointer.
    pub owner: WorkloadId,

    /// Owner's name at creation time, for log and status readability.
    pub owner_name: String,

    /// Template revision this instance was created from.
    pub revision: RevisionHash,

    /// Labels stamped from the workload at creation; superset of the
    /// owner's selector.
    pub labels: BTreeMap<String, String>,

    pub status: InstanceStatus,

    /// Traffic eligibility, orthogonal to lifecycle status.
    pub traffic_ready: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// Set when the retry budget is spent; the record is reported and
    /// left for operator intervention.
    pub alerted: bool,

    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(
        owner: WorkloadId,
        owner_name: &str,
        revision: RevisionHash,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            owner,
            owner_name: owner_name.to_string(),
            revision,
            labels,
            status: InstanceStatus::Pending,
            traffic_ready: false,
            failure_reason: None,
            alerted: false,
            created_at: Utc::now(),
        }
    }

    /// True when every selector predicate matches this record's labels.
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

/// Concurrent instance-record store.
pub struct InstanceRegistry {
    records: RwLock<HashMap<InstanceId, InstanceRecord>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, record: InstanceRecord) {
        let mut records = self.records.write().await;
        records.insert(record.id, record);
    }

    pub async fn get(&self, id: &InstanceId) -> Option<InstanceRecord> {
        let records = self.records.read().await;
        records.get(id).cloned()
    }

    /// Instances owned by a workload and matching its selector, in any
    /// non-terminal status.
    pub async fn owned_by(
        &self,
        owner: WorkloadId,
        selector: &BTreeMap<String, String>,
    ) -> Vec<InstanceRecord> {
        let records = self.records.read().await;
        let mut owned: Vec<_> = records
            .values()
            .filter(|r| r.owner == owner && !r.status.is_terminal() && r.matches_selector(selector))
            .cloned()
            .collect();
        owned.sort_by_key(|r| r.id);
        owned
    }

    /// All records for a workload, including terminated ones not yet
    /// collected. For the observation boundary.
    pub async fn all_owned_by(&self, owner: WorkloadId) -> Vec<InstanceRecord> {
        let records = self.records.read().await;
        let mut owned: Vec<_> = records
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        owned.sort_by_key(|r| r.id);
        owned
    }

    /// Records the health monitor should probe: anything alive that is
    /// not already on its way out.
    pub async fn probe_targets(&self) -> Vec<InstanceRecord> {
        let records = self.records.read().await;
        let mut targets: Vec<_> = records
            .values()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect();
        targets.sort_by_key(|r| r.id);
        targets
    }

    /// Distinct owners that still have non-terminal records. Used by the
    /// orphan sweep to find owners whose workload is gone.
    pub async fn active_owners(&self) -> HashSet<WorkloadId> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.owner)
            .collect()
    }

    /// Applies a lifecycle transition, enforcing the transition table.
    /// Returns the previous status.
    pub async fn update_status(
        &self,
        id: &InstanceId,
        next: InstanceStatus,
        reason: Option<FailureReason>,
    ) -> Result<InstanceStatus, RegistryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or(RegistryError::NotFound(*id))?;

        let from = record.status;
        if from == next {
            return Ok(from);
        }
        if !from.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition { id: *id, from, to: next });
        }

        record.status = next;
        record.failure_reason = reason.or(record.failure_reason);
        if next == InstanceStatus::Ready {
            record.failure_reason = None;
        }
        if !matches!(next, InstanceStatus::Ready) {
            record.traffic_ready = false;
        }
        debug!(instance_id = %id, from = %from, to = %next, "Instance status transition");
        Ok(from)
    }

    /// Updates traffic eligibility without touching lifecycle status.
    pub async fn set_traffic_ready(&self, id: &InstanceId, ready: bool) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.traffic_ready = ready && record.status == InstanceStatus::Ready;
        Ok(())
    }

    /// Records a failure reason without a status transition (e.g. a
    /// terminate call that failed while the record stays Terminating).
    pub async fn set_failure_reason(
        &self,
        id: &InstanceId,
        reason: FailureReason,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.failure_reason = Some(reason);
        Ok(())
    }

    /// Marks a record as alerted after its retry budget is spent.
    pub async fn mark_alerted(&self, id: &InstanceId) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        record.alerted = true;
        record.failure_reason = Some(FailureReason::RetriesExhausted);
        Ok(())
    }

    /// Garbage-collects terminated records for one owner. Returns the
    /// collected ids so callers can drop retry bookkeeping.
    pub async fn gc_terminated(&self, owner: WorkloadId) -> Vec<InstanceId> {
        let mut records = self.records.write().await;
        let collected: Vec<InstanceId> = records
            .values()
            .filter(|r| r.owner == owner && r.status.is_terminal())
            .map(|r| r.id)
            .collect();
        for id in &collected {
            records.remove(id);
        }
        if !collected.is_empty() {
            debug!(owner = %owner, count = collected.len(), "Collected terminated instances");
        }
        collected
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: WorkloadId) -> InstanceRecord {
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        InstanceRecord::new(
            owner,
            "web",
            RevisionHash::from_template(&serde_json::json!({"image": "app:v1"})),
            labels,
        )
    }

    #[tokio::test]
    async fn test_owned_by_filters_selector() {
        let registry = InstanceRegistry::new();
        let owner = WorkloadId::new();
        registry.insert(record(owner)).await;
        registry.insert(record(WorkloadId::new())).await;

        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        assert_eq!(registry.owned_by(owner, &selector).await.len(), 1);

        let other_selector = BTreeMap::from([("app".to_string(), "api".to_string())]);
        assert!(registry.owned_by(owner, &other_selector).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_status_legal_path() {
        let registry = InstanceRegistry::new();
        let rec = record(WorkloadId::new());
        let id = rec.id;
        registry.insert(rec).await;

        registry
            .update_status(&id, InstanceStatus::Starting, None)
            .await
            .unwrap();
        let old = registry
            .update_status(&id, InstanceStatus::Ready, None)
            .await
            .unwrap();
        assert_eq!(old, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_update_status_rejects_illegal() {
        let registry = InstanceRegistry::new();
        let rec = record(WorkloadId::new());
        let id = rec.id;
        registry.insert(rec).await;

        let err = registry
            .update_status(&id, InstanceStatus::Terminated, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_ready_clears_failure_reason() {
        let registry = InstanceRegistry::new();
        let rec = record(WorkloadId::new());
        let id = rec.id;
        registry.insert(rec).await;

        registry
            .update_status(&id, InstanceStatus::Starting, None)
            .await
            .unwrap();
        registry
            .update_status(&id, InstanceStatus::Failed, Some(FailureReason::CreateFailed))
            .await
            .unwrap();
        registry
            .update_status(&id, InstanceStatus::Ready, None)
            .await
            .unwrap();

        let rec = registry.get(&id).await.unwrap();
        assert!(rec.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_traffic_ready_requires_ready_status() {
        let registry = InstanceRegistry::new();
        let rec = record(WorkloadId::new());
        let id = rec.id;
        registry.insert(rec).await;

        registry.set_traffic_ready(&id, true).await.unwrap();
        assert!(!registry.get(&id).await.unwrap().traffic_ready);

        registry
            .update_status(&id, InstanceStatus::Starting, None)
            .await
            .unwrap();
        registry
            .update_status(&id, InstanceStatus::Ready, None)
            .await
            .unwrap();
        registry.set_traffic_ready(&id, true).await.unwrap();
        assert!(registry.get(&id).await.unwrap().traffic_ready);
    }

    #[tokio::test]
    async fn test_gc_collects_only_terminated() {
        let registry = InstanceRegistry::new();
        let owner = WorkloadId::new();

        let live = record(owner);
        let live_id = live.id;
        registry.insert(live).await;

        let doomed = record(owner);
        let doomed_id = doomed.id;
        registry.insert(doomed).await;
        registry
            .update_status(&doomed_id, InstanceStatus::Terminating, None)
            .await
            .unwrap();
        registry
            .update_status(&doomed_id, InstanceStatus::Terminated, None)
            .await
            .unwrap();

        let collected = registry.gc_terminated(owner).await;
        assert_eq!(collected, vec![doomed_id]);
        assert!(registry.get(&live_id).await.is_some());
        assert!(registry.get(&doomed_id).await.is_none());
    }
}
