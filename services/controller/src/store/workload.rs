//! Workload store: declared desired state plus revision history.
//!
//! The store is the single source of truth the reconciler reads from.
//! Every write validates the spec first; a malformed workload never
//! reaches the reconciliation loop. Writers that race use the version
//! token discipline: read, mutate, write with the expected version, and
//! retry on conflict.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use fleet_events::RevisionOutcome;
use fleet_id::WorkloadId;
use fleet_reconcile::{PolicyError, RevisionHash, RolloutPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Validation failures, rejected synchronously at the write boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workload name cannot be empty")]
    EmptyName,

    #[error("selector cannot be empty")]
    EmptySelector,

    #[error("selector {key}={expected} does not match workload label {actual:?}")]
    SelectorMismatch {
        key: String,
        expected: String,
        actual: Option<String>,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("autoscale bounds inverted: min {min} > max {max}")]
    AutoscaleBoundsInverted { min: u32, max: u32 },
}

/// Workload store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("version conflict on workload {name}: expected {expected}, current {current}")]
    Conflict {
        name: String,
        expected: u64,
        current: u64,
    },

    #[error("unknown revision {revision} for workload {name}")]
    UnknownRevision { name: String, revision: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Bounds for the metric-driven scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscaleBounds {
    pub min_replicas: u32,
    pub max_replicas: u32,
}

/// A declared workload: desired replica count plus instance template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Unique name, operator-chosen.
    pub name: String,

    /// Desired replica count.
    pub replicas: u32,

    /// Opaque template handed to the runtime on create.
    pub template: serde_json::Value,

    /// Labels stamped onto every instance created from the template.
    pub labels: BTreeMap<String, String>,

    /// Label predicates identifying instances owned by this workload.
    /// Must be a subset of `labels`.
    pub selector: BTreeMap<String, String>,

    /// Rollout bounds for template transitions.
    pub rollout: RolloutPolicy,

    /// Autoscaling clamp, if a scaling policy is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<AutoscaleBounds>,
}

impl WorkloadSpec {
    /// Validates the spec. Called on every write path.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.selector.is_empty() {
            return Err(ValidationError::EmptySelector);
        }
        for (key, expected) in &self.selector {
            let actual = self.labels.get(key);
            if actual != Some(expected) {
                return Err(ValidationError::SelectorMismatch {
                    key: key.clone(),
                    expected: expected.clone(),
                    actual: actual.cloned(),
                });
            }
        }
        self.rollout.validate()?;
        if let Some(bounds) = &self.autoscale {
            if bounds.min_replicas > bounds.max_replicas {
                return Err(ValidationError::AutoscaleBoundsInverted {
                    min: bounds.min_replicas,
                    max: bounds.max_replicas,
                });
            }
        }
        Ok(())
    }
}

/// One entry in a workload's revision history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub revision: RevisionHash,
    pub template: serde_json::Value,
    pub outcome: RevisionOutcome,
    pub created_at: DateTime<Utc>,
}

/// A read of a workload, carrying the version token for optimistic
/// concurrency.
#[derive(Debug, Clone)]
pub struct VersionedWorkload {
    pub id: WorkloadId,
    pub spec: WorkloadSpec,
    pub revision: RevisionHash,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredWorkload {
    id: WorkloadId,
    spec: WorkloadSpec,
    revision: RevisionHash,
    version: u64,
    created_at: DateTime<Utc>,
    history: Vec<RevisionEntry>,
}

impl StoredWorkload {
    fn versioned(&self) -> VersionedWorkload {
        VersionedWorkload {
            id: self.id,
            spec: self.spec.clone(),
            revision: self.revision.clone(),
            version: self.version,
            created_at: self.created_at,
        }
    }
}

/// Result of applying a spec: the stored workload plus what changed.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub workload: VersionedWorkload,
    pub created: bool,
    pub previous_revision: Option<RevisionHash>,
}

/// In-memory workload store with versioned optimistic writes.
pub struct WorkloadStore {
    workloads: RwLock<HashMap<String, StoredWorkload>>,
    revision_retention: usize,
}

impl WorkloadStore {
    pub fn new(revision_retention: usize) -> Self {
        Self {
            workloads: RwLock::new(HashMap::new()),
            revision_retention: revision_retention.max(1),
        }
    }

    /// Upserts a workload spec. A changed template hash re-targets the
    /// workload's current revision and appends a history entry.
    pub async fn apply(&self, spec: WorkloadSpec) -> Result<ApplyOutcome, StoreError> {
        spec.validate()?;
        let revision = RevisionHash::from_template(&spec.template);

        let mut workloads = self.workloads.write().await;
        match workloads.get_mut(&spec.name) {
            Some(stored) => {
                let previous_revision = if stored.revision != revision {
                    let previous = stored.revision.clone();
                    stored.history.push(RevisionEntry {
                        revision: revision.clone(),
                        template: spec.template.clone(),
                        outcome: RevisionOutcome::InProgress,
                        created_at: Utc::now(),
                    });
                    Self::prune_history(&mut stored.history, self.revision_retention);
                    stored.revision = revision;
                    Some(previous)
                } else {
                    None
                };

                stored.spec = spec;
                stored.version += 1;
                debug!(
                    workload = %stored.spec.name,
                    version = stored.version,
                    revision_changed = previous_revision.is_some(),
                    "Workload updated"
                );
                Ok(ApplyOutcome {
                    workload: stored.versioned(),
                    created: false,
                    previous_revision,
                })
            }
            None => {
                let stored = StoredWorkload {
                    id: WorkloadId::new(),
                    revision: revision.clone(),
                    version: 1,
                    created_at: Utc::now(),
                    history: vec![RevisionEntry {
                        revision,
                        template: spec.template.clone(),
                        outcome: RevisionOutcome::InProgress,
                        created_at: Utc::now(),
                    }],
                    spec,
                };
                let outcome = ApplyOutcome {
                    workload: stored.versioned(),
                    created: true,
                    previous_revision: None,
                };
                info!(
                    workload = %stored.spec.name,
                    workload_id = %stored.id,
                    replicas = stored.spec.replicas,
                    "Workload created"
                );
                workloads.insert(stored.spec.name.clone(), stored);
                Ok(outcome)
            }
        }
    }

    /// Reads one workload.
    pub async fn get(&self, name: &str) -> Option<VersionedWorkload> {
        let workloads = self.workloads.read().await;
        workloads.get(name).map(|w| w.versioned())
    }

    /// Reads one workload by its stable id.
    pub async fn get_by_id(&self, id: WorkloadId) -> Option<VersionedWorkload> {
        let workloads = self.workloads.read().await;
        workloads.values().find(|w| w.id == id).map(|w| w.versioned())
    }

    /// Lists all workloads.
    pub async fn list(&self) -> Vec<VersionedWorkload> {
        let workloads = self.workloads.read().await;
        let mut all: Vec<_> = workloads.values().map(|w| w.versioned()).collect();
        all.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        all
    }

    /// Atomic read-modify-write with a version token. The closure edits
    /// the spec in place; a stale token is rejected with
    /// [`StoreError::Conflict`] and the caller re-reads and retries.
    pub async fn update<F>(
        &self,
        name: &str,
        expected_version: u64,
        mutate: F,
    ) -> Result<VersionedWorkload, StoreError>
    where
        F: FnOnce(&mut WorkloadSpec),
    {
        let mut workloads = self.workloads.write().await;
        let stored = workloads
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                current: stored.version,
            });
        }

        let mut spec = stored.spec.clone();
        mutate(&mut spec);
        spec.validate()?;

        let revision = RevisionHash::from_template(&spec.template);
        if stored.revision != revision {
            stored.history.push(RevisionEntry {
                revision: revision.clone(),
                template: spec.template.clone(),
                outcome: RevisionOutcome::InProgress,
                created_at: Utc::now(),
            });
            Self::prune_history(&mut stored.history, self.revision_retention);
            stored.revision = revision;
        }

        stored.spec = spec;
        stored.version += 1;
        Ok(stored.versioned())
    }

    /// Deletes a workload. Owned instances become termination targets on
    /// the next reconciliation pass; the returned id is what the
    /// registry's ownership back-references point at.
    pub async fn delete(&self, name: &str) -> Result<WorkloadId, StoreError> {
        let mut workloads = self.workloads.write().await;
        let stored = workloads
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        info!(workload = %name, workload_id = %stored.id, "Workload deleted");
        Ok(stored.id)
    }

    /// Re-targets a workload at a prior revision from its history. The
    /// transition runs through the same rollout machinery as a forward
    /// template change.
    pub async fn rollback(
        &self,
        name: &str,
        revision: &str,
    ) -> Result<VersionedWorkload, StoreError> {
        let mut workloads = self.workloads.write().await;
        let stored = workloads
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let entry = stored
            .history
            .iter()
            .find(|e| e.revision.as_str() == revision)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRevision {
                name: name.to_string(),
                revision: revision.to_string(),
            })?;

        if stored.revision == entry.revision {
            // Already on this revision; nothing to do.
            return Ok(stored.versioned());
        }

        // Mark the abandoned revision before re-targeting.
        let abandoned = stored.revision.clone();
        if let Some(current) = stored.history.iter_mut().find(|e| e.revision == abandoned) {
            current.outcome = RevisionOutcome::RolledBack;
        }

        stored.spec.template = entry.template.clone();
        stored.revision = entry.revision.clone();
        stored.version += 1;
        info!(
            workload = %name,
            revision = %stored.revision,
            "Workload rolled back"
        );
        Ok(stored.versioned())
    }

    /// Records the outcome of a revision's rollout.
    pub async fn set_revision_outcome(
        &self,
        name: &str,
        revision: &RevisionHash,
        outcome: RevisionOutcome,
    ) -> Result<(), StoreError> {
        let mut workloads = self.workloads.write().await;
        let stored = workloads
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Some(entry) = stored.history.iter_mut().find(|e| &e.revision == revision) {
            entry.outcome = outcome;
        }
        Ok(())
    }

    /// Reads a workload's revision history, oldest first.
    pub async fn history(&self, name: &str) -> Result<Vec<RevisionEntry>, StoreError> {
        let workloads = self.workloads.read().await;
        let stored = workloads
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(stored.history.clone())
    }

    fn prune_history(history: &mut Vec<RevisionEntry>, retention: usize) {
        while history.len() > retention {
            history.remove(0);
        }
    }
}
