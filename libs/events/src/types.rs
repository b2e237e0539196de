//! Event type definitions for all controller events.
//!
//! Each event type has a corresponding payload struct with the
//! event-specific data. Status enums shared across the workspace live
//! here so the registry, reconciler, and health monitor agree on one
//! vocabulary.

use fleet_id::{InstanceId, WorkloadId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Workload (desired state)
    pub const WORKLOAD_APPLIED: &str = "workload.applied";
    pub const WORKLOAD_SCALED: &str = "workload.scaled";
    pub const WORKLOAD_DELETED: &str = "workload.deleted";

    // Instance (observed state)
    pub const INSTANCE_CREATED: &str = "instance.created";
    pub const INSTANCE_STATUS_CHANGED: &str = "instance.status_changed";
    pub const INSTANCE_TERMINATED: &str = "instance.terminated";

    // Rollout
    pub const ROLLOUT_STARTED: &str = "rollout.started";
    pub const ROLLOUT_STEP: &str = "rollout.step";
    pub const ROLLOUT_SUCCEEDED: &str = "rollout.succeeded";
    pub const ROLLOUT_ROLLED_BACK: &str = "rollout.rolled_back";
    pub const ROLLOUT_STALLED: &str = "rollout.stalled";
}

/// Returns true if the given string is a known event type.
pub fn is_known_event_type(event_type: &str) -> bool {
    use event_types::*;
    matches!(
        event_type,
        WORKLOAD_APPLIED
            | WORKLOAD_SCALED
            | WORKLOAD_DELETED
            | INSTANCE_CREATED
            | INSTANCE_STATUS_CHANGED
            | INSTANCE_TERMINATED
            | ROLLOUT_STARTED
            | ROLLOUT_STEP
            | ROLLOUT_SUCCEEDED
            | ROLLOUT_ROLLED_BACK
            | ROLLOUT_STALLED
    )
}

// =============================================================================
// Status Enums
// =============================================================================

/// Instance lifecycle status.
///
/// Legal transitions: Pending → Starting → Ready ⇄ Failed → Terminating
/// → Terminated. Pending/Starting may also fail or be terminated
/// directly. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    /// Returns true for statuses that will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns true for statuses that count toward the live fleet
    /// (anything not on its way out).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Ready | Self::Failed)
    }

    /// Returns true if a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Pending, Starting) | (Pending, Failed) | (Pending, Terminating) => true,
            (Starting, Ready) | (Starting, Failed) | (Starting, Terminating) => true,
            (Ready, Failed) | (Ready, Terminating) => true,
            // Failed may recover (liveness resumed) or restart (create retried).
            (Failed, Ready) | (Failed, Starting) | (Failed, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// A single readiness observation from the runtime probe feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedReadiness {
    Ready,
    NotReady,
    Unknown,
}

/// Rollout phase for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    #[default]
    Idle,
    Progressing,
    Succeeded,
    RolledBack,
}

impl RolloutPhase {
    /// Returns true if a rollout is currently in flight.
    pub fn is_progressing(&self) -> bool {
        matches!(self, Self::Progressing)
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutPhase::Idle => "idle",
            RolloutPhase::Progressing => "progressing",
            RolloutPhase::Succeeded => "succeeded",
            RolloutPhase::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

/// Outcome recorded on a revision history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionOutcome {
    InProgress,
    Succeeded,
    RolledBack,
}

/// Instance failure reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CreateFailed,
    RuntimeTimeout,
    TerminateFailed,
    LivenessLost,
    RetriesExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::CreateFailed => "create_failed",
            FailureReason::RuntimeTimeout => "runtime_timeout",
            FailureReason::TerminateFailed => "terminate_failed",
            FailureReason::LivenessLost => "liveness_lost",
            FailureReason::RetriesExhausted => "retries_exhausted",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

// -----------------------------------------------------------------------------
// Workload Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadAppliedPayload {
    pub workload_id: WorkloadId,
    pub name: String,
    pub replicas: u32,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadScaledPayload {
    pub workload_id: WorkloadId,
    pub name: String,
    pub old_replicas: u32,
    pub new_replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadDeletedPayload {
    pub workload_id: WorkloadId,
    pub name: String,
}

// -----------------------------------------------------------------------------
// Instance Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCreatedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusChangedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
    pub old_status: InstanceStatus,
    pub new_status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTerminatedPayload {
    pub instance_id: InstanceId,
    pub workload_id: WorkloadId,
}

// -----------------------------------------------------------------------------
// Rollout Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStartedPayload {
    pub workload_id: WorkloadId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_revision: Option<String>,
    pub to_revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStepPayload {
    pub workload_id: WorkloadId,
    pub created: u32,
    pub retired: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSucceededPayload {
    pub workload_id: WorkloadId,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutRolledBackPayload {
    pub workload_id: WorkloadId,
    pub revision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStalledPayload {
    pub workload_id: WorkloadId,
    pub revision: String,
    pub seconds_without_progress: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_terminal() {
        assert!(InstanceStatus::Terminated.is_terminal());
        assert!(!InstanceStatus::Terminating.is_terminal());
        assert!(!InstanceStatus::Failed.is_terminal());
    }

    #[test]
    fn test_instance_status_active() {
        assert!(InstanceStatus::Pending.is_active());
        assert!(InstanceStatus::Failed.is_active());
        assert!(!InstanceStatus::Terminating.is_active());
        assert!(!InstanceStatus::Terminated.is_active());
    }

    #[test]
    fn test_transition_table_ready_recovery() {
        // Failed instances may recover if liveness resumes.
        assert!(InstanceStatus::Failed.can_transition_to(InstanceStatus::Ready));
        assert!(InstanceStatus::Ready.can_transition_to(InstanceStatus::Failed));
    }

    #[test]
    fn test_transition_table_no_resurrection() {
        assert!(!InstanceStatus::Terminated.can_transition_to(InstanceStatus::Pending));
        assert!(!InstanceStatus::Terminated.can_transition_to(InstanceStatus::Ready));
        assert!(!InstanceStatus::Terminating.can_transition_to(InstanceStatus::Ready));
    }

    #[test]
    fn test_transition_table_no_skips() {
        // Pending may not jump straight to Ready; it must pass Starting.
        assert!(!InstanceStatus::Pending.can_transition_to(InstanceStatus::Ready));
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&InstanceStatus::Terminating).unwrap();
        assert_eq!(json, "\"terminating\"");
    }

    #[test]
    fn test_known_event_types() {
        assert!(is_known_event_type(event_types::WORKLOAD_APPLIED));
        assert!(is_known_event_type(event_types::ROLLOUT_STALLED));
        assert!(!is_known_event_type("workload.exploded"));
    }
}
