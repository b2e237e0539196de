//! Rolling-update step calculation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rollout policy errors, rejected at the write boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// With both bounds zero a rollout could neither surge nor retire.
    #[error("max_surge and max_unavailable cannot both be zero")]
    BothBoundsZero,
}

/// Bounds on how far a rollout may deviate from the target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Maximum number of instances allowed above the target count.
    pub max_surge: u32,

    /// Maximum number of ready instances that may be missing below the
    /// target count mid-rollout.
    pub max_unavailable: u32,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Observed per-revision instance counts for one workload.
///
/// `pending_cur` covers Pending and Starting; `failed_cur` is tracked
/// separately because failed instances occupy a slot (they are owned and
/// non-terminal) without contributing availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub ready_cur: u32,
    pub pending_cur: u32,
    pub failed_cur: u32,
    pub active_old: u32,
    pub ready_old: u32,
}

impl FleetCounts {
    /// Every owned instance in a non-terminal, non-terminating status.
    pub fn total_active(&self) -> u32 {
        self.ready_cur + self.pending_cur + self.failed_cur + self.active_old
    }

    /// Ready instances across both revisions.
    pub fn total_ready(&self) -> u32 {
        self.ready_cur + self.ready_old
    }
}

/// One reconciliation step's worth of corrective actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepPlan {
    /// Current-revision instances to create this step.
    pub create_new: u32,

    /// Ready old-revision instances that may be retired this step
    /// without dropping below the availability floor.
    pub retire_old: u32,
}

impl StepPlan {
    /// Returns true when the step has nothing to do.
    pub fn is_noop(&self) -> bool {
        self.create_new == 0 && self.retire_old == 0
    }
}

impl RolloutPolicy {
    /// Validates the policy. Both bounds zero would deadlock a rollout.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_surge == 0 && self.max_unavailable == 0 {
            return Err(PolicyError::BothBoundsZero);
        }
        Ok(())
    }

    /// Calculates one rollout step from observed counts.
    ///
    /// The step honors two bounds at every intermediate state:
    /// - total active instances never exceed `target + max_surge`
    /// - ready instances (either revision) never drop below
    ///   `target - max_unavailable`
    ///
    /// Old-revision instances that are not ready may always be retired;
    /// only ready ones are rationed here. The same math covers the
    /// no-rollout case (`active_old == 0`): it reduces to creating the
    /// deficit, and surplus handling is the caller's job via
    /// [`crate::termination_order`].
    pub fn calculate_step(&self, target: u32, counts: &FleetCounts) -> StepPlan {
        // How many current-revision instances are still needed.
        let have_cur = counts.ready_cur + counts.pending_cur + counts.failed_cur;
        let need = target.saturating_sub(have_cur);

        // How many we may create without breaching the surge ceiling.
        let ceiling = target + self.max_surge;
        let room = ceiling.saturating_sub(counts.total_active());
        let create_new = need.min(room);

        // How many ready old instances may be retired while staying at or
        // above the availability floor.
        let floor = target.saturating_sub(self.max_unavailable);
        let can_retire = counts.total_ready().saturating_sub(floor);
        let retire_old = can_retire.min(counts.ready_old);

        StepPlan {
            create_new,
            retire_old,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn counts(ready_cur: u32, pending_cur: u32, active_old: u32, ready_old: u32) -> FleetCounts {
        FleetCounts {
            ready_cur,
            pending_cur,
            failed_cur: 0,
            active_old,
            ready_old,
        }
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let policy = RolloutPolicy {
            max_surge: 0,
            max_unavailable: 0,
        };
        assert_eq!(policy.validate(), Err(PolicyError::BothBoundsZero));
        assert!(RolloutPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_fresh_workload_creates_all() {
        let policy = RolloutPolicy::default();
        let plan = policy.calculate_step(3, &counts(0, 0, 0, 0));
        assert_eq!(plan.create_new, 3);
        assert_eq!(plan.retire_old, 0);
    }

    #[test]
    fn test_converged_is_noop() {
        let policy = RolloutPolicy::default();
        let plan = policy.calculate_step(3, &counts(3, 0, 0, 0));
        assert!(plan.is_noop());
    }

    #[rstest]
    // Rollout start: 3 ready old, surge allows one new instance.
    #[case(counts(0, 0, 3, 3), 1, 0)]
    // First new instance ready: one old may be retired.
    #[case(counts(1, 0, 3, 3), 0, 1)]
    // One old retired, room for the next new instance.
    #[case(counts(1, 0, 2, 2), 1, 1)]
    // Fully rolled: nothing left to do once old is gone.
    #[case(counts(3, 0, 0, 0), 0, 0)]
    fn test_surge_one_unavailable_one(
        #[case] observed: FleetCounts,
        #[case] expect_create: u32,
        #[case] expect_retire: u32,
    ) {
        let policy = RolloutPolicy {
            max_surge: 1,
            max_unavailable: 1,
        };
        let plan = policy.calculate_step(3, &observed);
        assert_eq!(plan.create_new, expect_create);
        assert_eq!(plan.retire_old, expect_retire);
    }

    #[test]
    fn test_zero_surge_retires_before_creating() {
        let policy = RolloutPolicy {
            max_surge: 0,
            max_unavailable: 1,
        };
        // No headroom: must retire one old before a new one can start.
        let plan = policy.calculate_step(3, &counts(0, 0, 3, 3));
        assert_eq!(plan.create_new, 0);
        assert_eq!(plan.retire_old, 1);
    }

    #[test]
    fn test_zero_unavailable_never_drops_below_target() {
        let policy = RolloutPolicy {
            max_surge: 1,
            max_unavailable: 0,
        };
        // 3 old ready, surge slot free: create one, retire nothing yet.
        let plan = policy.calculate_step(3, &counts(0, 0, 3, 3));
        assert_eq!(plan.create_new, 1);
        assert_eq!(plan.retire_old, 0);

        // New one came up: now exactly one old may go.
        let plan = policy.calculate_step(3, &counts(1, 0, 3, 3));
        assert_eq!(plan.retire_old, 1);
    }

    #[test]
    fn test_failed_instances_occupy_slots() {
        let policy = RolloutPolicy::default();
        let observed = FleetCounts {
            ready_cur: 2,
            pending_cur: 0,
            failed_cur: 1,
            active_old: 0,
            ready_old: 0,
        };
        // The failed instance holds its slot; no extra create.
        let plan = policy.calculate_step(3, &observed);
        assert_eq!(plan.create_new, 0);
    }

    #[test]
    fn test_retire_capped_by_ready_old() {
        let policy = RolloutPolicy {
            max_surge: 3,
            max_unavailable: 3,
        };
        // Floor is 0, but only 2 ready old exist to retire.
        let plan = policy.calculate_step(3, &counts(3, 0, 2, 2));
        assert_eq!(plan.retire_old, 2);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_step_respects_bounds(
                target in 0u32..20,
                surge in 0u32..5,
                unavail in 0u32..5,
                ready_cur in 0u32..20,
                pending_cur in 0u32..20,
                ready_old in 0u32..20,
                extra_old in 0u32..5,
            ) {
                let policy = RolloutPolicy { max_surge: surge, max_unavailable: unavail };
                let observed = FleetCounts {
                    ready_cur,
                    pending_cur,
                    failed_cur: 0,
                    active_old: ready_old + extra_old,
                    ready_old,
                };
                let plan = policy.calculate_step(target, &observed);

                // Creations never push the active fleet past the ceiling
                // (when it is not already past it from the outside).
                if observed.total_active() <= target + surge {
                    prop_assert!(observed.total_active() + plan.create_new <= target + surge);
                }

                // Retiring the planned old instances keeps readiness at or
                // above the floor (when it started at or above it).
                let floor = target.saturating_sub(unavail);
                if observed.total_ready() >= floor {
                    prop_assert!(observed.total_ready() - plan.retire_old >= floor);
                }

                // Never retire more than exist.
                prop_assert!(plan.retire_old <= observed.ready_old);
            }
        }
    }
}
