//! Convergence math for the fleetd reconciliation loop.
//!
//! Everything in this crate is pure: given the same desired state and the
//! same observed instance set, every function returns the same answer.
//! The controller service owns all I/O; this crate owns the decisions.
//!
//! - [`RevisionHash`] — content hash of an instance template, used to
//!   tell current-revision instances from superseded ones.
//! - [`classify_instances`] / [`termination_order`] — partitioning and
//!   deterministic surplus selection over observed instances.
//! - [`RolloutPolicy`] — the surge/unavailable envelope and the stepwise
//!   rolling-update calculator.
//! - [`Backoff`] — capped exponential per-instance retry bookkeeping.
//!
//! # Invariants
//!
//! - Decisions are deterministic for a fixed input set
//! - A step never plans more terminations than the computed surplus
//! - Availability never drops below `target - max_unavailable`, and the
//!   active fleet never grows past `target + max_surge`

mod backoff;
mod revision;
mod rollout;
mod selection;

pub use backoff::{Backoff, RetryDecision};
pub use revision::RevisionHash;
pub use rollout::{FleetCounts, PolicyError, RolloutPolicy, StepPlan};
pub use selection::{classify_instances, termination_order, InstanceView};
