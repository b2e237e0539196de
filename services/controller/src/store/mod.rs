//! Desired-state and observed-state stores.
//!
//! Desired state (what should exist) lives in [`WorkloadStore`] under
//! versioned optimistic writes. Observed state (what does exist) lives
//! in [`InstanceRegistry`] and is updated only by the reconciler and the
//! health monitor. The two are independently lockable; nothing else in
//! the controller holds mutable state.

mod registry;
mod workload;

pub use registry::{InstanceRecord, InstanceRegistry, RegistryError};
pub use workload::{
    AutoscaleBounds, RevisionEntry, StoreError, ValidationError, VersionedWorkload, WorkloadSpec,
    WorkloadStore,
};
