//! Typed id definitions for controller resources.
//!
//! Each id type has a unique prefix that identifies the resource kind.
//! Ids are ULID-based for sortability and uniqueness.

use crate::define_id;

// Workloads are addressed by operator-chosen name at the write boundary;
// WorkloadId is the stable internal identity, so a deleted-and-recreated
// name never resurrects ownership of the old incarnation's instances.
define_id!(WorkloadId, "wl");

define_id!(InstanceId, "inst");

define_id!(RequestId, "req");

/// Event id is a monotonic integer assigned by the event log, not a ULID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// The cursor before the first event.
    pub const ZERO: Self = Self(0);

    /// Creates an EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns the next event id.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<EventId> for i64 {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}
