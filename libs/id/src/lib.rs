//! # fleet-id
//!
//! Typed resource identifiers for the fleetd controller.
//!
//! ## Design Principles
//!
//! - Ids are stable and system-generated; workload names are operator labels
//! - All ids have a canonical string representation with strict parsing
//! - Ids support roundtrip serialization (parse → format → parse)
//! - Ids are typed so a workload id can never stand in for an instance id
//!
//! ## Id Format
//!
//! All resource ids use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `wl_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The ULID payload keeps ids time-ordered, which the controller relies on
//! for deterministic tie-breaking (newest-first termination selection).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
