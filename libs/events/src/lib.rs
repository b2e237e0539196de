//! # fleet-events
//!
//! Event type definitions for the fleetd controller.
//!
//! Every observable state change in the controller is recorded as an
//! event: desired-state mutations at the write boundary, instance
//! lifecycle transitions from the health monitor, and rollout phase
//! changes. Events share a common envelope ([`EventEnvelope`]) carrying
//! the acting principal and correlation ids.
//!
//! This crate also hosts the status enums shared across the workspace:
//! [`InstanceStatus`], [`ObservedReadiness`], and [`RolloutPhase`].

mod envelope;
mod error;
mod types;

pub use envelope::{ActorType, EventDraft, EventEnvelope};
pub use error::EventError;
pub use types::*;
