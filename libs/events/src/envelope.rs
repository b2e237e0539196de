//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use fleet_id::{EventId, InstanceId, RequestId, WorkloadId};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Actor type recorded on desired-state mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human operator at the declarative write boundary.
    Operator,
    /// The metric-driven scaling policy.
    Autoscaler,
    /// The controller itself (reconciler, health monitor, rollout).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActorType::Operator => "operator",
            ActorType::Autoscaler => "autoscaler",
            ActorType::System => "system",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally monotonic event identifier, assigned by the event log.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g., "workload.applied", "rollout.stalled").
    pub event_type: String,

    /// The actor that caused the event.
    pub actor: ActorType,

    /// Request correlation id.
    pub request_id: RequestId,

    /// The workload the event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_id: Option<WorkloadId>,

    /// The instance the event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,

    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Decodes the payload into a typed payload struct.
    pub fn payload_as<P: for<'de> Deserialize<'de>>(&self) -> Result<P, EventError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// An event that has not yet been appended to the log.
///
/// The log assigns the monotonic [`EventId`] at append time; everything
/// else is fixed when the draft is built.
#[derive(Debug, Clone)]
pub struct EventDraft {
    event_type: String,
    actor: ActorType,
    workload_id: Option<WorkloadId>,
    instance_id: Option<InstanceId>,
    payload: serde_json::Value,
}

impl EventDraft {
    /// Starts a draft for the given event type.
    pub fn new(event_type: &str, actor: ActorType) -> Self {
        Self {
            event_type: event_type.to_string(),
            actor,
            workload_id: None,
            instance_id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Scopes the event to a workload.
    pub fn workload(mut self, id: WorkloadId) -> Self {
        self.workload_id = Some(id);
        self
    }

    /// Scopes the event to an instance.
    pub fn instance(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Attaches a typed payload.
    pub fn payload<P: Serialize>(mut self, payload: &P) -> Result<Self, EventError> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Seals the draft into an envelope with a log-assigned event id.
    pub fn seal(self, event_id: EventId) -> EventEnvelope {
        EventEnvelope {
            event_id,
            occurred_at: Utc::now(),
            event_type: self.event_type,
            actor: self.actor,
            request_id: RequestId::new(),
            workload_id: self.workload_id,
            instance_id: self.instance_id,
            payload: self.payload,
        }
    }

    /// The event type of this draft.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, WorkloadScaledPayload};

    #[test]
    fn test_draft_seal_roundtrip() {
        let workload_id = WorkloadId::new();
        let payload = WorkloadScaledPayload {
            workload_id,
            name: "web".to_string(),
            old_replicas: 3,
            new_replicas: 5,
        };

        let envelope = EventDraft::new(event_types::WORKLOAD_SCALED, ActorType::Operator)
            .workload(workload_id)
            .payload(&payload)
            .unwrap()
            .seal(EventId::new(7));

        assert_eq!(envelope.event_id, EventId::new(7));
        assert_eq!(envelope.event_type, event_types::WORKLOAD_SCALED);
        assert_eq!(envelope.workload_id, Some(workload_id));

        let decoded: WorkloadScaledPayload = envelope.payload_as().unwrap();
        assert_eq!(decoded.new_replicas, 5);
    }

    #[test]
    fn test_envelope_json_skips_empty_scopes() {
        let envelope = EventDraft::new(event_types::ROLLOUT_STEP, ActorType::System)
            .seal(EventId::new(1));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("workload_id"));
        assert!(!json.contains("instance_id"));
    }
}
