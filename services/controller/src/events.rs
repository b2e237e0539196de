//! In-memory event log.
//!
//! Append-only record of everything the controller did or observed, with
//! monotonic event ids. The observation boundary reads it by cursor;
//! retention is bounded so a long-running controller does not grow
//! without limit.

use fleet_events::{EventDraft, EventEnvelope};
use fleet_id::EventId;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

/// Maximum envelopes retained. Old entries are dropped from the front;
/// event ids stay monotonic so cursors remain valid.
const RETAINED_EVENTS: usize = 4096;

/// Append-only event log with monotonic ids.
pub struct EventLog {
    inner: RwLock<Inner>,
}

struct Inner {
    next_id: EventId,
    entries: VecDeque<EventEnvelope>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: EventId::ZERO.next(),
                entries: VecDeque::new(),
            }),
        }
    }

    /// Appends a draft, assigning the next event id.
    pub async fn append(&self, draft: EventDraft) -> EventEnvelope {
        let mut inner = self.inner.write().await;
        let event_id = inner.next_id;
        inner.next_id = event_id.next();

        let envelope = draft.seal(event_id);
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Event appended"
        );

        inner.entries.push_back(envelope.clone());
        while inner.entries.len() > RETAINED_EVENTS {
            inner.entries.pop_front();
        }

        envelope
    }

    /// Reads events with ids strictly greater than the cursor.
    pub async fn read_after(&self, cursor: EventId) -> Vec<EventEnvelope> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|e| e.event_id > cursor)
            .cloned()
            .collect()
    }

    /// The id of the most recently appended event.
    pub async fn latest_id(&self) -> EventId {
        let inner = self.inner.read().await;
        inner
            .entries
            .back()
            .map(|e| e.event_id)
            .unwrap_or(EventId::ZERO)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
