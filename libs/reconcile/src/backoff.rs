//! Capped exponential backoff for per-instance runtime retries.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use fleet_id::InstanceId;
use rand::Rng;

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once the backoff window elapses.
    Retry,
    /// Retry budget spent; escalate to an alert on the record.
    Exhausted,
}

#[derive(Debug, Clone)]
struct Entry {
    attempts: u32,
    not_before: Instant,
    last_failure: Instant,
}

/// Per-instance retry bookkeeping with capped exponential delays.
///
/// Delays double per attempt from `base` up to `cap`, with a small
/// multiplicative jitter so a batch of instances that failed together
/// does not retry against the runtime in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    jitter: f64,
    entries: BTreeMap<InstanceId, Entry>,
}

impl Backoff {
    /// Creates a backoff tracker. `max_retries` bounds attempts per
    /// instance before [`RetryDecision::Exhausted`].
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries,
            jitter: 0.1,
            entries: BTreeMap::new(),
        }
    }

    /// Overrides the jitter fraction. Zero makes delays exact, which the
    /// tests rely on.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Records a failure for an instance and arms the next window.
    pub fn record_failure(&mut self, id: InstanceId) -> RetryDecision {
        let now = Instant::now();
        let entry = self.entries.entry(id).or_insert(Entry {
            attempts: 0,
            not_before: now,
            last_failure: now,
        });

        entry.attempts += 1;
        entry.last_failure = now;
        let attempts = entry.attempts;
        let delay = self.delay_for(attempts);
        let entry = self
            .entries
            .get_mut(&id)
            .expect("entry was just inserted above");
        entry.not_before = now + delay;

        if entry.attempts > self.max_retries {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry
        }
    }

    /// Returns true while the instance's current backoff window is open.
    pub fn is_blocked(&self, id: &InstanceId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| Instant::now() < e.not_before)
    }

    /// Returns true once the instance has spent its retry budget.
    pub fn is_exhausted(&self, id: &InstanceId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.attempts > self.max_retries)
    }

    /// Failure attempts recorded for an instance.
    pub fn attempts(&self, id: &InstanceId) -> u32 {
        self.entries.get(id).map_or(0, |e| e.attempts)
    }

    /// Clears tracking for an instance (on success or termination).
    pub fn clear(&mut self, id: &InstanceId) {
        self.entries.remove(id);
    }

    /// Drops entries that have been quiet long enough to be forgotten.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let horizon = self.cap * 4;
        self.entries
            .retain(|_, e| now.duration_since(e.last_failure) <= horizon);
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        if self.jitter == 0.0 {
            return raw;
        }
        let factor = 1.0 - self.jitter + rand::rng().random_range(0.0..self.jitter * 2.0);
        raw.mul_f64(factor)
    }
}
