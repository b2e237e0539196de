//! Instance runtime interface and mock implementation.
//!
//! The runtime boundary abstracts whatever actually starts and stops an
//! instance (a VM monitor, a container engine, a process supervisor):
//! - `create` / `terminate` for lifecycle
//! - `probe` for readiness, feeding the health monitor
//!
//! A mock implementation is provided for development and testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_events::ObservedReadiness;
use fleet_id::InstanceId;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Instance runtime interface.
///
/// The controller passes the instance id on create so a timed-out and
/// retried call can be deduplicated runtime-side; `create` for an id the
/// runtime already has must be a no-op acknowledgement.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Start an instance from a template, stamped with the given labels.
    async fn create(
        &self,
        id: InstanceId,
        template: &serde_json::Value,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Stop an instance. Terminating an unknown id is an acknowledged
    /// no-op, so retries after a timeout are safe.
    async fn terminate(&self, id: InstanceId) -> Result<()>;

    /// Probe an instance's readiness.
    async fn probe(&self, id: InstanceId) -> Result<ObservedReadiness>;
}

#[derive(Debug, Clone)]
struct MockInstance {
    alive: bool,
    readiness: ObservedReadiness,
}

/// Mock runtime for testing and development.
///
/// Instances become probe-Ready immediately on create unless a test
/// scripts otherwise via [`MockRuntime::set_readiness`] or
/// [`MockRuntime::kill`].
pub struct MockRuntime {
    instances: Mutex<HashMap<InstanceId, MockInstance>>,

    /// Next N create calls fail before doing anything.
    create_failures: AtomicU32,

    /// Next N terminate calls fail before doing anything.
    terminate_failures: AtomicU32,

    /// Total successful creates, for assertions.
    creates: AtomicU32,

    /// Total successful terminates, for assertions.
    terminates: AtomicU32,

    /// Simulated latency on create/terminate.
    latency: Duration,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            create_failures: AtomicU32::new(0),
            terminate_failures: AtomicU32::new(0),
            creates: AtomicU32::new(0),
            terminates: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// Adds a fixed latency to create/terminate, for timeout tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` terminate calls fail.
    pub fn fail_next_terminates(&self, n: u32) {
        self.terminate_failures.store(n, Ordering::SeqCst);
    }

    /// Scripts the probe result for an instance.
    pub async fn set_readiness(&self, id: InstanceId, readiness: ObservedReadiness) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(&id) {
            instance.readiness = readiness;
        }
    }

    /// Simulates an instance dying out from under the controller.
    pub async fn kill(&self, id: InstanceId) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(&id) {
            instance.alive = false;
            instance.readiness = ObservedReadiness::NotReady;
        }
    }

    /// Number of successful create calls.
    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful terminate calls.
    pub fn terminate_count(&self) -> u32 {
        self.terminates.load(Ordering::SeqCst)
    }

    /// Ids the runtime currently considers alive.
    pub async fn live_instances(&self) -> Vec<InstanceId> {
        let instances = self.instances.lock().await;
        let mut live: Vec<_> = instances
            .iter()
            .filter(|(_, i)| i.alive)
            .map(|(id, _)| *id)
            .collect();
        live.sort();
        live
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRuntime for MockRuntime {
    async fn create(
        &self,
        id: InstanceId,
        template: &serde_json::Value,
        _labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        if Self::take_failure(&self.create_failures) {
            anyhow::bail!("mock runtime: injected create failure");
        }

        let mut instances = self.instances.lock().await;
        if instances.contains_key(&id) {
            // Duplicate create for a known id: acknowledge, don't restart.
            debug!(instance_id = %id, "[MOCK] Duplicate create acknowledged");
            return Ok(());
        }

        info!(instance_id = %id, template = %template, "[MOCK] Instance created");
        instances.insert(
            id,
            MockInstance {
                alive: true,
                readiness: ObservedReadiness::Ready,
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self, id: InstanceId) -> Result<()> {
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        if Self::take_failure(&self.terminate_failures) {
            anyhow::bail!("mock runtime: injected terminate failure");
        }

        let mut instances = self.instances.lock().await;
        if instances.remove(&id).is_some() {
            info!(instance_id = %id, "[MOCK] Instance terminated");
            self.terminates.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!(instance_id = %id, "[MOCK] Terminate for unknown id acknowledged");
        }
        Ok(())
    }

    async fn probe(&self, id: InstanceId) -> Result<ObservedReadiness> {
        let instances = self.instances.lock().await;
        Ok(match instances.get(&id) {
            Some(instance) if instance.alive => instance.readiness,
            Some(_) => ObservedReadiness::NotReady,
            None => ObservedReadiness::Unknown,
        })
    }
}
