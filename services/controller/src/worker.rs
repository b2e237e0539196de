//! Background reconciliation worker.
//!
//! The control loop is level-triggered and driven two ways that converge
//! to the same result:
//! - a periodic full scan over every workload (bounded staleness)
//! - nudges naming a single workload (desired-state writes, health
//!   transitions)
//!
//! Duplicate nudges for one workload coalesce into at most one queued
//! pass. A per-workload mutex keeps passes for the same workload from
//! interleaving; passes for different workloads run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::reconciler::{ReconcileStats, Reconciler};
use crate::store::WorkloadStore;

/// Sends reconcile triggers for a named workload.
#[derive(Clone)]
pub struct NudgeSender(mpsc::UnboundedSender<String>);

impl NudgeSender {
    /// Requests a reconcile pass. Never blocks; a dropped receiver only
    /// means the worker is shutting down.
    pub fn nudge(&self, workload_name: &str) {
        let _ = self.0.send(workload_name.to_string());
    }
}

/// Creates the nudge channel pair.
pub fn nudge_channel() -> (NudgeSender, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NudgeSender(tx), rx)
}

/// Runs the reconciliation loop until shutdown.
pub struct ControllerWorker {
    reconciler: Arc<Reconciler>,
    store: Arc<WorkloadStore>,
    interval: Duration,

    /// Per-workload pass exclusion.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Workloads with a nudge-triggered pass queued but not yet running.
    queued: std::sync::Mutex<HashSet<String>>,
}

impl ControllerWorker {
    pub fn new(reconciler: Arc<Reconciler>, store: Arc<WorkloadStore>, interval: Duration) -> Self {
        Self {
            reconciler,
            store,
            interval,
            locks: Mutex::new(HashMap::new()),
            queued: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Runs the worker until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut nudges: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconciliation worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.full_scan().await;
                    if stats.instances_created > 0
                        || stats.instances_terminated > 0
                        || stats.orphans_terminated > 0
                    {
                        info!(
                            workloads_processed = stats.workloads_processed,
                            instances_created = stats.instances_created,
                            instances_terminated = stats.instances_terminated,
                            orphans_terminated = stats.orphans_terminated,
                            "Scan pass complete"
                        );
                    }
                }
                Some(name) = nudges.recv() => {
                    self.spawn_pass(name);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Queues a single-workload pass, coalescing duplicate nudges.
    fn spawn_pass(self: &Arc<Self>, name: String) {
        {
            let mut queued = self.queued.lock().expect("queued set poisoned");
            if !queued.insert(name.clone()) {
                debug!(workload = %name, "Nudge coalesced into queued pass");
                return;
            }
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let lock = worker.lock_for(&name).await;
            let _guard = lock.lock().await;
            // Once the pass owns the lock it reads fresh state, so any
            // nudge from here on needs a pass of its own.
            worker
                .queued
                .lock()
                .expect("queued set poisoned")
                .remove(&name);
            worker.reconciler.reconcile(&name).await;
        });
    }

    /// Runs one pass for a workload under its pass lock.
    pub async fn pass(&self, name: &str) -> crate::reconciler::ReconcileOutcome {
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;
        self.reconciler.reconcile(name).await
    }

    /// Reconciles every workload concurrently, then sweeps orphans.
    pub async fn full_scan(self: &Arc<Self>) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let workloads = self.store.list().await;
        debug!(count = workloads.len(), "Scanning workloads");

        let mut passes = JoinSet::new();
        for workload in workloads {
            let worker = Arc::clone(self);
            let name = workload.spec.name.clone();
            passes.spawn(async move {
                let lock = worker.lock_for(&name).await;
                let _guard = lock.lock().await;
                worker.reconciler.reconcile(&name).await
            });
        }

        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok(outcome) => {
                    stats.workloads_processed += 1;
                    stats.instances_created += outcome.created;
                    stats.instances_terminated += outcome.terminated;
                }
                Err(e) => {
                    error!(error = %e, "Reconcile pass panicked");
                    stats.workloads_failed += 1;
                }
            }
        }

        stats.orphans_terminated = self.reconciler.sweep_orphans().await;
        stats
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}
