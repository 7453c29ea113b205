//! In-process work queue feeding reconcile requests to the reconciler
//!
//! Keys arrive on an unbounded channel from watchers or callers. The
//! [`Dispatcher`] collapses duplicates, keeps at most one reconcile per key
//! in flight, bounds overall concurrency, and redelivers failed keys with
//! exponential backoff.

use common::ResourceKey;
use common::config::ControllerConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::metrics::ControllerMetrics;
use crate::reconciler::{Reconcile, ReconcileOutcome};

/// Cloneable handle used to request reconciles
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ResourceKey>,
}

impl WorkQueue {
    /// Request a reconcile of `key`. Returns `false` once the dispatcher is gone.
    pub fn enqueue(&self, key: ResourceKey) -> bool {
        self.tx.send(key).is_ok()
    }

    /// Raw sender, suitable as a store watcher.
    pub fn sender(&self) -> mpsc::UnboundedSender<ResourceKey> {
        self.tx.clone()
    }
}

/// Create a work queue handle and the receiving end for a [`Dispatcher`].
pub fn work_queue() -> (WorkQueue, mpsc::UnboundedReceiver<ResourceKey>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, rx)
}

/// Bookkeeping of which keys are waiting, running, or need another pass
#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    in_flight: HashSet<ResourceKey>,
    /// Keys requested again while their reconcile was running
    dirty: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
}

impl QueueState {
    /// Returns whether the key was newly queued.
    fn enqueue(&mut self, key: ResourceKey) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.pending.push_back(key);
        true
    }

    fn next(&mut self) -> Option<ResourceKey> {
        let key = self.pending.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Record completion of a reconcile. Returns the consecutive failure count.
    fn complete(&mut self, key: &ResourceKey, success: bool) -> u32 {
        self.in_flight.remove(key);

        let failures = if success {
            self.failures.remove(key);
            0
        } else {
            let count = self.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if self.dirty.remove(key) {
            self.enqueue(key.clone());
        }
        failures
    }

    fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

type ReconcileResult = Result<Result<ReconcileOutcome, ReconcileError>, JoinError>;

/// Event loop that drives a [`Reconcile`] implementation from a work queue
pub struct Dispatcher<R: Reconcile> {
    reconciler: Arc<R>,
    rx: mpsc::UnboundedReceiver<ResourceKey>,
    requeue_tx: mpsc::UnboundedSender<ResourceKey>,
    config: ControllerConfig,
    metrics: ControllerMetrics,
}

impl<R: Reconcile> Dispatcher<R> {
    pub fn new(
        reconciler: Arc<R>,
        queue: &WorkQueue,
        rx: mpsc::UnboundedReceiver<ResourceKey>,
        config: ControllerConfig,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            reconciler,
            rx,
            requeue_tx: queue.sender(),
            config,
            metrics,
        }
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight reconciles.
    ///
    /// Keys still pending at that point are dropped; pending requeues are
    /// abandoned. Reconciles are owned by the loop, so aborting the task
    /// running it cancels them too.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut state = QueueState::default();
        let mut running: JoinSet<Result<ReconcileOutcome, ReconcileError>> = JoinSet::new();
        let mut keys_by_task: HashMap<task::Id, ResourceKey> = HashMap::new();
        let mut requeues: JoinSet<()> = JoinSet::new();
        let max_concurrent = self.config.max_concurrent_reconciles.max(1);

        info!(max_concurrent, "Dispatcher started");

        loop {
            while state.in_flight_len() < max_concurrent {
                let Some(key) = state.next() else { break };
                let reconciler = self.reconciler.clone();
                let task_key = key.clone();
                let handle = running.spawn(async move { reconciler.reconcile(&task_key).await });
                keys_by_task.insert(handle.id(), key);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    let (id, result) = match joined {
                        Ok((id, result)) => (id, Ok(result)),
                        Err(e) => (e.id(), Err(e)),
                    };
                    match keys_by_task.remove(&id) {
                        Some(key) => {
                            self.handle_result(&mut state, &mut requeues, &shutdown, key, result)
                        }
                        None => error!(task = %id, "Finished reconcile has no key"),
                    }
                }
                Some(_) = requeues.join_next(), if !requeues.is_empty() => {}
                key = self.rx.recv() => match key {
                    Some(key) => {
                        if state.enqueue(key.clone()) {
                            debug!(key = %key, "Reconcile queued");
                        }
                    }
                    None => break,
                },
            }
        }

        requeues.abort_all();
        if !running.is_empty() {
            info!(
                count = running.len(),
                dropped = state.pending_len(),
                "Waiting for in-flight reconciles"
            );
        }
        while running.join_next().await.is_some() {}

        info!("Dispatcher stopped");
    }

    fn handle_result(
        &self,
        state: &mut QueueState,
        requeues: &mut JoinSet<()>,
        shutdown: &CancellationToken,
        key: ResourceKey,
        result: ReconcileResult,
    ) {
        let error = match result {
            Ok(Ok(outcome)) => {
                debug!(key = %key, outcome = ?outcome, "Reconcile finished");
                self.metrics.record_reconcile(true);
                state.complete(&key, true);
                // The in-flight delete retires the entry; look again after
                // that so a recreated object gets its own timer.
                if matches!(outcome, ReconcileOutcome::Firing { .. }) {
                    debug!(key = %key, "Timer is firing, checking again later");
                    self.schedule_requeue(requeues, shutdown, key, self.config.requeue_base_delay);
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("reconcile task panicked: {e}"),
        };

        self.metrics.record_reconcile(false);
        let failures = state.complete(&key, false);
        let delay = self.config.requeue_delay(failures);
        warn!(
            key = %key,
            error = %error,
            failures,
            delay = ?delay,
            "Reconcile failed, requeueing"
        );
        self.metrics.record_requeue();
        self.schedule_requeue(requeues, shutdown, key, delay);
    }

    fn schedule_requeue(
        &self,
        requeues: &mut JoinSet<()>,
        shutdown: &CancellationToken,
        key: ResourceKey,
        delay: Duration,
    ) {
        let tx = self.requeue_tx.clone();
        let shutdown = shutdown.clone();
        requeues.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(key);
                }
            }
        });
    }
}
