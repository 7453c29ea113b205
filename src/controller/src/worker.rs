//! Expiration workers and the background deletion executor
//!
//! Each armed timer owns one [`ExpirationWorker`]: a delayed task that races
//! its deadline against a cancellation token. On expiry it claims the entry
//! and posts a [`DeletionRequest`]; the [`DeletionExecutor`] performs the
//! actual delete so that no store I/O happens on the timer path.

use chrono::{DateTime, Utc};
use common::{ResourceKey, ResourceSnapshot, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ControllerMetrics;
use crate::registry::TimerRegistry;

/// Deletion of one expired resource, built from the snapshot captured at arming time
#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub key: ResourceKey,
    pub generation: u64,
    pub expires_at: DateTime<Utc>,
    pub snapshot: Arc<ResourceSnapshot>,
}

/// Message sent to the deletion executor
#[derive(Debug)]
pub enum DeletionMessage {
    Delete(DeletionRequest),
    /// Finish outstanding deletions and stop
    Shutdown,
}

/// Delayed task behind one timer entry
pub(crate) struct ExpirationWorker {
    registry: TimerRegistry,
    key: ResourceKey,
    generation: u64,
    delay: Duration,
    cancel: CancellationToken,
}

impl ExpirationWorker {
    pub(crate) fn new(
        registry: TimerRegistry,
        key: ResourceKey,
        generation: u64,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            key,
            generation,
            delay,
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(key = %self.key, generation = self.generation, "Timer cancelled");
                return;
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        // Disarm may have won between the deadline and this claim.
        let Some(entry) = self.registry.begin_firing(&self.key, self.generation) else {
            debug!(key = %self.key, generation = self.generation, "Timer disarmed before firing");
            return;
        };

        info!(
            key = %self.key,
            generation = self.generation,
            expires_at = %entry.expires_at,
            "Timer expired, requesting deletion"
        );

        self.registry.post_deletion(DeletionRequest {
            key: self.key,
            generation: self.generation,
            expires_at: entry.expires_at,
            snapshot: entry.snapshot,
        });
    }
}

/// Create a timer registry together with the executor that serves its deletions.
///
/// The executor must be spawned (`tokio::spawn(executor.run())`) for expired
/// timers to be acted on.
pub fn create_expiration_system(
    store: Arc<dyn ResourceStore>,
    metrics: ControllerMetrics,
) -> (TimerRegistry, DeletionExecutor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = TimerRegistry::new(tx, metrics.clone());
    let executor = DeletionExecutor {
        rx,
        registry: registry.clone(),
        store,
        metrics,
    };
    (registry, executor)
}

/// Background task that issues deletes for expired timers
///
/// Deletes run concurrently so a slow API call does not hold up other
/// expirations. A failed delete is logged and not retried; the entry is
/// retired either way.
pub struct DeletionExecutor {
    rx: mpsc::UnboundedReceiver<DeletionMessage>,
    registry: TimerRegistry,
    store: Arc<dyn ResourceStore>,
    metrics: ControllerMetrics,
}

impl DeletionExecutor {
    /// Run until a shutdown message arrives, then wait for in-flight deletes.
    pub async fn run(mut self) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(DeletionMessage::Delete(request)) => {
                        in_flight.spawn(execute(
                            request,
                            self.store.clone(),
                            self.registry.clone(),
                            self.metrics.clone(),
                        ));
                    }
                    Some(DeletionMessage::Shutdown) | None => break,
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        // Requests posted before shutdown still get their single attempt.
        while let Ok(DeletionMessage::Delete(request)) = self.rx.try_recv() {
            in_flight.spawn(execute(
                request,
                self.store.clone(),
                self.registry.clone(),
                self.metrics.clone(),
            ));
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Waiting for in-flight deletions");
        }
        while in_flight.join_next().await.is_some() {}

        info!("Deletion executor stopped");
    }
}

async fn execute(
    request: DeletionRequest,
    store: Arc<dyn ResourceStore>,
    registry: TimerRegistry,
    metrics: ControllerMetrics,
) {
    match store.delete(&request.snapshot).await {
        Ok(()) => {
            info!(
                key = %request.key,
                uid = %request.snapshot.uid,
                expires_at = %request.expires_at,
                "Deleted expired resource"
            );
            metrics.record_delete(true);
        }
        Err(e) => {
            warn!(
                key = %request.key,
                uid = %request.snapshot.uid,
                error = %e,
                "Failed to delete expired resource"
            );
            metrics.record_delete(false);
        }
    }

    registry.retire_after_firing(&request.key, request.generation);
}
