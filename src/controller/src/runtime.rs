use common::config::ControllerConfig;
use common::{ResourceKey, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::{ControllerMetrics, MetricsSummary};
use crate::queue::{Dispatcher, WorkQueue, work_queue};
use crate::reconciler::TtlReconciler;
use crate::registry::TimerRegistry;
use crate::worker::create_expiration_system;

/// A running TTL controller: dispatcher, reconciler, timer registry and
/// deletion executor wired together.
pub struct TtlController {
    queue: WorkQueue,
    registry: TimerRegistry,
    reconciler: Arc<TtlReconciler>,
    metrics: ControllerMetrics,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
    executor: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl TtlController {
    /// Spawn the controller tasks on the current runtime.
    pub fn start(config: &ControllerConfig, store: Arc<dyn ResourceStore>) -> Self {
        let metrics = ControllerMetrics::new();
        let (registry, executor) = create_expiration_system(store.clone(), metrics.clone());
        let reconciler = Arc::new(TtlReconciler::new(store, registry.clone(), config));

        let (queue, rx) = work_queue();
        let dispatcher = Dispatcher::new(
            reconciler.clone(),
            &queue,
            rx,
            config.clone(),
            metrics.clone(),
        );

        let shutdown = CancellationToken::new();
        let executor = tokio::spawn(executor.run());
        let dispatcher = tokio::spawn(dispatcher.run(shutdown.clone()));

        info!(
            ttl_annotation = %config.ttl_annotation,
            ready_condition = %config.ready_condition,
            max_concurrent_reconciles = config.max_concurrent_reconciles,
            "TTL controller started"
        );

        Self {
            queue,
            registry,
            reconciler,
            metrics,
            shutdown,
            dispatcher,
            executor,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Handle for requesting reconciles, e.g. to install as a store watcher.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, key: ResourceKey) -> bool {
        self.queue.enqueue(key)
    }

    pub fn registry(&self) -> &TimerRegistry {
        &self.registry
    }

    pub fn reconciler(&self) -> Arc<TtlReconciler> {
        self.reconciler.clone()
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Stop the controller.
    ///
    /// In-flight reconciles finish first, then the registry is closed so that
    /// every pending timer is disarmed and none can be armed afterwards.
    /// Deletions that already fired are allowed to complete.
    pub async fn shutdown(self) -> MetricsSummary {
        info!("Stopping TTL controller");
        self.shutdown.cancel();

        let mut dispatcher = self.dispatcher;
        match tokio::time::timeout(self.shutdown_timeout, &mut dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Dispatcher task failed"),
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Dispatcher did not stop in time, aborting");
                dispatcher.abort();
            }
        }

        self.registry.close();
        self.registry.shutdown_executor();
        let mut executor = self.executor;
        match tokio::time::timeout(self.shutdown_timeout, &mut executor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Deletion executor task failed"),
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Deletion executor did not stop in time, aborting");
                executor.abort();
            }
        }

        info!("TTL controller stopped");
        self.metrics.summary()
    }
}

impl std::fmt::Debug for TtlController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlController")
            .field("registry", &self.registry)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::testing::{SnapshotBuilder, TestConfigBuilder};
    use common::{InMemoryResourceStore, ResourceSnapshot, StoreError};

    /// Store whose fetches take longer than the controller is willing to wait
    struct SlowStore {
        inner: InMemoryResourceStore,
        fetch_delay: Duration,
    }

    #[async_trait]
    impl ResourceStore for SlowStore {
        async fn fetch(&self, key: &ResourceKey) -> Result<Option<ResourceSnapshot>, StoreError> {
            tokio::time::sleep(self.fetch_delay).await;
            self.inner.fetch(key).await
        }

        async fn delete(&self, snapshot: &ResourceSnapshot) -> Result<(), StoreError> {
            self.inner.delete(snapshot).await
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_events_drive_reconciles() {
        let store = Arc::new(InMemoryResourceStore::new());
        let controller = TtlController::start(
            &TestConfigBuilder::new().build_controller(),
            store.clone(),
        );
        store.set_watcher(controller.queue().sender());

        let pod = store
            .apply(
                SnapshotBuilder::new("default", "web-0")
                    .with_ttl("30")
                    .ready_at(Utc::now())
                    .build(),
            )
            .await;
        settle().await;
        assert!(controller.registry().lookup(&pod.key()).is_some());

        store.remove(&pod.key()).await;
        settle().await;
        assert!(controller.registry().is_empty());

        let summary = controller.shutdown().await;
        assert_eq!(summary.timers_armed, 1);
        assert_eq!(summary.timers_disarmed, 1);
        assert_eq!(summary.deletes_succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disarms_pending_timers() {
        let store = Arc::new(InMemoryResourceStore::new());
        let controller = TtlController::start(
            &TestConfigBuilder::new().build_controller(),
            store.clone(),
        );

        let mut entries = Vec::new();
        for i in 0..3 {
            let pod = store
                .apply(
                    SnapshotBuilder::new("default", &format!("web-{i}"))
                        .with_ttl("3600")
                        .ready_at(Utc::now())
                        .build(),
                )
                .await;
            controller.enqueue(pod.key());
            entries.push(pod.key());
        }
        settle().await;
        assert_eq!(controller.registry().len(), 3);

        let registry = controller.registry().clone();
        let watched: Vec<_> = entries
            .iter()
            .filter_map(|key| registry.lookup(key))
            .collect();

        let summary = controller.shutdown().await;
        assert!(registry.is_empty());
        assert!(watched.iter().all(|entry| entry.is_cancelled()));
        assert_eq!(summary.timers_disarmed, 3);

        tokio::time::advance(Duration::from_secs(7200)).await;
        settle().await;
        assert!(store.delete_calls().is_empty());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_outliving_shutdown_arms_nothing() {
        let inner = InMemoryResourceStore::new();
        let pod = inner
            .apply(
                SnapshotBuilder::new("default", "slow")
                    .with_ttl("3600")
                    .ready_at(Utc::now())
                    .build(),
            )
            .await;
        let store = Arc::new(SlowStore {
            inner,
            fetch_delay: Duration::from_secs(10),
        });
        let config = TestConfigBuilder::new()
            .with_shutdown_timeout(Duration::from_secs(1))
            .build_controller();
        let controller = TtlController::start(&config, store.clone());

        controller.enqueue(pod.key());
        settle().await;
        assert_eq!(store.inner.fetch_calls(), 0);

        let registry = controller.registry().clone();
        let metrics = controller.metrics().clone();
        let summary = controller.shutdown().await;
        assert_eq!(summary.timers_armed, 0);
        assert!(registry.is_closed());

        // Well past the point where the stalled fetch would have returned.
        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert!(registry.is_empty());
        assert_eq!(metrics.summary().timers_armed, 0);
        assert!(store.inner.delete_calls().is_empty());
    }
}
