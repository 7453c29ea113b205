//! Controller test context
//!
//! Runs a [`TtlController`] against an [`InMemoryResourceStore`] whose watcher
//! feeds the controller's work queue, the same wiring as local mode.

use chrono::{DateTime, Utc};
use common::config::ControllerConfig;
use common::testing::{SnapshotBuilder, TestConfigBuilder};
use common::{InMemoryResourceStore, ResourceKey, ResourceSnapshot};
use controller::{MetricsSummary, TtlController};
use std::sync::Arc;
use std::time::Duration;

/// Complete test context for controller scenarios
pub struct ControllerTestContext {
    pub store: Arc<InMemoryResourceStore>,
    pub controller: TtlController,
}

impl ControllerTestContext {
    /// Start a controller with the short test delays.
    pub fn new() -> Self {
        Self::with_config(TestConfigBuilder::new().build_controller())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(InMemoryResourceStore::new());
        let controller = TtlController::start(&config, store.clone());
        store.set_watcher(controller.queue().sender());
        Self { store, controller }
    }

    /// Apply a pod that carries `ttl` and became ready at `ready_at`.
    pub async fn apply_ready_pod(
        &self,
        name: &str,
        ttl: &str,
        ready_at: DateTime<Utc>,
    ) -> ResourceSnapshot {
        self.store
            .apply(
                SnapshotBuilder::new("default", name)
                    .with_ttl(ttl)
                    .ready_at(ready_at)
                    .build(),
            )
            .await
    }

    /// Let queued reconciles, workers and deletions run without moving the clock.
    pub async fn settle(&self) {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    /// Advance paused time by `duration` and let the woken tasks run.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::advance(duration).await;
        self.settle().await;
    }

    /// Move paused time forward in small steps so chains of short timers
    /// (requeue backoff) keep firing.
    pub async fn run_for(&self, duration: Duration) {
        let step = Duration::from_millis(10);
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            self.advance(step).await;
            elapsed += step;
        }
    }

    pub fn is_armed(&self, key: &ResourceKey) -> bool {
        self.controller.registry().lookup(key).is_some()
    }

    pub async fn shutdown(self) -> MetricsSummary {
        self.controller.shutdown().await
    }
}

impl Default for ControllerTestContext {
    fn default() -> Self {
        Self::new()
    }
}
