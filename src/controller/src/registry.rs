//! Thread-safe registry of armed deletion timers
//!
//! The registry is the only owner of the key → timer mapping. Every
//! read-modify-write happens under one mutex that is never held across an
//! `.await`, which gives arming true check-and-insert semantics and makes
//! disarm and firing mutually exclusive for a given entry.

use chrono::{DateTime, Utc};
use common::{ResourceKey, ResourceSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RegistryClosed;
use crate::metrics::ControllerMetrics;
use crate::worker::{DeletionMessage, DeletionRequest, ExpirationWorker};

/// Lifecycle state of a live timer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its deadline; can still be disarmed
    Armed,
    /// Claimed by its worker; a deletion request is in flight
    Firing,
}

/// A pending deletion for one resource
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub key: ResourceKey,
    pub expires_at: DateTime<Utc>,
    /// Registry-unique number of the arming cycle this entry belongs to
    pub generation: u64,
    pub state: TimerState,
    /// Snapshot the expiry was computed from; used for the deletion request
    pub snapshot: Arc<ResourceSnapshot>,
    cancel: CancellationToken,
}

impl TimerEntry {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registry of armed timers, shared between reconciles and workers
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: Mutex<HashMap<ResourceKey, TimerEntry>>,
    next_generation: AtomicU64,
    /// Set once by `close`; only changed while `entries` is locked
    closed: AtomicBool,
    /// Channel to the deletion executor
    deletions: mpsc::UnboundedSender<DeletionMessage>,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

impl TimerRegistry {
    pub(crate) fn new(
        deletions: mpsc::UnboundedSender<DeletionMessage>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                deletions,
                metrics,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, TimerEntry>> {
        // Critical sections never panic halfway through a mutation.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<TimerEntry> {
        self.entries().get(key).cloned()
    }

    /// Arm a timer for the snapshot's key unless one already exists.
    ///
    /// Returns whether a new entry was created together with the live entry.
    /// A deadline already in the past fires without delay. Fails once the
    /// registry has been closed.
    pub fn arm_if_absent(
        &self,
        snapshot: ResourceSnapshot,
        expires_at: DateTime<Utc>,
    ) -> Result<(bool, TimerEntry), RegistryClosed> {
        let key = snapshot.key();
        let entry = {
            let mut entries = self.entries();
            if self.inner.closed.load(Ordering::Acquire) {
                debug!(key = %key, "Registry closed, not arming");
                return Err(RegistryClosed);
            }
            if let Some(existing) = entries.get(&key) {
                return Ok((false, existing.clone()));
            }

            let entry = TimerEntry {
                key: key.clone(),
                expires_at,
                generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                state: TimerState::Armed,
                snapshot: Arc::new(snapshot),
                cancel: CancellationToken::new(),
            };
            entries.insert(key, entry.clone());
            entry
        };

        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            key = %entry.key,
            generation = entry.generation,
            expires_at = %expires_at,
            delay = ?delay,
            "Timer armed"
        );
        self.inner.metrics.record_timer_armed();

        ExpirationWorker::new(
            self.clone(),
            entry.key.clone(),
            entry.generation,
            delay,
            entry.cancel.clone(),
        )
        .spawn();

        Ok((true, entry))
    }

    /// Cancel and remove the armed timer for `key`.
    ///
    /// Returns false when there is nothing to cancel, including when the
    /// timer has already been claimed by its worker.
    pub fn disarm(&self, key: &ResourceKey) -> bool {
        let removed = {
            let mut entries = self.entries();
            match entries.get(key).map(|entry| entry.state) {
                Some(TimerState::Armed) => entries.remove(key),
                Some(TimerState::Firing) => {
                    debug!(key = %key, "Timer already firing, nothing to disarm");
                    None
                }
                None => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(key = %key, generation = entry.generation, "Timer disarmed");
                self.inner.metrics.record_timers_disarmed(1);
                true
            }
            None => false,
        }
    }

    /// Claim an armed entry for firing.
    ///
    /// Succeeds only for the live, uncancelled entry of `generation`; the
    /// entry then stays in the registry as `Firing` until retired, which keeps
    /// the key from being re-armed while its deletion is in flight.
    pub fn begin_firing(&self, key: &ResourceKey, generation: u64) -> Option<TimerEntry> {
        let claimed = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry)
                    if entry.generation == generation
                        && entry.state == TimerState::Armed
                        && !entry.cancel.is_cancelled() =>
                {
                    entry.state = TimerState::Firing;
                    Some(entry.clone())
                }
                _ => None,
            }
        };

        if claimed.is_some() {
            self.inner.metrics.record_timer_fired();
        }
        claimed
    }

    /// Remove the entry of `generation` after its worker has acted.
    ///
    /// Returns false if the entry is already gone or belongs to a later
    /// arming cycle.
    pub fn retire_after_firing(&self, key: &ResourceKey, generation: u64) -> bool {
        let mut entries = self.entries();
        if entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(key);
            debug!(key = %key, generation, "Timer retired");
            true
        } else {
            debug!(key = %key, generation, "Timer already retired");
            false
        }
    }

    /// Hand a claimed timer over to the deletion executor.
    pub(crate) fn post_deletion(&self, request: DeletionRequest) {
        let key = request.key.clone();
        let generation = request.generation;
        if self
            .inner
            .deletions
            .send(DeletionMessage::Delete(request))
            .is_err()
        {
            warn!(key = %key, "Deletion executor is gone, dropping expired timer");
            self.retire_after_firing(&key, generation);
        }
    }

    /// Cancel and remove every entry. Returns the number of armed timers cancelled.
    pub fn disarm_all(&self) -> usize {
        let drained: Vec<TimerEntry> = self.entries().drain().map(|(_, entry)| entry).collect();

        let mut cancelled = 0;
        for entry in drained {
            entry.cancel.cancel();
            if entry.state == TimerState::Armed {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            info!(count = cancelled, "Disarmed all pending timers");
            self.inner.metrics.record_timers_disarmed(cancelled);
        }
        cancelled
    }

    /// Disarm every entry and refuse to arm new ones from now on.
    ///
    /// Reconciles still running when the controller stops cannot leave a
    /// timer behind once this has returned.
    pub fn close(&self) -> usize {
        {
            let _entries = self.entries();
            self.inner.closed.store(true, Ordering::Release);
        }
        self.disarm_all()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Ask the deletion executor to finish outstanding requests and stop.
    pub(crate) fn shutdown_executor(&self) {
        let _ = self.inner.deletions.send(DeletionMessage::Shutdown);
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::SnapshotBuilder;

    fn registry() -> (TimerRegistry, mpsc::UnboundedReceiver<DeletionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerRegistry::new(tx, ControllerMetrics::new()), rx)
    }

    fn pod(name: &str) -> ResourceSnapshot {
        SnapshotBuilder::new("default", name)
            .with_uid(name)
            .with_ttl("30")
            .ready_at(Utc::now())
            .build()
    }

    fn in_one_hour() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<DeletionMessage>) -> DeletionRequest {
        match rx.recv().await {
            Some(DeletionMessage::Delete(request)) => request,
            other => panic!("expected deletion request, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_if_absent_is_idempotent() {
        let (registry, _rx) = registry();
        let expires_at = in_one_hour();

        let (created, first) = registry.arm_if_absent(pod("web-0"), expires_at).unwrap();
        assert!(created);
        assert_eq!(first.state, TimerState::Armed);

        let (created, second) =
            registry.arm_if_absent(pod("web-0"), expires_at + chrono::Duration::hours(1)).unwrap();
        assert!(!created);
        assert_eq!(second.generation, first.generation);
        assert_eq!(second.expires_at, expires_at);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_and_removes() {
        let (registry, _rx) = registry();
        let (_, entry) = registry.arm_if_absent(pod("web-0"), in_one_hour()).unwrap();
        let key = entry.key.clone();

        assert!(registry.disarm(&key));
        assert!(registry.lookup(&key).is_none());
        assert!(!registry.disarm(&key));
        assert!(entry.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_and_firing_are_mutually_exclusive() {
        let (registry, _rx) = registry();
        let (_, entry) = registry.arm_if_absent(pod("web-0"), in_one_hour()).unwrap();
        let key = entry.key.clone();

        assert!(registry.begin_firing(&key, entry.generation).is_some());
        assert!(!registry.disarm(&key), "disarm must lose once firing has begun");
        assert!(registry.begin_firing(&key, entry.generation).is_none());
        assert_eq!(registry.lookup(&key).unwrap().state, TimerState::Firing);

        assert!(registry.retire_after_firing(&key, entry.generation));
        assert!(!registry.retire_after_firing(&key, entry.generation));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_firing_loses_after_disarm() {
        let (registry, _rx) = registry();
        let (_, entry) = registry.arm_if_absent(pod("web-0"), in_one_hour()).unwrap();

        assert!(registry.disarm(&entry.key));
        assert!(registry.begin_firing(&entry.key, entry.generation).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_cannot_retire_new_entry() {
        let (registry, _rx) = registry();
        let (_, old) = registry.arm_if_absent(pod("web-0"), in_one_hour()).unwrap();
        assert!(registry.disarm(&old.key));

        let (created, new) = registry.arm_if_absent(pod("web-0"), in_one_hour()).unwrap();
        assert!(created);
        assert_ne!(new.generation, old.generation);

        assert!(!registry.retire_after_firing(&old.key, old.generation));
        assert!(registry.begin_firing(&old.key, old.generation).is_none());
        assert!(registry.lookup(&new.key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_fires_without_delay() {
        let (registry, mut rx) = registry();
        let started = tokio::time::Instant::now();
        let (_, entry) =
            registry.arm_if_absent(pod("web-0"), Utc::now() - chrono::Duration::seconds(5)).unwrap();

        let request = next_request(&mut rx).await;
        assert_eq!(request.key, entry.key);
        assert_eq!(request.generation, entry.generation);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(registry.lookup(&entry.key).unwrap().state, TimerState::Firing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let (registry, mut rx) = registry();
        let started = tokio::time::Instant::now();
        registry.arm_if_absent(pod("web-0"), Utc::now() + chrono::Duration::seconds(30)).unwrap();

        let request = next_request(&mut rx).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(29), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(31), "fired late: {elapsed:?}");
        assert_eq!(request.snapshot.name, "web-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_posts() {
        let (registry, mut rx) = registry();
        let (_, entry) =
            registry.arm_if_absent(pod("web-0"), Utc::now() + chrono::Duration::seconds(30)).unwrap();
        assert!(registry.disarm(&entry.key));

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_all_clears_registry() {
        let (registry, mut rx) = registry();
        let (_, a) = registry.arm_if_absent(pod("a"), in_one_hour()).unwrap();
        let (_, b) = registry.arm_if_absent(pod("b"), in_one_hour()).unwrap();

        assert_eq!(registry.disarm_all(), 2);
        assert!(registry.is_empty());
        assert!(a.is_cancelled() && b.is_cancelled());

        tokio::time::advance(Duration::from_secs(7200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_registry_refuses_to_arm() {
        let (registry, mut rx) = registry();
        let (_, armed) = registry.arm_if_absent(pod("a"), in_one_hour()).unwrap();

        assert_eq!(registry.close(), 1);
        assert!(registry.is_closed());
        assert!(armed.is_cancelled());

        let late = registry.arm_if_absent(pod("b"), Utc::now() - chrono::Duration::seconds(1));
        assert!(matches!(late, Err(RegistryClosed)));
        assert!(registry.is_empty());

        tokio::time::advance(Duration::from_secs(7200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_executor_retires_entry() {
        let (registry, rx) = registry();
        drop(rx);

        registry.arm_if_absent(pod("web-0"), Utc::now() - chrono::Duration::seconds(1)).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(registry.is_empty());
    }
}
