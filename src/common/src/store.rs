//! Resource store abstraction and the in-memory backend used for local mode
//! and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::model::{ResourceKey, ResourceSnapshot};

/// Errors surfaced by a [`ResourceStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing API could not be reached or answered with a transient failure.
    #[error("Resource store unavailable: {0}")]
    Unavailable(String),

    /// The object behind the key is no longer the one the snapshot was taken from.
    #[error("Precondition failed for {key}: expected uid {expected}, found {actual}")]
    Conflict {
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode resources from {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Read and delete access to the managed resource population.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current state of `key`. `Ok(None)` means the resource does not exist.
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<ResourceSnapshot>, StoreError>;

    /// Delete the object the snapshot was taken from.
    ///
    /// Deleting an object that is already gone must succeed.
    async fn delete(&self, snapshot: &ResourceSnapshot) -> Result<(), StoreError>;
}

/// In-memory resource store.
///
/// Every change (apply, out-of-band removal, successful delete) is announced
/// on the optional watcher channel, which makes the store double as an event
/// source for the controller's work queue.
pub struct InMemoryResourceStore {
    objects: RwLock<HashMap<ResourceKey, ResourceSnapshot>>,
    watcher: Mutex<Option<mpsc::UnboundedSender<ResourceKey>>>,
    next_version: AtomicU64,
    fetch_calls: AtomicUsize,
    failing_fetches: AtomicUsize,
    failing_deletes: AtomicBool,
    delete_calls: Mutex<Vec<ResourceKey>>,
    deleted: Mutex<Vec<ResourceKey>>,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            watcher: Mutex::new(None),
            next_version: AtomicU64::new(1),
            fetch_calls: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            failing_deletes: AtomicBool::new(false),
            delete_calls: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Announce every change on `tx`.
    pub fn set_watcher(&self, tx: mpsc::UnboundedSender<ResourceKey>) {
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn notify(&self, key: ResourceKey) {
        let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = watcher.as_ref() {
            // The receiver goes away when the controller stops.
            let _ = tx.send(key);
        }
    }

    /// Create or update an object.
    ///
    /// An empty uid keeps the uid of the stored object with the same key, or
    /// gets a fresh one. The resource version is always bumped.
    pub async fn apply(&self, mut snapshot: ResourceSnapshot) -> ResourceSnapshot {
        let key = snapshot.key();
        {
            let mut objects = self.objects.write().await;
            if snapshot.uid.is_empty() {
                snapshot.uid = objects
                    .get(&key)
                    .map(|existing| existing.uid.clone())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
            }
            snapshot.resource_version = self.next_version.fetch_add(1, Ordering::Relaxed);
            objects.insert(key.clone(), snapshot.clone());
        }
        tracing::debug!(key = %key, uid = %snapshot.uid, "Resource applied");
        self.notify(key);
        snapshot
    }

    /// Remove an object without going through [`ResourceStore::delete`].
    pub async fn remove(&self, key: &ResourceKey) -> Option<ResourceSnapshot> {
        let removed = self.objects.write().await.remove(key);
        if removed.is_some() {
            tracing::debug!(key = %key, "Resource removed");
            self.notify(key.clone());
        }
        removed
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<ResourceSnapshot> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Load a JSON array of snapshots and apply each of them.
    pub async fn load_seed_file(&self, path: &Path) -> Result<usize, StoreError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let snapshots: Vec<ResourceSnapshot> =
            serde_json::from_str(&contents).map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        let count = snapshots.len();
        for snapshot in snapshots {
            self.apply(snapshot).await;
        }
        log::info!("Seeded {} resources from {}", count, path.display());
        Ok(count)
    }

    /// Make the next `count` fetches fail with [`StoreError::Unavailable`].
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Make every delete fail with [`StoreError::Unavailable`] until reset.
    pub fn fail_deletes(&self, failing: bool) {
        self.failing_deletes.store(failing, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Keys of every delete request received, including failed ones.
    pub fn delete_calls(&self) -> Vec<ResourceKey> {
        self.delete_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keys of objects actually removed by a delete request.
    pub fn deleted_keys(&self) -> Vec<ResourceKey> {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<ResourceSnapshot>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("injected fetch failure for {key}")));
        }

        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, snapshot: &ResourceSnapshot) -> Result<(), StoreError> {
        let key = snapshot.key();
        self.delete_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());

        if self.failing_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected delete failure for {key}")));
        }

        {
            let mut objects = self.objects.write().await;
            match objects.get(&key) {
                None => return Ok(()),
                Some(current) if !snapshot.uid.is_empty() && current.uid != snapshot.uid => {
                    return Err(StoreError::Conflict {
                        key,
                        expected: snapshot.uid.clone(),
                        actual: current.uid.clone(),
                    });
                }
                Some(_) => {
                    objects.remove(&key);
                }
            }
        }

        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());
        self.notify(key);
        Ok(())
    }
}
