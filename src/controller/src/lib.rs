//! TTL deletion controller
//!
//! Resources that carry a TTL annotation are deleted a fixed number of
//! seconds after they became ready. The controller reconciles one key at a
//! time against a [`common::ResourceStore`], arms at most one cancellable
//! timer per key in the [`TimerRegistry`], and hands expired timers to a
//! background deletion executor.
//!
//! ```rust,ignore
//! let store = Arc::new(InMemoryResourceStore::new());
//! let controller = TtlController::start(&config.controller, store.clone());
//! store.set_watcher(controller.queue().sender());
//! // ...
//! controller.shutdown().await.log();
//! ```

pub mod error;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use error::{ReconcileError, RegistryClosed};
pub use metrics::{ControllerMetrics, MetricsSummary};
pub use queue::{Dispatcher, WorkQueue, work_queue};
pub use reconciler::{Reconcile, ReconcileOutcome, TtlReconciler};
pub use registry::{TimerEntry, TimerRegistry, TimerState};
pub use runtime::TtlController;
pub use worker::{DeletionExecutor, DeletionMessage, DeletionRequest, create_expiration_system};
