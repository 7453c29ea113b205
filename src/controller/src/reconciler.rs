//! Per-key reconcile logic
//!
//! A reconcile looks at the current snapshot of one resource and decides
//! whether a deletion timer should exist for it. It never deletes anything
//! itself; that is left to the expiration worker once the deadline passes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::ControllerConfig;
use common::{ResourceKey, ResourceStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::registry::{TimerRegistry, TimerState};

/// What a successful reconcile did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource is gone; `cancelled` tells whether a pending timer was stopped
    Disarmed { cancelled: bool },
    /// The resource carries no TTL annotation
    NoTtlAnnotation,
    /// The resource has a TTL but is not ready yet
    NotReady,
    /// A timer already exists for this key; it was left untouched
    AlreadyArmed { expires_at: DateTime<Utc> },
    /// A new timer was armed
    Armed { expires_at: DateTime<Utc> },
    /// The existing timer has fired and its delete is in flight; the key
    /// needs another look once the entry is retired
    Firing { expires_at: DateTime<Utc> },
    /// The controller has stopped; nothing was armed
    Stopped,
}

/// Something that can reconcile a single key.
///
/// The dispatcher drives implementations of this trait; tests substitute
/// their own to observe scheduling.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError>;
}

/// Arms deletion timers for resources that declare a TTL
pub struct TtlReconciler {
    store: Arc<dyn ResourceStore>,
    registry: TimerRegistry,
    ttl_annotation: String,
    ready_condition: String,
}

impl TtlReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: TimerRegistry,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            ttl_annotation: config.ttl_annotation.clone(),
            ready_condition: config.ready_condition.clone(),
        }
    }

    pub fn registry(&self) -> &TimerRegistry {
        &self.registry
    }
}

#[async_trait]
impl Reconcile for TtlReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = match self.store.fetch(key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                let cancelled = self.registry.disarm(key);
                if cancelled {
                    info!(key = %key, "Resource gone, timer disarmed");
                } else {
                    debug!(key = %key, "Resource gone, no timer to disarm");
                }
                return Ok(ReconcileOutcome::Disarmed { cancelled });
            }
            Err(source) => {
                warn!(key = %key, error = %source, "Failed to fetch resource");
                return Err(ReconcileError::Fetch {
                    key: key.clone(),
                    source,
                });
            }
        };

        let Some(value) = snapshot.annotation(&self.ttl_annotation) else {
            debug!(key = %key, annotation = %self.ttl_annotation, "No TTL annotation");
            return Ok(ReconcileOutcome::NoTtlAnnotation);
        };

        let Some(ready_at) = snapshot.ready_since(&self.ready_condition) else {
            debug!(key = %key, condition = %self.ready_condition, "Resource not ready");
            return Ok(ReconcileOutcome::NotReady);
        };

        let expires_at = parse_ttl(value)
            .and_then(|ttl| {
                ready_at
                    .checked_add_signed(ttl)
                    .ok_or_else(|| format!("{value} seconds after {ready_at} is out of range"))
            })
            .map_err(|reason| {
                warn!(key = %key, value = %value, reason = %reason, "Invalid TTL annotation");
                ReconcileError::InvalidTtl {
                    key: key.clone(),
                    value: value.to_string(),
                    reason,
                }
            })?;

        let Ok((created, entry)) = self.registry.arm_if_absent(snapshot, expires_at) else {
            debug!(key = %key, "Controller stopped, not arming");
            return Ok(ReconcileOutcome::Stopped);
        };

        if created {
            return Ok(ReconcileOutcome::Armed { expires_at });
        }

        debug!(
            key = %key,
            expires_at = %entry.expires_at,
            state = ?entry.state,
            "Timer already armed"
        );
        match entry.state {
            TimerState::Armed => Ok(ReconcileOutcome::AlreadyArmed {
                expires_at: entry.expires_at,
            }),
            TimerState::Firing => Ok(ReconcileOutcome::Firing {
                expires_at: entry.expires_at,
            }),
        }
    }
}

/// Parse a TTL annotation value as a non-negative number of seconds.
fn parse_ttl(value: &str) -> Result<chrono::Duration, String> {
    let seconds: u64 = value.parse().map_err(|e| format!("{e}"))?;
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| format!("{seconds} seconds is out of range"))
}
