use common::{ResourceKey, StoreError};
use thiserror::Error;

/// Errors returned by a reconcile. Both variants ask for redelivery.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Failed to fetch {key}: {source}")]
    Fetch {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    #[error("Invalid TTL annotation '{value}' on {key}: {reason}")]
    InvalidTtl {
        key: ResourceKey,
        value: String,
        reason: String,
    },
}

impl ReconcileError {
    pub fn key(&self) -> &ResourceKey {
        match self {
            ReconcileError::Fetch { key, .. } | ReconcileError::InvalidTtl { key, .. } => key,
        }
    }

    /// Whether a later attempt can succeed without the resource changing.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Fetch { .. })
    }
}

/// Returned when arming a timer after the controller has stopped
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timer registry is closed")]
pub struct RegistryClosed;
