//! Fluent builder for resource snapshots used as fixtures.

use chrono::{DateTime, Utc};

use crate::config::{DEFAULT_READY_CONDITION, DEFAULT_TTL_ANNOTATION};
use crate::model::{Condition, ResourceSnapshot};

#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    snapshot: ResourceSnapshot,
}

impl SnapshotBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            snapshot: ResourceSnapshot::new(namespace, name),
        }
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.snapshot.uid = uid.to_string();
        self
    }

    /// Set the TTL annotation under the default annotation key.
    pub fn with_ttl(self, ttl: &str) -> Self {
        self.with_annotation(DEFAULT_TTL_ANNOTATION, ttl)
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.snapshot
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Append a true `Ready` condition that transitioned at `at`.
    pub fn ready_at(self, at: DateTime<Utc>) -> Self {
        self.with_condition(DEFAULT_READY_CONDITION, true, at)
    }

    /// Append a false `Ready` condition.
    pub fn not_ready(self) -> Self {
        self.with_condition(DEFAULT_READY_CONDITION, false, Utc::now())
    }

    pub fn with_condition(mut self, condition_type: &str, status: bool, at: DateTime<Utc>) -> Self {
        self.snapshot
            .conditions
            .push(Condition::new(condition_type, status, at));
        self
    }

    pub fn build(self) -> ResourceSnapshot {
        self.snapshot
    }
}
