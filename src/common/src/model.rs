//! Resource data model shared by the store and the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identity of a trackable resource: a (namespace, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Error returned when a `namespace/name` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid resource key '{0}': expected 'namespace/name'")]
pub struct ParseResourceKeyError(String);

impl FromStr for ResourceKey {
    type Err = ParseResourceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ParseResourceKeyError(s.to_string())),
        }
    }
}

/// A single status condition as reported in the resource's status block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: bool,
        last_transition_time: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            last_transition_time,
        }
    }
}

/// Observed state of a resource at fetch time.
///
/// `uid` and `resource_version` identify the exact object the snapshot was
/// taken from, so a deletion request built from it cannot hit a different
/// object that later reused the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ResourceSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: String::new(),
            resource_version: 0,
            annotations: BTreeMap::new(),
            conditions: Vec::new(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    /// Value of the given annotation. Empty values count as absent.
    pub fn annotation(&self, annotation_key: &str) -> Option<&str> {
        self.annotations
            .get(annotation_key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Transition time of the last condition of `condition_type` whose
    /// status is true, if any.
    pub fn ready_since(&self, condition_type: &str) -> Option<DateTime<Utc>> {
        self.conditions
            .iter()
            .rev()
            .find(|c| c.condition_type == condition_type && c.status)
            .map(|c| c.last_transition_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_resource_key_display_and_parse() {
        let key = ResourceKey::new("default", "web-0");
        assert_eq!(key.to_string(), "default/web-0");
        assert_eq!("default/web-0".parse::<ResourceKey>().unwrap(), key);

        assert!("web-0".parse::<ResourceKey>().is_err());
        assert!("/web-0".parse::<ResourceKey>().is_err());
        assert!("default/".parse::<ResourceKey>().is_err());
        assert!("a/b/c".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_empty_annotation_is_absent() {
        let mut snapshot = ResourceSnapshot::new("default", "web-0");
        snapshot
            .annotations
            .insert("nummel.in/pod-ttl".to_string(), String::new());
        assert_eq!(snapshot.annotation("nummel.in/pod-ttl"), None);

        snapshot
            .annotations
            .insert("nummel.in/pod-ttl".to_string(), "30".to_string());
        assert_eq!(snapshot.annotation("nummel.in/pod-ttl"), Some("30"));
        assert_eq!(snapshot.annotation("other"), None);
    }

    #[test]
    fn test_ready_since_ignores_false_and_other_types() {
        let mut snapshot = ResourceSnapshot::new("default", "web-0");
        snapshot.conditions = vec![
            Condition::new("Initialized", true, at(10)),
            Condition::new("Ready", false, at(20)),
        ];
        assert_eq!(snapshot.ready_since("Ready"), None);

        snapshot.conditions.push(Condition::new("Ready", true, at(30)));
        assert_eq!(snapshot.ready_since("Ready"), Some(at(30)));
    }

    #[test]
    fn test_ready_since_prefers_last_true_condition() {
        let mut snapshot = ResourceSnapshot::new("default", "web-0");
        snapshot.conditions = vec![
            Condition::new("Ready", true, at(10)),
            Condition::new("Ready", true, at(50)),
            Condition::new("Ready", false, at(70)),
        ];
        assert_eq!(snapshot.ready_since("Ready"), Some(at(50)));
    }

    #[test]
    fn test_snapshot_deserializes_with_defaults() {
        let json = r#"{
            "namespace": "default",
            "name": "web-0",
            "annotations": {"nummel.in/pod-ttl": "30"},
            "conditions": [
                {"type": "Ready", "status": true, "last_transition_time": "2024-01-01T00:00:00Z"}
            ]
        }"#;
        let snapshot: ResourceSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.key(), ResourceKey::new("default", "web-0"));
        assert!(snapshot.uid.is_empty());
        assert_eq!(snapshot.resource_version, 0);
        assert_eq!(
            snapshot.ready_since("Ready"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }
}
