// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster event records carried through the relay.
//!
//! The wire form is the JSON produced by the cluster's `events.k8s.io/v1` API, so an
//! [`Event`] published by the collector can be read back by the indexer and archiver
//! without any intermediate schema.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// The object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub api_version: String,
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Event {
    pub metadata: ObjectMeta,
    pub event_time: Option<DateTime<Utc>>,
    pub reporting_controller: String,
    pub reason: String,
    pub regarding: ObjectReference,
    pub note: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub deprecated_first_timestamp: Option<DateTime<Utc>>,
    pub deprecated_last_timestamp: Option<DateTime<Utc>>,
    pub deprecated_count: i32,
}

/// Borrowed name/namespace/uid triple used whenever an event is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{namespace}/{name} (uid {uid})")]
pub struct EventIdentity<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub uid: &'a str,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                uid: uid.into(),
                ..ObjectMeta::default()
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn identity(&self) -> EventIdentity<'_> {
        EventIdentity {
            namespace: &self.metadata.namespace,
            name: &self.metadata.name,
            uid: &self.metadata.uid,
        }
    }

    /// Serializes the event as a single JSON document without a trailing newline.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_EVENT: &str = r#"{
        "metadata": {
            "name": "web-7d9f.17a2b3c4d5e6f789",
            "namespace": "shop",
            "uid": "0b1e4c36-5a7f-4f0e-9f1d-2d6c9a3b8e11",
            "resourceVersion": "48213",
            "creationTimestamp": "2024-05-02T10:15:30Z"
        },
        "eventTime": null,
        "reportingController": "kubelet",
        "reason": "BackOff",
        "regarding": {
            "kind": "Pod",
            "namespace": "shop",
            "name": "web-7d9f",
            "uid": "5c2d8e90-1b3a-4c7d-8e6f-0a9b1c2d3e4f",
            "apiVersion": "v1",
            "resourceVersion": "48100"
        },
        "note": "Back-off restarting failed container",
        "type": "Warning",
        "deprecatedFirstTimestamp": "2024-05-02T10:10:00Z",
        "deprecatedLastTimestamp": "2024-05-02T10:15:30Z",
        "deprecatedCount": 7
    }"#;

    #[test]
    fn test_decode_cluster_event() {
        let event = Event::from_json(CLUSTER_EVENT.as_bytes()).expect("failed to decode event");

        assert_eq!(event.metadata.namespace, "shop");
        assert_eq!(event.reason, "BackOff");
        assert_eq!(event.regarding.kind, "Pod");
        assert_eq!(event.event_type, "Warning");
        assert_eq!(event.deprecated_count, 7);
        assert!(event.event_time.is_none());
        assert_eq!(
            event
                .deprecated_last_timestamp
                .map(|t| t.to_rfc3339())
                .as_deref(),
            Some("2024-05-02T10:15:30+00:00")
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let event = Event::from_json(br#"{"metadata":{"name":"a"}}"#).expect("failed to decode");
        assert_eq!(event.metadata.name, "a");
        assert_eq!(event.metadata.namespace, "");
        assert_eq!(event.deprecated_count, 0);
    }

    #[test]
    fn test_encoded_field_names() {
        let event = Event::from_json(CLUSTER_EVENT.as_bytes()).expect("failed to decode event");
        let value: serde_json::Value =
            serde_json::from_slice(&event.to_json().expect("failed to encode"))
                .expect("encoded event is not JSON");

        assert_eq!(value["type"], "Warning");
        assert_eq!(value["reportingController"], "kubelet");
        assert_eq!(value["metadata"]["resourceVersion"], "48213");
        assert_eq!(value["regarding"]["apiVersion"], "v1");
    }

    #[test]
    fn test_identity_display() {
        let event = Event::new("web.1", "shop", "abc-123");
        assert_eq!(event.identity().to_string(), "shop/web.1 (uid abc-123)");
    }
}
