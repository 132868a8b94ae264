// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event and record types.
//!
//! A [`Record`] is one decoded unit of application data extracted from a
//! raw payload. An [`Event`] is the object the relay assembles per record
//! and pushes to the analytics sink: arbitrary merged payload fields plus
//! two reserved keys, [`TOPIC_FIELD`] and [`KEEN_FIELD`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved event key carrying the originating topic.
pub const TOPIC_FIELD: &str = "mqtt_topic";

/// Reserved event key holding the nested timing object.
pub const KEEN_FIELD: &str = "keen";

/// Key of the timestamp inside the [`KEEN_FIELD`] object.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// One decoded unit of application data: a JSON object.
pub type Record = Map<String, Value>;

/// An analytics event under construction.
///
/// Created empty for each record, mutated by the pipeline stages, and
/// consumed exactly once by the sink push. Serializes transparently as
/// the underlying JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Create an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, returning the previous value if the key existed.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Look up a field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Shallow-merge all fields of `record` into this event.
    ///
    /// Record keys win on conflict.
    pub fn merge_record(&mut self, record: &Record) {
        for (key, value) in record {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Number of fields currently set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no field has been set yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the event, yielding the underlying JSON object.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// View the event as a borrowed JSON object.
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Event {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
