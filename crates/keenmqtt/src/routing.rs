// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic to collection routing.
//!
//! A [`CollectionMap`] holds the subscription patterns the relay cares
//! about and the destination collection for each. It is read on every
//! incoming message to resolve routing, and separately to derive the
//! set of patterns to (re)subscribe on the bus.

use crate::event::Record;
use crate::topic::filter_matches;
use std::collections::BTreeMap;

/// Mapping from subscription pattern to destination collection.
///
/// At most one collection per exact pattern string; re-adding a pattern
/// overwrites its collection silently.
#[derive(Debug, Clone, Default)]
pub struct CollectionMap {
    mappings: BTreeMap<String, String>,
}

impl CollectionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the collection for `pattern`.
    ///
    /// Pure mutation: registering a pattern here does not subscribe it
    /// on the bus; subscriptions are (re)registered by the relay's
    /// on-connect path.
    pub fn add_mapping(&mut self, pattern: impl Into<String>, collection: impl Into<String>) {
        self.mappings.insert(pattern.into(), collection.into());
    }

    /// Resolve the destination collection for a message on `topic`.
    ///
    /// The decoded record rides along so routing rules can discriminate
    /// on message content; the built-in rules match on the topic alone.
    /// Returns `None` when no pattern matches (not an error, the
    /// message is simply not relayed). When several patterns match, an
    /// exact (wildcard-free) pattern equal to the topic wins; otherwise
    /// the first match in lexicographic pattern order wins. Resolution
    /// therefore depends only on the mapping content, never on
    /// insertion order.
    pub fn resolve(&self, topic: &str, _record: &Record) -> Option<&str> {
        if let Some(collection) = self.mappings.get(topic) {
            return Some(collection);
        }
        self.mappings
            .iter()
            .find(|(pattern, _)| filter_matches(pattern, topic))
            .map(|(_, collection)| collection.as_str())
    }

    /// All registered subscription patterns, in lexicographic order.
    pub fn patterns(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    /// Iterate over (pattern, collection) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings
            .iter()
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// True when no pattern is registered.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
