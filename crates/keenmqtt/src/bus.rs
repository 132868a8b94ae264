// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The message-bus collaborator seam.
//!
//! The relay drives a [`BusClient`] and never assumes a concrete
//! transport: [`crate::mqtt::MqttClient`] talks to a real broker, while
//! [`MemoryBus`] is an in-process loopback for tests and offline runs.
//!
//! One call to [`BusClient::poll`] is one unit of bus servicing: it
//! drains whatever inbound work is pending and reports it as
//! [`BusEvent`]s. `BusEvent::Connected` fires after every successful
//! (re)connection and drives the relay's resubscription path;
//! `BusEvent::Message` carries one inbound publication.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::topic::filter_matches;

/// Bus transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to the bus")]
    NotConnected,

    #[error("Connection refused by broker: {0}")]
    Refused(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One unit of inbound bus activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The connection (re)established; subscriptions must be
    /// re-registered.
    Connected,

    /// One inbound publication.
    Message { topic: String, payload: Vec<u8> },
}

/// A publish/subscribe bus connection.
pub trait BusClient: Send {
    /// Establish the connection. Emits [`BusEvent::Connected`] on the
    /// next [`poll`](Self::poll).
    fn connect(&mut self) -> Result<(), BusError>;

    /// Register a subscription filter.
    fn subscribe(&mut self, filter: &str) -> Result<(), BusError>;

    /// Publish a payload to a topic.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Perform one unit of servicing: drain pending inbound work.
    ///
    /// Never blocks waiting for new data; an empty vector simply means
    /// nothing was pending.
    fn poll(&mut self) -> Result<Vec<BusEvent>, BusError>;

    /// True while the connection is established.
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default)]
struct MemoryBusState {
    connected: bool,
    subscriptions: Vec<String>,
    subscribe_log: Vec<String>,
    pending: VecDeque<BusEvent>,
    published: Vec<(String, Vec<u8>)>,
}

/// In-process loopback bus.
///
/// `publish` delivers straight back to matching subscriptions, and the
/// paired [`MemoryBusHandle`] can inject inbound messages, force
/// reconnect notifications, and inspect what the relay subscribed:
/// everything a broker would do, minus the socket.
#[derive(Debug)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

/// Control/inspection handle paired with a [`MemoryBus`].
#[derive(Debug, Clone)]
pub struct MemoryBusHandle {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    /// Create a loopback bus and its control handle.
    pub fn new() -> (Self, MemoryBusHandle) {
        let state = Arc::new(Mutex::new(MemoryBusState::default()));
        (
            Self {
                state: state.clone(),
            },
            MemoryBusHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BusClient for MemoryBus {
    fn connect(&mut self) -> Result<(), BusError> {
        let mut state = self.lock();
        state.connected = true;
        state.pending.push_back(BusEvent::Connected);
        Ok(())
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        state.subscribe_log.push(filter.to_string());
        if !state.subscriptions.iter().any(|f| f == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut state = self.lock();
        state.published.push((topic.to_string(), payload.to_vec()));
        let matched = state
            .subscriptions
            .iter()
            .any(|filter| filter_matches(filter, topic));
        if matched {
            state.pending.push_back(BusEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<BusEvent>, BusError> {
        let mut state = self.lock();
        Ok(state.pending.drain(..).collect())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

impl MemoryBusHandle {
    fn lock(&self) -> MutexGuard<'_, MemoryBusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue an inbound message, as if the broker delivered it.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        self.lock().pending.push_back(BusEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Queue a reconnect notification, as after a broker restart.
    pub fn force_reconnect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.pending.push_back(BusEvent::Connected);
    }

    /// Currently registered subscription filters (deduplicated).
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Every `subscribe` call in order, including repeats.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.lock().subscribe_log.clone()
    }

    /// Everything published through the bus, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Number of events waiting to be polled.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_emits_connected_event() {
        let (mut bus, _handle) = MemoryBus::new();
        bus.connect().expect("connect");

        assert!(bus.is_connected());
        assert_eq!(bus.poll().expect("poll"), vec![BusEvent::Connected]);
        assert!(bus.poll().expect("poll").is_empty());
    }

    #[test]
    fn test_publish_loops_back_to_matching_subscription() {
        let (mut bus, _handle) = MemoryBus::new();
        bus.connect().expect("connect");
        bus.poll().expect("drain connect event");

        bus.subscribe("home/+/temp").expect("subscribe");
        bus.publish("home/kitchen/temp", b"{}").expect("publish");
        bus.publish("office/kitchen/temp", b"{}").expect("publish");

        let events = bus.poll().expect("poll");
        assert_eq!(
            events,
            vec![BusEvent::Message {
                topic: "home/kitchen/temp".to_string(),
                payload: b"{}".to_vec(),
            }]
        );
    }

    #[test]
    fn test_subscribe_log_records_repeats() {
        let (mut bus, handle) = MemoryBus::new();
        bus.subscribe("a/#").expect("subscribe");
        bus.subscribe("a/#").expect("subscribe");

        assert_eq!(handle.subscriptions(), vec!["a/#".to_string()]);
        assert_eq!(handle.subscribe_log().len(), 2);
    }

    #[test]
    fn test_handle_injects_unsubscribed_topics() {
        let (mut bus, handle) = MemoryBus::new();
        handle.inject("never/subscribed", b"x");

        let events = bus.poll().expect("poll");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_force_reconnect_queues_connected() {
        let (mut bus, handle) = MemoryBus::new();
        handle.force_reconnect();

        assert_eq!(bus.poll().expect("poll"), vec![BusEvent::Connected]);
    }
}
