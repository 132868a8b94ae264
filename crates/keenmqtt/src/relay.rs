// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay lifecycle and dispatch.
//!
//! [`KeenRelay`] owns the bus connection, the collection map, the
//! decoder and the event pipeline, and services them in one of two
//! mutually exclusive modes: a background worker thread ([`start`] /
//! [`stop`]) or caller-driven single stepping ([`step`]). The two
//! modes never run concurrently; `step` refuses while a worker owns
//! the bus.
//!
//! [`start`]: KeenRelay::start
//! [`stop`]: KeenRelay::stop
//! [`step`]: KeenRelay::step

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusClient, BusError, BusEvent};
use crate::config::{ConfigError, RelayConfig};
use crate::decode::{DecodeError, JsonDecoder, PayloadDecoder};
use crate::event::{Event, Record};
use crate::mqtt::MqttClient;
use crate::pipeline::{EventPipeline, PipelineStage};
use crate::routing::CollectionMap;
use crate::sink::{EventSink, KeenSink, SinkError};
use crate::topic;

/// Worker sleep between polls when the bus had nothing pending.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Worker back-off after a servicing error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Relay lifecycle and dispatch errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// `step()` was called while a background worker owns servicing.
    #[error("Relay is running in the background; step() is unavailable")]
    BackgroundRunning,

    /// `start()` was called twice without an intervening `stop()`.
    #[error("Relay is already running")]
    AlreadyRunning,

    /// `setup()` had neither a supplied collaborator nor the
    /// configuration to construct one.
    #[error("No {0} configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Point-in-time relay counter values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub messages_received: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub records_filtered: u64,
    pub records_unrouted: u64,
    pub events_pushed: u64,
    pub push_errors: u64,
}

#[derive(Debug)]
struct RelayStats {
    started: Instant,
    messages_received: AtomicU64,
    records_decoded: AtomicU64,
    decode_errors: AtomicU64,
    records_filtered: AtomicU64,
    records_unrouted: AtomicU64,
    events_pushed: AtomicU64,
    push_errors: AtomicU64,
}

impl RelayStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            messages_received: AtomicU64::new(0),
            records_decoded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            records_filtered: AtomicU64::new(0),
            records_unrouted: AtomicU64::new(0),
            events_pushed: AtomicU64::new(0),
            push_errors: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started.elapsed(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            records_filtered: self.records_filtered.load(Ordering::Relaxed),
            records_unrouted: self.records_unrouted.load(Ordering::Relaxed),
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            push_errors: self.push_errors.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the relay, its worker thread and stop handles.
#[derive(Debug)]
struct RelayState {
    ready: AtomicBool,
    running: AtomicBool,
    stats: RelayStats,
}

impl RelayState {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: RelayStats::new(),
        }
    }
}

/// Cloneable handle that asks a running relay to stop.
///
/// Only flips the running flag; the owner still calls
/// [`KeenRelay::stop`] to join the worker thread.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<RelayState>,
}

impl StopHandle {
    /// Signal the background worker to exit after its current
    /// iteration.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
    }
}

/// Everything the servicing path touches, behind one lock.
struct RelayCore {
    config: RelayConfig,
    bus: Option<Box<dyn BusClient>>,
    sink: Option<Box<dyn EventSink>>,
    mappings: CollectionMap,
    decoder: Box<dyn PayloadDecoder>,
    pipeline: EventPipeline,
}

impl RelayCore {
    /// Fold `collection_mappings` from configuration into the routing
    /// map. Configuration entries overwrite earlier manual ones for
    /// the same pattern.
    fn apply_config_mappings(&mut self) {
        for (pattern, collection) in &self.config.collection_mappings {
            self.mappings.add_mapping(pattern.clone(), collection.clone());
        }
    }

    /// Register every known pattern with the bus. Failures are logged
    /// and skipped so one bad subscription cannot block the rest; once
    /// the connection itself is gone the loop stops, since the next
    /// on-connect re-registers everything anyway.
    fn resubscribe_all(&mut self) {
        let Some(bus) = self.bus.as_mut() else {
            return;
        };
        for pattern in self.mappings.patterns() {
            match bus.subscribe(&pattern) {
                Ok(()) => debug!(pattern = %pattern, "Subscribed"),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Subscription failed");
                    if !bus.is_connected() {
                        break;
                    }
                }
            }
        }
    }

    /// Connection (or reconnection) established: re-register every
    /// pattern and mark the relay ready. Safe to run repeatedly.
    fn on_connect(&mut self, state: &RelayState) {
        info!(
            subscriptions = self.mappings.len(),
            "Bus connected; registering subscriptions"
        );
        self.resubscribe_all();
        state.ready.store(true, Ordering::SeqCst);
    }

    /// Drain pending bus events and dispatch them.
    ///
    /// Returns the number of bus events handled. A decode failure
    /// terminates processing of that message only; remaining events in
    /// the batch are still dispatched and the first failure is
    /// returned afterwards.
    fn service(&mut self, state: &RelayState) -> Result<usize, RelayError> {
        let events = match self.bus.as_mut() {
            Some(bus) => bus.poll()?,
            None => return Ok(0),
        };

        let handled = events.len();
        let mut first_error = None;
        for event in events {
            match event {
                BusEvent::Connected => self.on_connect(state),
                BusEvent::Message { topic, payload } => {
                    state.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.on_message(&topic, &payload, state) {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// Decode one inbound message and dispatch each record through
    /// routing, the pipeline and the sink.
    fn on_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        state: &RelayState,
    ) -> Result<(), RelayError> {
        let records = match self.decoder.decode(topic, payload) {
            Ok(records) => records,
            Err(e) => {
                state.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %topic, error = %e, "Payload decode failed");
                return Err(e.into());
            }
        };
        state
            .stats
            .records_decoded
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        for record in &records {
            self.process_record(topic, record, state);
        }
        Ok(())
    }

    /// Route one record and, if it survives the pipeline, push it.
    fn process_record(&mut self, topic: &str, record: &Record, state: &RelayState) {
        let Some(collection) = self.mappings.resolve(topic, record) else {
            state.stats.records_unrouted.fetch_add(1, Ordering::Relaxed);
            trace!(topic = %topic, "No collection mapping; record dropped");
            return;
        };
        let collection = collection.to_string();

        let mut event = Event::new();
        if !self.pipeline.run(&mut event, topic, record) {
            state.stats.records_filtered.fetch_add(1, Ordering::Relaxed);
            trace!(topic = %topic, "Record cancelled by pipeline");
            return;
        }

        self.push_event(&collection, &event, state);
    }

    /// Push a finished event to the sink.
    ///
    /// Push failures are counted and logged, never propagated: the
    /// relay performs no retries of its own.
    ///
    /// # Panics
    ///
    /// Panics if the relay was never marked ready. Pushing before
    /// `setup()` completed is a programming error, not a runtime
    /// condition.
    fn push_event(&mut self, collection: &str, event: &Event, state: &RelayState) {
        assert!(
            state.ready.load(Ordering::SeqCst),
            "push_event called before setup() completed"
        );
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        match sink.add_event(collection, event) {
            Ok(()) => {
                state.stats.events_pushed.fetch_add(1, Ordering::Relaxed);
                debug!(collection = %collection, "Event pushed");
            }
            Err(e) => {
                state.stats.push_errors.fetch_add(1, Ordering::Relaxed);
                warn!(collection = %collection, error = %e, "Event push failed");
            }
        }
    }
}

/// MQTT to Keen IO relay.
///
/// Construction wires nothing: collaborators are injected with the
/// `with_*` builders or constructed from configuration by
/// [`setup`](Self::setup), which also arms the connection. Servicing
/// then happens either on a background worker ([`start`](Self::start))
/// or one drain at a time on the caller's thread
/// ([`step`](Self::step)).
pub struct KeenRelay {
    core: Arc<Mutex<RelayCore>>,
    state: Arc<RelayState>,
    worker: Option<thread::JoinHandle<()>>,
}

impl KeenRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(RelayCore {
                config,
                bus: None,
                sink: None,
                mappings: CollectionMap::new(),
                decoder: Box::new(JsonDecoder),
                pipeline: EventPipeline::standard(),
            })),
            state: Arc::new(RelayState::new()),
            worker: None,
        }
    }

    /// Use an existing bus client instead of constructing one from
    /// configuration during `setup()`.
    pub fn with_bus(self, bus: Box<dyn BusClient>) -> Self {
        self.lock_core().bus = Some(bus);
        self
    }

    /// Use an existing event sink instead of constructing one from
    /// configuration during `setup()`.
    pub fn with_sink(self, sink: Box<dyn EventSink>) -> Self {
        self.lock_core().sink = Some(sink);
        self
    }

    /// Replace the payload decoder.
    pub fn with_decoder(self, decoder: Box<dyn PayloadDecoder>) -> Self {
        self.lock_core().decoder = decoder;
        self
    }

    /// Replace the whole stage chain.
    pub fn with_pipeline(self, pipeline: EventPipeline) -> Self {
        self.lock_core().pipeline = pipeline;
        self
    }

    /// Append a stage to the current chain.
    pub fn add_stage(&self, stage: Box<dyn PipelineStage>) {
        self.lock_core().pipeline.push(stage);
    }

    /// Map a subscription pattern to a collection.
    ///
    /// Upserts: mapping an existing pattern overwrites its collection.
    /// Patterns registered here are subscribed on the next connect.
    pub fn add_mapping(&self, pattern: &str, collection: &str) -> Result<(), RelayError> {
        topic::validate_filter(pattern).map_err(ConfigError::from)?;
        self.lock_core().mappings.add_mapping(pattern, collection);
        Ok(())
    }

    /// Wire collaborators and arm the connection.
    ///
    /// Applies configured collection mappings, then: a supplied bus is
    /// reused and immediately re-registered with every known pattern;
    /// otherwise an MQTT client is built from configuration and
    /// connected. The sink mirrors this. On success the relay is
    /// marked ready.
    ///
    /// Readiness is flagged as soon as wiring completes, which for a
    /// freshly constructed bus is before the broker has acknowledged
    /// any subscription. The connected callback re-marks ready once
    /// the session is actually up.
    pub fn setup(&mut self) -> Result<(), RelayError> {
        {
            let mut core = self.lock_core();
            core.apply_config_mappings();

            if core.bus.is_some() {
                core.resubscribe_all();
            } else {
                let mqtt = core
                    .config
                    .mqtt
                    .clone()
                    .ok_or(RelayError::NotConfigured("MQTT broker"))?;
                let mut client = MqttClient::new(&mqtt);
                client.connect()?;
                core.bus = Some(Box::new(client));
            }

            if core.sink.is_none() {
                let keen = core
                    .config
                    .keen
                    .clone()
                    .ok_or(RelayError::NotConfigured("event sink"))?;
                core.sink = Some(Box::new(KeenSink::new(&keen)?));
            }
        }

        self.state.ready.store(true, Ordering::SeqCst);
        info!("Relay ready");
        Ok(())
    }

    /// Hand servicing to a background worker thread.
    ///
    /// Returns [`RelayError::AlreadyRunning`] if a worker is already
    /// active. The caller's thread is never blocked.
    pub fn start(&mut self) -> Result<(), RelayError> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        let worker = match thread::Builder::new()
            .name("keenmqtt-relay".to_string())
            .spawn(move || run_loop(&core, &state))
        {
            Ok(worker) => worker,
            Err(e) => {
                self.state.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop background servicing and join the worker.
    ///
    /// Idempotent; a relay that was never started is a no-op. Any
    /// message dispatch already in flight completes before this
    /// returns.
    pub fn stop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Relay worker thread panicked");
            }
        }
    }

    /// Service the bus exactly once on the caller's thread.
    ///
    /// Drains currently pending messages and dispatches them. Fails
    /// with [`RelayError::BackgroundRunning`] while a worker owns
    /// servicing; single-step and background modes never interleave.
    pub fn step(&mut self) -> Result<(), RelayError> {
        if self.state.running.load(Ordering::SeqCst) {
            return Err(RelayError::BackgroundRunning);
        }
        let mut core = self.lock_core();
        core.service(&self.state).map(|_| ())
    }

    /// True once `setup()` has completed.
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    /// True while a background worker owns servicing.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Counter snapshot for status reporting.
    pub fn stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    /// Handle for signal handlers and other threads to request a stop.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, RelayCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for KeenRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background servicing loop. Runs until the running flag clears.
fn run_loop(core: &Mutex<RelayCore>, state: &RelayState) {
    debug!("Relay worker started");
    while state.running.load(Ordering::SeqCst) {
        let result = {
            let mut core = match core.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            core.service(state)
        };

        match result {
            // Keep draining while the bus is busy.
            Ok(handled) if handled > 0 => {}
            Ok(_) => thread::sleep(POLL_INTERVAL),
            // Already counted and logged at decode time; a malformed
            // payload must not stall the loop.
            Err(RelayError::Decode(_)) => {}
            Err(e) => {
                warn!(error = %e, "Servicing failed; backing off");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!("Relay worker stopped");
}
