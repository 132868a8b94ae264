// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! keenmqtt - MQTT to Keen IO event relay.
//!
//! Subscribes to MQTT topics, decodes JSON payloads and pushes each
//! record as a timestamped event into Keen IO collections.
//!
//! # Features
//!
//! - Wildcard topic routing: `+` and `#` subscription patterns mapped
//!   to collections, exact patterns taking precedence
//! - JSON payload decoding behind a pluggable [`PayloadDecoder`] seam
//! - Ordered, cancellable event pipeline (topic, payload and timestamp
//!   stages; custom stages via [`PipelineStage`])
//! - Background worker or caller-driven single-step servicing
//! - Built-in MQTT 3.1.1 client (QoS 0) with automatic reconnect and
//!   resubscription
//!
//! # Quick start
//!
//! ```no_run
//! use keenmqtt::{KeenRelay, RelayConfig};
//!
//! # fn main() -> Result<(), keenmqtt::RelayError> {
//! let config = RelayConfig::from_file("config.yaml")?;
//! let mut relay = KeenRelay::new(config);
//! relay.add_mapping("home/+/temperature", "temperatures")?;
//! relay.setup()?;
//! relay.start()?;
//! // ... the relay services the bus until stop()
//! relay.stop();
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod decode;
pub mod event;
pub mod mqtt;
pub mod pipeline;
pub mod relay;
pub mod routing;
pub mod sink;
pub mod topic;

pub use bus::{BusClient, BusError, BusEvent, MemoryBus, MemoryBusHandle};
pub use config::{ConfigError, KeenConfig, MqttConfig, RelayConfig};
pub use decode::{DecodeError, JsonDecoder, PayloadDecoder};
pub use event::{Event, Record};
pub use mqtt::MqttClient;
pub use pipeline::{
    EventPipeline, FnStage, PayloadStage, PipelineStage, SystemClock, TimeSource, TimeStage,
    TopicStage,
};
pub use relay::{KeenRelay, RelayError, StatsSnapshot, StopHandle};
pub use routing::CollectionMap;
pub use sink::{EventSink, KeenSink, RecordingSink, RecordingSinkHandle, SinkError};
pub use topic::{filter_matches, validate_filter, InvalidFilter};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
