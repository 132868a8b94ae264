// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in MQTT 3.1.1 client.
//!
//! A deliberately small client covering what the relay needs: QoS 0
//! subscribe/publish, keepalive, and automatic reconnection. The wire
//! codec lives in [`packet`]; [`client::MqttClient`] drives a
//! nonblocking `TcpStream` and implements [`crate::bus::BusClient`].
//!
//! Not implemented: QoS 1/2 flows, retained-message publishing, will
//! messages, and UNSUBSCRIBE, none of which the relay uses.

pub mod client;
pub mod packet;

pub use client::MqttClient;
