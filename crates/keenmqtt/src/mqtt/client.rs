// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Synchronous MQTT client over TCP.
//!
//! The connect handshake runs blocking (with timeouts); once the
//! session is established the socket switches to nonblocking mode and
//! all further servicing happens through [`BusClient::poll`].

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::bus::{BusClient, BusError, BusEvent};
use crate::config::MqttConfig;
use crate::mqtt::packet::{self, ConnectOptions, Packet, PacketReader};

/// TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the broker's CONNACK.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between reconnect attempts after a connection loss.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// MQTT 3.1.1 client servicing a single broker connection.
///
/// Poll-driven: [`poll`](BusClient::poll) drains inbound publishes,
/// answers keepalive traffic and transparently reconnects (with a
/// fixed back-off) after a connection loss. Outbound frames go through
/// a send queue flushed as the socket allows, so a full kernel buffer
/// defers a frame instead of tearing it. Subscriptions are made at
/// QoS 0 only.
pub struct MqttClient {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
    stream: Option<TcpStream>,
    reader: PacketReader,
    send_queue: VecDeque<Vec<u8>>,
    /// Partially written frame and the offset already on the wire.
    pending_send: Option<(Vec<u8>, usize)>,
    packet_id: u16,
    last_read: Instant,
    last_write: Instant,
    ping_outstanding: bool,
    reconnect_at: Option<Instant>,
    pending_connect_event: bool,
}

impl MqttClient {
    /// Build a client from broker configuration.
    ///
    /// A missing `client_id` gets a random `keenmqtt-xxxxxxxx`
    /// identifier so that parallel relay instances do not evict each
    /// other's sessions.
    pub fn new(config: &MqttConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("keenmqtt-{:08x}", fastrand::u32(..)));

        Self {
            host: config.host.clone(),
            port: config.port,
            client_id,
            username: config.user.clone(),
            password: config.pass.clone(),
            keep_alive: Duration::from_secs(u64::from(config.keepalive_secs)),
            stream: None,
            reader: PacketReader::default(),
            send_queue: VecDeque::new(),
            pending_send: None,
            packet_id: 0,
            last_read: Instant::now(),
            last_write: Instant::now(),
            ping_outstanding: false,
            reconnect_at: None,
            pending_connect_event: false,
        }
    }

    /// Client identifier presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn next_packet_id(&mut self) -> u16 {
        // Packet id 0 is reserved by the protocol.
        self.packet_id = if self.packet_id == u16::MAX {
            1
        } else {
            self.packet_id + 1
        };
        self.packet_id
    }

    /// Establish the TCP session and complete the CONNECT handshake.
    fn do_connect(&mut self) -> Result<(), BusError> {
        self.reader.reset();
        self.send_queue.clear();
        self.pending_send = None;

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                BusError::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no addresses for {}", self.host),
                ))
            })?;

        let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;

        let connect = packet::encode_connect(&ConnectOptions {
            client_id: &self.client_id,
            username: self.username.as_deref(),
            password: self.password.as_deref(),
            keep_alive_secs: self.keep_alive.as_secs().min(u64::from(u16::MAX)) as u16,
            clean_session: true,
        })
        .map_err(|e| BusError::Protocol(e.to_string()))?;
        // The socket is still blocking here; the handshake is written
        // in full before nonblocking mode is enabled.
        stream.write_all(&connect)?;

        // The handshake is the only blocking read this client performs.
        stream.set_read_timeout(Some(CONNACK_TIMEOUT))?;
        let (header, body) = loop {
            match self.reader.read(&mut stream)? {
                Some(frame) => break frame,
                None => {
                    return Err(BusError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for CONNACK",
                    )));
                }
            }
        };

        match packet::decode_packet(header, &body) {
            Ok(Packet::Connack { return_code, .. }) => {
                if let Some(reason) = packet::connack_refusal(return_code) {
                    return Err(BusError::Refused(reason));
                }
            }
            Ok(other) => {
                return Err(BusError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other
                )));
            }
            Err(e) => return Err(BusError::Protocol(e.to_string())),
        }

        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);

        let now = Instant::now();
        self.last_read = now;
        self.last_write = now;
        self.ping_outstanding = false;
        self.pending_connect_event = true;

        info!(
            host = %self.host,
            port = self.port,
            client_id = %self.client_id,
            "MQTT session established"
        );
        Ok(())
    }

    /// Tear the connection down and schedule a reconnect attempt.
    ///
    /// Queued frames belong to the dead session and are discarded,
    /// matching QoS 0 delivery semantics.
    fn drop_connection(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reader.reset();
        self.send_queue.clear();
        self.pending_send = None;
        self.ping_outstanding = false;
        self.pending_connect_event = false;
        self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
    }

    /// Queue one encoded frame and flush as much as the socket accepts.
    ///
    /// A frame the socket cannot take right now stays queued and is
    /// flushed by subsequent polls.
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), BusError> {
        if self.stream.is_none() {
            return Err(BusError::NotConnected);
        }
        self.send_queue.push_back(frame);
        self.flush_sends()
    }

    /// Flush queued frames; a hard write failure drops the connection
    /// and surfaces the error.
    fn flush_sends(&mut self) -> Result<(), BusError> {
        match self.try_flush() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Write failed; dropping connection");
                self.drop_connection();
                Err(BusError::Io(e))
            }
        }
    }

    /// Write queued frames until everything is out or the socket would
    /// block.
    fn try_flush(&mut self) -> io::Result<()> {
        // Finish the partially written frame first: its leading bytes
        // are already on the wire and nothing may interleave with it.
        while let Some((frame, offset)) = self.pending_send.as_mut() {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            match stream.write(&frame[*offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed",
                    ));
                }
                Ok(n) => {
                    self.last_write = Instant::now();
                    *offset += n;
                    if *offset < frame.len() {
                        // Short write: the buffer is full again.
                        return Ok(());
                    }
                    self.pending_send = None;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        while let Some(frame) = self.send_queue.pop_front() {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(());
            };
            match stream.write(&frame) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed",
                    ));
                }
                Ok(n) if n == frame.len() => {
                    self.last_write = Instant::now();
                }
                Ok(n) => {
                    self.last_write = Instant::now();
                    self.pending_send = Some((frame, n));
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.send_queue.push_front(frame);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.send_queue.push_front(frame);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Number of outbound frames waiting on the socket, counting a
    /// partially written one.
    pub fn pending_sends(&self) -> usize {
        self.send_queue.len() + usize::from(self.pending_send.is_some())
    }

    /// React to one decoded packet. Returns `false` if the connection
    /// must be dropped.
    fn handle_packet(&mut self, header: u8, body: &[u8], events: &mut Vec<BusEvent>) -> bool {
        match packet::decode_packet(header, body) {
            Ok(Packet::Publish { topic, payload }) => {
                trace!(topic = %topic, len = payload.len(), "Inbound publish");
                events.push(BusEvent::Message { topic, payload });
                true
            }
            Ok(Packet::Pingresp) => {
                self.ping_outstanding = false;
                true
            }
            Ok(Packet::Suback {
                packet_id,
                return_codes,
            }) => {
                for code in return_codes {
                    if code == 0x80 {
                        warn!(packet_id, "Broker rejected a subscription");
                    } else {
                        debug!(packet_id, qos = code, "Subscription granted");
                    }
                }
                true
            }
            Ok(Packet::Connack { .. }) => {
                warn!("Unexpected CONNACK after handshake");
                false
            }
            Err(e) => {
                warn!(error = %e, "Dropping connection after protocol error");
                false
            }
        }
    }

    /// Send PINGREQ when idle; drop connections the broker stopped
    /// answering.
    fn maintain_keepalive(&mut self) {
        if self.stream.is_none() || self.keep_alive.is_zero() {
            return;
        }
        let now = Instant::now();

        if self.ping_outstanding && now.duration_since(self.last_read) > self.keep_alive * 3 / 2 {
            warn!("Broker stopped answering pings; dropping connection");
            self.drop_connection();
            return;
        }

        if !self.ping_outstanding && now.duration_since(self.last_write) >= self.keep_alive / 2 {
            if self.send_frame(packet::encode_pingreq()).is_err() {
                // The flush path already dropped the connection.
                return;
            }
            self.last_write = now;
            self.ping_outstanding = true;
            trace!("Sent PINGREQ");
        }
    }
}

impl BusClient for MqttClient {
    fn connect(&mut self) -> Result<(), BusError> {
        self.do_connect()?;
        self.reconnect_at = None;
        Ok(())
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), BusError> {
        if self.stream.is_none() {
            return Err(BusError::NotConnected);
        }
        let packet_id = self.next_packet_id();
        let frame = packet::encode_subscribe(packet_id, filter)
            .map_err(|e| BusError::Protocol(e.to_string()))?;
        self.send_frame(frame)?;
        debug!(filter = %filter, packet_id, "Queued SUBSCRIBE");
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.stream.is_none() {
            return Err(BusError::NotConnected);
        }
        let frame = packet::encode_publish(topic, payload)
            .map_err(|e| BusError::Protocol(e.to_string()))?;
        self.send_frame(frame)?;
        trace!(topic = %topic, len = payload.len(), "Queued PUBLISH");
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<BusEvent>, BusError> {
        if self.stream.is_none() {
            let due = matches!(self.reconnect_at, Some(at) if Instant::now() >= at);
            if !due {
                return Ok(Vec::new());
            }
            info!(host = %self.host, port = self.port, "Reconnecting");
            if let Err(e) = self.do_connect() {
                warn!(error = %e, "Reconnect failed");
                self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
                return Ok(Vec::new());
            }
            self.reconnect_at = None;
        }

        let mut events = Vec::new();
        if self.pending_connect_event {
            self.pending_connect_event = false;
            events.push(BusEvent::Connected);
        }

        loop {
            let frame = match self.stream.as_mut() {
                Some(stream) => self.reader.read(stream),
                None => break,
            };
            match frame {
                Ok(Some((header, body))) => {
                    self.last_read = Instant::now();
                    if !self.handle_packet(header, &body, &mut events) {
                        self.drop_connection();
                        return Ok(events);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Connection lost");
                    self.drop_connection();
                    return Ok(events);
                }
            }
        }

        if self.flush_sends().is_err() {
            // The connection was dropped; a reconnect is scheduled.
            return Ok(events);
        }
        self.maintain_keepalive();
        Ok(events)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.write_all(&packet::encode_disconnect());
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
