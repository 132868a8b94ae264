// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 packet codec.
//!
//! Wire format (fixed header):
//!
//! ```text
//! +--------------------+----------------------+------------------+
//! | Type/Flags (1B)    | Remaining Length     | Variable header  |
//! |                    | (1-4B varint)        | + payload        |
//! +--------------------+----------------------+------------------+
//! ```
//!
//! The remaining length is a little-endian base-128 varint: 7 value
//! bits per byte, bit 7 set on all but the last byte, at most 4 bytes.
//!
//! Encoding is builder-function based (one function per outbound packet
//! type); decoding is split into [`PacketReader`] (incremental framing
//! over a nonblocking reader) and [`decode_packet`] (body parsing).

use std::io::{self, Read};
use thiserror::Error;

/// MQTT protocol level for version 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Default maximum accepted packet body (1 MB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Largest body length a 4-byte remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Packet encoding and body parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),

    #[error("Unexpected packet type {0} for a QoS 0 client")]
    Unexpected(u8),

    #[error("Unknown packet type {0}")]
    UnknownType(u8),

    #[error("String field of {0} bytes exceeds the u16 length prefix")]
    StringTooLong(usize),

    #[error("Packet body of {0} bytes exceeds the remaining-length maximum")]
    BodyTooLarge(usize),
}

/// An inbound packet the client acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connection acknowledgement.
    Connack {
        session_present: bool,
        return_code: u8,
    },

    /// Inbound publication.
    Publish { topic: String, payload: Vec<u8> },

    /// Subscription acknowledgement. A return code of `0x80` marks a
    /// rejected filter.
    Suback {
        packet_id: u16,
        return_codes: Vec<u8>,
    },

    /// Keepalive response.
    Pingresp,
}

/// Map a CONNACK return code to a human-readable refusal reason.
///
/// Returns `None` for code 0 (accepted).
pub fn connack_refusal(return_code: u8) -> Option<&'static str> {
    match return_code {
        0 => None,
        1 => Some("unacceptable protocol version"),
        2 => Some("client identifier rejected"),
        3 => Some("server unavailable"),
        4 => Some("bad user name or password"),
        5 => Some("not authorized"),
        _ => Some("unknown refusal code"),
    }
}

/// Build a CONNECT packet.
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

/// Encode a CONNECT packet.
pub fn encode_connect(opts: &ConnectOptions<'_>) -> Result<Vec<u8>, PacketError> {
    let mut body = Vec::with_capacity(16 + opts.client_id.len());
    write_string(&mut body, "MQTT")?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if opts.clean_session {
        flags |= 0x02;
    }
    if opts.username.is_some() {
        flags |= 0x80;
    }
    if opts.password.is_some() {
        flags |= 0x40;
    }
    body.push(flags);

    body.extend_from_slice(&opts.keep_alive_secs.to_be_bytes());
    write_string(&mut body, opts.client_id)?;
    if let Some(username) = opts.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = opts.password {
        write_string(&mut body, password)?;
    }

    finish(0x10, body)
}

/// Encode a SUBSCRIBE packet for a single filter at QoS 0.
pub fn encode_subscribe(packet_id: u16, filter: &str) -> Result<Vec<u8>, PacketError> {
    let mut body = Vec::with_capacity(5 + filter.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    write_string(&mut body, filter)?;
    body.push(0); // requested QoS
    finish(0x82, body)
}

/// Encode a QoS 0 PUBLISH packet.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    write_string(&mut body, topic)?;
    body.extend_from_slice(payload);
    finish(0x30, body)
}

/// Encode a PINGREQ packet.
pub fn encode_pingreq() -> Vec<u8> {
    vec![0xC0, 0x00]
}

/// Encode a DISCONNECT packet.
pub fn encode_disconnect() -> Vec<u8> {
    vec![0xE0, 0x00]
}

/// Prefix `body` with the fixed header byte and remaining length.
///
/// Bodies beyond [`MAX_REMAINING_LENGTH`] have no valid varint form
/// and are refused instead of encoded as garbage.
fn finish(header: u8, body: Vec<u8>) -> Result<Vec<u8>, PacketError> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(PacketError::BodyTooLarge(body.len()));
    }
    let mut packet = Vec::with_capacity(body.len() + 5);
    packet.push(header);
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Append the remaining-length varint for `len`.
fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Write a length-prefixed UTF-8 string (u16 BE length).
///
/// Strings longer than the prefix can express are refused; truncating
/// the length would corrupt the frame.
fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), PacketError> {
    let len = u16::try_from(s.len()).map_err(|_| PacketError::StringTooLong(s.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Read a length-prefixed UTF-8 string starting at `at`.
///
/// Returns the string and the offset just past it.
fn read_string(body: &[u8], at: usize) -> Result<(String, usize), PacketError> {
    if body.len() < at + 2 {
        return Err(PacketError::Malformed("truncated string length"));
    }
    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
    let start = at + 2;
    let end = start + len;
    if body.len() < end {
        return Err(PacketError::Malformed("truncated string"));
    }
    let s = std::str::from_utf8(&body[start..end])
        .map_err(|_| PacketError::Malformed("string is not valid UTF-8"))?;
    Ok((s.to_string(), end))
}

/// Parse a complete packet body produced by [`PacketReader`].
pub fn decode_packet(header: u8, body: &[u8]) -> Result<Packet, PacketError> {
    let packet_type = header >> 4;
    match packet_type {
        // CONNACK
        2 => {
            if body.len() != 2 {
                return Err(PacketError::Malformed("CONNACK body must be 2 bytes"));
            }
            Ok(Packet::Connack {
                session_present: body[0] & 0x01 != 0,
                return_code: body[1],
            })
        }

        // PUBLISH
        3 => {
            let qos = (header >> 1) & 0x03;
            if qos == 3 {
                return Err(PacketError::Malformed("PUBLISH with invalid QoS 3"));
            }
            let (topic, mut at) = read_string(body, 0)?;
            if qos > 0 {
                // Packet id present for QoS 1/2 deliveries; skipped,
                // this client only subscribes at QoS 0.
                if body.len() < at + 2 {
                    return Err(PacketError::Malformed("truncated PUBLISH packet id"));
                }
                at += 2;
            }
            Ok(Packet::Publish {
                topic,
                payload: body[at..].to_vec(),
            })
        }

        // SUBACK
        9 => {
            if body.len() < 3 {
                return Err(PacketError::Malformed("SUBACK body too short"));
            }
            Ok(Packet::Suback {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
                return_codes: body[2..].to_vec(),
            })
        }

        // PINGRESP
        13 => {
            if !body.is_empty() {
                return Err(PacketError::Malformed("PINGRESP body must be empty"));
            }
            Ok(Packet::Pingresp)
        }

        // Valid 3.1.1 types this QoS 0 subscriber never expects
        // (CONNECT, PUBACK..PUBCOMP, SUBSCRIBE, UNSUBSCRIBE, UNSUBACK,
        // PINGREQ, DISCONNECT).
        1 | 4..=8 | 10 | 11 | 12 | 14 => Err(PacketError::Unexpected(packet_type)),

        other => Err(PacketError::UnknownType(other)),
    }
}

/// Incremental packet framer for nonblocking readers.
///
/// Call [`read`](Self::read) whenever the socket is readable; it
/// returns `Ok(Some((header, body)))` per complete packet, `Ok(None)`
/// when the reader would block mid-packet, and an error on EOF,
/// protocol violations, or I/O failure. State carries over between
/// calls, so partial packets are handled transparently.
#[derive(Debug)]
pub struct PacketReader {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
    packets_decoded: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Waiting for the fixed header byte.
    ReadingHeader,

    /// Collecting the remaining-length varint.
    ReadingLength {
        header: u8,
        value: usize,
        multiplier: usize,
        length_bytes: u8,
    },

    /// Collecting the packet body.
    ReadingBody {
        header: u8,
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketReader {
    /// Create a reader with the given maximum body size.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::ReadingHeader,
            buffer: Vec::new(),
            max_size,
            packets_decoded: 0,
        }
    }

    /// Number of complete packets decoded so far.
    pub fn packets_decoded(&self) -> u64 {
        self.packets_decoded
    }

    /// Reset framing state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.state = ReadState::ReadingHeader;
        self.buffer.clear();
    }

    /// Try to read one complete packet.
    pub fn read<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<(u8, Vec<u8>)>> {
        loop {
            match self.state {
                ReadState::ReadingHeader => {
                    let mut byte = [0u8; 1];
                    match reader.read(&mut byte) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed",
                            ));
                        }
                        Ok(_) => {
                            self.state = ReadState::ReadingLength {
                                header: byte[0],
                                value: 0,
                                multiplier: 1,
                                length_bytes: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingLength {
                    header,
                    value,
                    multiplier,
                    length_bytes,
                } => {
                    let mut byte = [0u8; 1];
                    match reader.read(&mut byte) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid-packet",
                            ));
                        }
                        Ok(_) => {
                            if length_bytes == 4 {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "remaining length exceeds 4 bytes",
                                ));
                            }
                            let value = value + (byte[0] & 0x7F) as usize * multiplier;
                            if byte[0] & 0x80 != 0 {
                                self.state = ReadState::ReadingLength {
                                    header,
                                    value,
                                    multiplier: multiplier * 128,
                                    length_bytes: length_bytes + 1,
                                };
                                continue;
                            }

                            if value > self.max_size {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!(
                                        "packet too large: {} bytes (max {})",
                                        value, self.max_size
                                    ),
                                ));
                            }

                            if value == 0 {
                                self.packets_decoded += 1;
                                self.state = ReadState::ReadingHeader;
                                return Ok(Some((header, Vec::new())));
                            }

                            self.buffer.resize(value, 0);
                            self.state = ReadState::ReadingBody {
                                header,
                                expected_len: value,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    header,
                    expected_len,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid-packet",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    header,
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let body = self.buffer[..expected_len].to_vec();
                            self.packets_decoded += 1;
                            self.state = ReadState::ReadingHeader;
                            return Ok(Some((header, body)));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Serves data in pre-split chunks, yielding `WouldBlock` once at
    /// every chunk boundary and after exhaustion, like a nonblocking
    /// socket.
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
        block_next: bool,
    }

    impl ChunkReader {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                block_next: false,
            }
        }
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            let Some(chunk) = self.chunks.front_mut() else {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
                self.block_next = true;
            }
            Ok(n)
        }
    }

    fn read_all(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut reader = PacketReader::default();
        let mut cursor = Cursor::new(data.to_vec());
        let mut packets = Vec::new();
        while let Ok(Some(packet)) = reader.read(&mut cursor) {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_encode_pingreq_and_disconnect() {
        assert_eq!(encode_pingreq(), vec![0xC0, 0x00]);
        assert_eq!(encode_disconnect(), vec![0xE0, 0x00]);
    }

    #[test]
    fn test_encode_publish_layout() {
        let packet = encode_publish("a/b", b"hi").expect("encode");
        // header, remaining length 7, topic len 3, "a/b", "hi"
        assert_eq!(
            packet,
            vec![0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
        );
    }

    #[test]
    fn test_encode_subscribe_layout() {
        let packet = encode_subscribe(1, "home/#").expect("encode");
        assert_eq!(packet[0], 0x82);
        assert_eq!(packet[1], 11); // pid(2) + len(2) + filter(6) + qos(1)
        assert_eq!(&packet[2..4], &[0x00, 0x01]);
        assert_eq!(&packet[4..6], &[0x00, 0x06]);
        assert_eq!(&packet[6..12], b"home/#");
        assert_eq!(packet[12], 0x00);
    }

    #[test]
    fn test_encode_connect_flags() {
        let plain = encode_connect(&ConnectOptions {
            client_id: "c1",
            username: None,
            password: None,
            keep_alive_secs: 60,
            clean_session: true,
        })
        .expect("encode");
        assert_eq!(plain[0], 0x10);
        // body: "MQTT"(6) + level(1) + flags(1) + keepalive(2) + id(4)
        assert_eq!(plain[1], 14);
        assert_eq!(&plain[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(plain[8], PROTOCOL_LEVEL);
        assert_eq!(plain[9], 0x02); // clean session only
        assert_eq!(&plain[10..12], &[0x00, 0x3C]);

        let authed = encode_connect(&ConnectOptions {
            client_id: "c1",
            username: Some("alice"),
            password: Some("secret"),
            keep_alive_secs: 60,
            clean_session: true,
        })
        .expect("encode");
        assert_eq!(authed[9], 0x80 | 0x40 | 0x02);
    }

    #[test]
    fn test_encode_rejects_oversized_strings() {
        let over = "x".repeat(usize::from(u16::MAX) + 1);
        assert_eq!(
            encode_publish(&over, b"").expect_err("oversized topic"),
            PacketError::StringTooLong(65_536)
        );
        assert_eq!(
            encode_subscribe(1, &over).expect_err("oversized filter"),
            PacketError::StringTooLong(65_536)
        );

        // The largest expressible string still encodes.
        let max = "x".repeat(usize::from(u16::MAX));
        assert!(encode_publish(&max, b"").is_ok());
    }

    #[test]
    fn test_finish_rejects_oversized_body() {
        let body = vec![0u8; MAX_REMAINING_LENGTH + 1];
        assert_eq!(
            finish(0x30, body).expect_err("oversized body"),
            PacketError::BodyTooLarge(MAX_REMAINING_LENGTH + 1)
        );
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for (len, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = Vec::new();
            encode_remaining_length(len, &mut buf);
            assert_eq!(buf, expected, "length {}", len);
        }
    }

    #[test]
    fn test_reader_round_trips_multibyte_length() {
        let payload = vec![0xAB; 300]; // forces a 2-byte remaining length
        let data = encode_publish("t", &payload).expect("encode");

        let packets = read_all(&data);
        assert_eq!(packets.len(), 1);
        let decoded = decode_packet(packets[0].0, &packets[0].1).expect("decode");
        assert_eq!(
            decoded,
            Packet::Publish {
                topic: "t".to_string(),
                payload,
            }
        );
    }

    #[test]
    fn test_reader_handles_back_to_back_packets() {
        let mut data = encode_publish("a", b"1").expect("encode");
        data.extend_from_slice(&encode_pingreq());
        data.extend_from_slice(&encode_publish("b", b"2").expect("encode"));

        let packets = read_all(&data);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[1].0, 0xC0);
    }

    #[test]
    fn test_reader_resumes_across_would_block() {
        let data = encode_publish("home/kitchen", b"{\"v\":1}").expect("encode");
        let (first, second) = data.split_at(5);
        let mut reader = PacketReader::default();
        let mut chunked = ChunkReader::new(vec![first.to_vec(), second.to_vec()]);

        // First chunk is mid-packet: WouldBlock surfaces as Ok(None).
        assert!(reader.read(&mut chunked).expect("read").is_none());

        let (header, body) = reader
            .read(&mut chunked)
            .expect("read")
            .expect("complete packet");
        let packet = decode_packet(header, &body).expect("decode");
        assert!(matches!(packet, Packet::Publish { ref topic, .. } if topic == "home/kitchen"));
        assert_eq!(reader.packets_decoded(), 1);
    }

    #[test]
    fn test_reader_rejects_oversized_packet() {
        let mut reader = PacketReader::new(16);
        let data = encode_publish("topic", &[0u8; 64]).expect("encode");
        let mut cursor = Cursor::new(data);

        let err = reader.read(&mut cursor).expect_err("should reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_reader_eof_is_an_error() {
        let mut reader = PacketReader::default();
        let mut cursor = Cursor::new(vec![0x30]); // header only, then EOF

        let err = reader.read(&mut cursor).expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_connack() {
        assert_eq!(
            decode_packet(0x20, &[0x00, 0x00]).expect("decode"),
            Packet::Connack {
                session_present: false,
                return_code: 0,
            }
        );
        assert_eq!(
            decode_packet(0x20, &[0x01, 0x05]).expect("decode"),
            Packet::Connack {
                session_present: true,
                return_code: 5,
            }
        );
        assert!(decode_packet(0x20, &[0x00]).is_err());
    }

    #[test]
    fn test_decode_suback_reports_rejection_codes() {
        let packet = decode_packet(0x90, &[0x00, 0x07, 0x00, 0x80]).expect("decode");
        assert_eq!(
            packet,
            Packet::Suback {
                packet_id: 7,
                return_codes: vec![0x00, 0x80],
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_publish() {
        // Topic length claims more bytes than the body has.
        assert_eq!(
            decode_packet(0x30, &[0x00, 0x10, b'a']),
            Err(PacketError::Malformed("truncated string"))
        );
        // QoS 3 is invalid.
        assert!(decode_packet(0x36, &[0x00, 0x01, b'a']).is_err());
        // Topic must be UTF-8.
        assert_eq!(
            decode_packet(0x30, &[0x00, 0x02, 0xFF, 0xFE]),
            Err(PacketError::Malformed("string is not valid UTF-8"))
        );
    }

    #[test]
    fn test_decode_skips_publish_packet_id_for_qos1() {
        // header 0x32 = PUBLISH, QoS 1; body: topic "t", pid 9, payload "x"
        let packet =
            decode_packet(0x32, &[0x00, 0x01, b't', 0x00, 0x09, b'x']).expect("decode");
        assert_eq!(
            packet,
            Packet::Publish {
                topic: "t".to_string(),
                payload: b"x".to_vec(),
            }
        );
    }

    #[test]
    fn test_decode_flags_unexpected_and_unknown_types() {
        assert_eq!(decode_packet(0x40, &[0, 0]), Err(PacketError::Unexpected(4)));
        assert_eq!(decode_packet(0xF0, &[]), Err(PacketError::UnknownType(15)));
    }

    #[test]
    fn test_connack_refusal_reasons() {
        assert!(connack_refusal(0).is_none());
        assert_eq!(connack_refusal(4), Some("bad user name or password"));
        assert_eq!(connack_refusal(99), Some("unknown refusal code"));
    }
}
