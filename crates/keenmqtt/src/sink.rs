// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event sinks.
//!
//! [`KeenSink`] posts events to the Keen IO HTTP API; [`RecordingSink`]
//! captures them in memory for tests and dry runs. Both are
//! fire-and-forget from the relay's point of view: a failed push is
//! reported once and never retried here.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::config::KeenConfig;
use crate::event::Event;

/// Request timeout for sink pushes.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Event push errors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sink rejected event for collection '{collection}': HTTP {status}")]
    Rejected { collection: String, status: u16 },
}

/// Destination for finished events.
pub trait EventSink: Send {
    /// Push one event into the named collection.
    fn add_event(&mut self, collection: &str, event: &Event) -> Result<(), SinkError>;
}

/// Sink for the Keen IO event API.
///
/// Pushes land on `POST /3.0/projects/{project}/events/{collection}`
/// with the write key in the `Authorization` header.
pub struct KeenSink {
    client: reqwest::blocking::Client,
    base_url: String,
    project_id: String,
    write_key: String,
}

impl KeenSink {
    pub fn new(config: &KeenConfig) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            write_key: config.write_key.clone(),
        })
    }

    fn event_url(&self, collection: &str) -> String {
        format!(
            "{}/3.0/projects/{}/events/{}",
            self.base_url, self.project_id, collection
        )
    }
}

impl EventSink for KeenSink {
    fn add_event(&mut self, collection: &str, event: &Event) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.event_url(collection))
            .header("Authorization", &self.write_key)
            .json(event)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected {
                collection: collection.to_string(),
                status: status.as_u16(),
            });
        }
        trace!(collection = %collection, status = status.as_u16(), "Event accepted");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    events: Vec<(String, Event)>,
    rejecting: bool,
}

/// In-memory sink that records every push.
#[derive(Debug)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingState>>,
}

/// Observer half of a [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct RecordingSinkHandle {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingSink {
    pub fn new() -> (Self, RecordingSinkHandle) {
        let state = Arc::new(Mutex::new(RecordingState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            RecordingSinkHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for RecordingSink {
    fn add_event(&mut self, collection: &str, event: &Event) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.rejecting {
            return Err(SinkError::Rejected {
                collection: collection.to_string(),
                status: 503,
            });
        }
        state.events.push((collection.to_string(), event.clone()));
        Ok(())
    }
}

impl RecordingSinkHandle {
    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every pushed `(collection, event)` pair, in push order.
    pub fn events(&self) -> Vec<(String, Event)> {
        self.lock().events.clone()
    }

    /// Number of recorded pushes.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// While `true`, every push fails with a synthetic HTTP 503.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.lock().rejecting = rejecting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Accept one HTTP request, return it as text, answer `status`.
    fn one_shot_server(status_line: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().expect("accept");
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            loop {
                let n = sock.read(&mut tmp).expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);

                let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let mut content_length = 0usize;
                for line in headers.lines() {
                    if let Some(value) = line.strip_prefix("content-length:") {
                        content_length = value.trim().parse().expect("content length");
                    }
                }
                if buf.len() >= pos + 4 + content_length {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status_line
            );
            sock.write_all(response.as_bytes()).expect("respond");
            String::from_utf8_lossy(&buf).to_string()
        });

        (port, handle)
    }

    fn sample_event() -> Event {
        let mut event = Event::new();
        event.insert("sensor_value", json!(21));
        event
    }

    #[test]
    fn test_add_event_posts_json_with_write_key() {
        let (port, server) = one_shot_server("201 Created");
        let config = KeenConfig {
            project_id: "proj123".to_string(),
            write_key: "WRITEKEY".to_string(),
            api_url: format!("http://127.0.0.1:{}/", port),
        };

        let mut sink = KeenSink::new(&config).expect("sink");
        sink.add_event("signals", &sample_event()).expect("push");

        let request = server.join().expect("server thread");
        assert!(
            request.starts_with("POST /3.0/projects/proj123/events/signals HTTP/1.1"),
            "unexpected request line: {}",
            request.lines().next().unwrap_or_default()
        );
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: writekey"));
        assert!(request.ends_with("{\"sensor_value\":21}"));
    }

    #[test]
    fn test_add_event_maps_http_failure_to_rejected() {
        let (port, server) = one_shot_server("401 Unauthorized");
        let config = KeenConfig {
            project_id: "proj123".to_string(),
            write_key: "badkey".to_string(),
            api_url: format!("http://127.0.0.1:{}", port),
        };

        let mut sink = KeenSink::new(&config).expect("sink");
        let err = sink
            .add_event("signals", &sample_event())
            .expect_err("rejected");
        server.join().expect("server thread");

        assert!(matches!(
            err,
            SinkError::Rejected {
                status: 401,
                ref collection,
            } if collection == "signals"
        ));
    }

    #[test]
    fn test_event_url_hides_trailing_slash() {
        let config = KeenConfig {
            project_id: "p".to_string(),
            write_key: "k".to_string(),
            api_url: "https://api.keen.io/".to_string(),
        };
        let sink = KeenSink::new(&config).expect("sink");
        assert_eq!(sink.event_url("c"), "https://api.keen.io/3.0/projects/p/events/c");
    }

    #[test]
    fn test_recording_sink_captures_events_in_order() {
        let (mut sink, handle) = RecordingSink::new();
        assert!(handle.is_empty());

        sink.add_event("first", &sample_event()).expect("push");
        sink.add_event("second", &sample_event()).expect("push");

        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "first");
        assert_eq!(events[1].0, "second");
        assert_eq!(handle.len(), 2);
    }

    #[test]
    fn test_recording_sink_can_simulate_rejection() {
        let (mut sink, handle) = RecordingSink::new();
        handle.set_rejecting(true);

        let err = sink
            .add_event("signals", &sample_event())
            .expect_err("rejected");
        assert!(matches!(err, SinkError::Rejected { status: 503, .. }));
        assert!(handle.is_empty());

        handle.set_rejecting(false);
        sink.add_event("signals", &sample_event()).expect("push");
        assert_eq!(handle.len(), 1);
    }
}
