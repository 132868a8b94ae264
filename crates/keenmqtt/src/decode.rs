// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload decoding.
//!
//! A [`PayloadDecoder`] turns a raw message body into an ordered
//! sequence of zero or more [`Record`]s; each record then travels the
//! full pipeline independently, so one message may emit many events or
//! none. The default [`JsonDecoder`] handles the common case of one
//! JSON object per message. Implement the trait to support batched
//! payloads or binary encodings.

use crate::event::Record;
use serde_json::Value;
use thiserror::Error;

/// Payload decoding errors.
///
/// These propagate uncaught out of single-step servicing; the
/// background loop logs them and moves on to the next message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload on '{topic}': {source}")]
    Json {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload on '{topic}' is not a JSON object (got {kind})")]
    NotAnObject { topic: String, kind: &'static str },
}

/// Turns a raw payload into an ordered sequence of records.
pub trait PayloadDecoder: Send {
    /// Decode `payload` received on `topic`.
    ///
    /// An empty sequence is a valid result and simply produces no
    /// events.
    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Vec<Record>, DecodeError>;
}

/// Default decoder: one JSON object per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl PayloadDecoder for JsonDecoder {
    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Vec<Record>, DecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(|source| DecodeError::Json {
            topic: topic.to_string(),
            source,
        })?;

        match value {
            Value::Object(record) => Ok(vec![record]),
            other => Err(DecodeError::NotAnObject {
                topic: topic.to_string(),
                kind: value_kind(&other),
            }),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_single_object() {
        let records = JsonDecoder
            .decode("home/exact", br#"{"a": 1}"#)
            .expect("decode");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_decode_preserves_value_types() {
        let payload = br#"{"test1": 120, "test2": "Hello World!", "test3": true, "test4": null}"#;
        let records = JsonDecoder.decode("home/exact", payload).expect("decode");

        let record = &records[0];
        assert_eq!(record.get("test1"), Some(&json!(120)));
        assert_eq!(record.get("test2"), Some(&json!("Hello World!")));
        assert_eq!(record.get("test3"), Some(&json!(true)));
        assert_eq!(record.get("test4"), Some(&json!(null)));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = JsonDecoder
            .decode("home/exact", b"not json at all")
            .expect_err("should fail");
        assert!(matches!(err, DecodeError::Json { .. }));
        assert!(err.to_string().contains("home/exact"));
    }

    #[test]
    fn test_decode_rejects_non_object_documents() {
        for payload in [&b"5"[..], b"\"text\"", b"[1, 2]", b"null"] {
            let err = JsonDecoder
                .decode("home/exact", payload)
                .expect_err("should fail");
            assert!(matches!(err, DecodeError::NotAnObject { .. }));
        }
    }

    #[test]
    fn test_custom_decoder_may_return_many_records() {
        struct ArrayDecoder;

        impl PayloadDecoder for ArrayDecoder {
            fn decode(&self, topic: &str, payload: &[u8]) -> Result<Vec<Record>, DecodeError> {
                let value: Value =
                    serde_json::from_slice(payload).map_err(|source| DecodeError::Json {
                        topic: topic.to_string(),
                        source,
                    })?;
                match value {
                    Value::Array(items) => Ok(items
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Object(record) => Some(record),
                            _ => None,
                        })
                        .collect()),
                    _ => Ok(Vec::new()),
                }
            }
        }

        let records = ArrayDecoder
            .decode("batch", br#"[{"a": 1}, {"a": 2}, 3]"#)
            .expect("decode");
        assert_eq!(records.len(), 2);
    }
}
