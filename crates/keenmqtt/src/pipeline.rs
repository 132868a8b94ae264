// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-record event pipeline.
//!
//! Each decoded record runs through an ordered list of stages. A stage
//! mutates the event under construction and returns `true` to continue
//! or `false` to cancel; the pipeline short-circuits on the first
//! `false`. Cancellation is not an error, it is the supported way to
//! filter unwanted records.
//!
//! The default pipeline is [`TopicStage`], [`PayloadStage`], then
//! [`TimeStage`]. Replace or extend it via [`EventPipeline::new`], or
//! wrap a closure in [`FnStage`] for one-off stages.

use crate::event::{Event, Record, KEEN_FIELD, TIMESTAMP_FIELD, TOPIC_FIELD};
use serde_json::{Map, Value};
use tracing::trace;

/// One transformation step applied to every record.
pub trait PipelineStage: Send {
    /// Apply this stage to the event under construction.
    ///
    /// Returns `false` to cancel processing of this record; no event is
    /// pushed and later stages do not run.
    fn apply(&self, event: &mut Event, topic: &str, record: &Record) -> bool;

    /// Short stage name used in trace logging.
    fn name(&self) -> &'static str {
        "stage"
    }
}

/// Ordered stage list with short-circuit execution.
pub struct EventPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl EventPipeline {
    /// Create a pipeline from an explicit stage list.
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    /// The default topic, payload, time pipeline with wall-clock
    /// timestamps.
    pub fn standard() -> Self {
        Self::with_time_source(Box::new(SystemClock))
    }

    /// The default pipeline with a custom [`TimeSource`].
    pub fn with_time_source(source: Box<dyn TimeSource>) -> Self {
        Self::new(vec![
            Box::new(TopicStage),
            Box::new(PayloadStage),
            Box::new(TimeStage::new(source)),
        ])
    }

    /// Append a stage to the end of the pipeline.
    pub fn push(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    /// Run every stage in order.
    ///
    /// Returns `false` as soon as any stage cancels, leaving the event
    /// in its partially-built state (the caller discards it).
    pub fn run(&self, event: &mut Event, topic: &str, record: &Record) -> bool {
        for stage in &self.stages {
            if !stage.apply(event, topic, record) {
                trace!("Record on '{}' cancelled by {} stage", topic, stage.name());
                return false;
            }
        }
        true
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

/// Records the originating topic under [`TOPIC_FIELD`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStage;

impl PipelineStage for TopicStage {
    fn apply(&self, event: &mut Event, topic: &str, _record: &Record) -> bool {
        event.insert(TOPIC_FIELD, Value::String(topic.to_string()));
        true
    }

    fn name(&self) -> &'static str {
        "topic"
    }
}

/// Shallow-merges the decoded record into the event.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadStage;

impl PipelineStage for PayloadStage {
    fn apply(&self, event: &mut Event, _topic: &str, record: &Record) -> bool {
        event.merge_record(record);
        true
    }

    fn name(&self) -> &'static str {
        "payload"
    }
}

/// Resolves the event timestamp for a record.
pub trait TimeSource: Send {
    /// Return the timestamp as an ISO-8601 string without a timezone
    /// designator, or `None` to omit the timing object entirely and let
    /// the sink assign its own ingestion time.
    fn event_time(&self, topic: &str, record: &Record) -> Option<String>;
}

/// Default time source: current local wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn event_time(&self, _topic: &str, _record: &Record) -> Option<String> {
        Some(
            chrono::Local::now()
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        )
    }
}

/// Stamps the event with `{ "keen": { "timestamp": <ISO-8601> } }`.
pub struct TimeStage {
    source: Box<dyn TimeSource>,
}

impl TimeStage {
    /// Create a time stage backed by `source`.
    pub fn new(source: Box<dyn TimeSource>) -> Self {
        Self { source }
    }
}

impl Default for TimeStage {
    fn default() -> Self {
        Self::new(Box::new(SystemClock))
    }
}

impl PipelineStage for TimeStage {
    fn apply(&self, event: &mut Event, topic: &str, record: &Record) -> bool {
        if let Some(timestamp) = self.source.event_time(topic, record) {
            let mut timing = Map::new();
            timing.insert(TIMESTAMP_FIELD.to_string(), Value::String(timestamp));
            event.insert(KEEN_FIELD, Value::Object(timing));
        }
        true
    }

    fn name(&self) -> &'static str {
        "time"
    }
}

/// Adapter turning a closure into a pipeline stage.
///
/// ```ignore
/// let drop_tests = FnStage::new(|_event, topic: &str, _record| {
///     !topic.starts_with("test/")
/// });
/// ```
pub struct FnStage<F>
where
    F: Fn(&mut Event, &str, &Record) -> bool + Send,
{
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut Event, &str, &Record) -> bool + Send,
{
    /// Wrap a closure as a stage.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> PipelineStage for FnStage<F>
where
    F: Fn(&mut Event, &str, &Record) -> bool + Send,
{
    fn apply(&self, event: &mut Event, topic: &str, record: &Record) -> bool {
        (self.func)(event, topic, record)
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("record fixture must be an object"),
        }
    }

    #[test]
    fn test_topic_stage_sets_reserved_field() {
        let mut event = Event::new();
        let rec = record(json!({}));

        assert!(TopicStage.apply(&mut event, "home/kitchen", &rec));
        assert_eq!(event.get(TOPIC_FIELD), Some(&json!("home/kitchen")));
    }

    #[test]
    fn test_payload_stage_merges_record() {
        let mut event = Event::new();
        let rec = record(json!({"test1": 120, "test2": "Hello World!"}));

        assert!(PayloadStage.apply(&mut event, "home/kitchen", &rec));
        assert_eq!(event.get("test1"), Some(&json!(120)));
        assert_eq!(event.get("test2"), Some(&json!("Hello World!")));
    }

    #[test]
    fn test_time_stage_sets_nested_timestamp() {
        let mut event = Event::new();
        let rec = record(json!({}));

        assert!(TimeStage::default().apply(&mut event, "home/kitchen", &rec));

        let keen = event.get(KEEN_FIELD).expect("keen object");
        let timestamp = keen
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .expect("timestamp string");

        // ISO-8601, no timezone designator.
        chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .expect("parseable ISO-8601 timestamp");
        assert!(!timestamp.ends_with('Z'));
        assert!(!timestamp.contains('+'));
    }

    #[test]
    fn test_time_stage_omits_field_when_source_declines() {
        struct NoTime;
        impl TimeSource for NoTime {
            fn event_time(&self, _topic: &str, _record: &Record) -> Option<String> {
                None
            }
        }

        let mut event = Event::new();
        let rec = record(json!({}));

        assert!(TimeStage::new(Box::new(NoTime)).apply(&mut event, "t", &rec));
        assert!(event.get(KEEN_FIELD).is_none());
    }

    #[test]
    fn test_time_source_reads_record() {
        struct EmbeddedTime;
        impl TimeSource for EmbeddedTime {
            fn event_time(&self, _topic: &str, record: &Record) -> Option<String> {
                record
                    .get("reported_at")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
        }

        let mut event = Event::new();
        let rec = record(json!({"reported_at": "2026-08-23T10:00:00"}));

        assert!(TimeStage::new(Box::new(EmbeddedTime)).apply(&mut event, "t", &rec));
        assert_eq!(
            event.get(KEEN_FIELD),
            Some(&json!({"timestamp": "2026-08-23T10:00:00"}))
        );
    }

    #[test]
    fn test_standard_pipeline_builds_complete_event() {
        let pipeline = EventPipeline::standard();
        let mut event = Event::new();
        let rec = record(json!({"value": 42}));

        assert!(pipeline.run(&mut event, "home/kitchen", &rec));
        assert_eq!(event.get(TOPIC_FIELD), Some(&json!("home/kitchen")));
        assert_eq!(event.get("value"), Some(&json!(42)));
        assert!(event.get(KEEN_FIELD).is_some());
    }

    #[test]
    fn test_pipeline_short_circuits_on_cancel() {
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut pipeline = EventPipeline::new(vec![
            Box::new(FnStage::new(|_e, _t, _r| false)),
            Box::new(FnStage::new(move |_e, _t, _r| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                true
            })),
        ]);
        pipeline.push(Box::new(TopicStage));

        let mut event = Event::new();
        let rec = record(json!({}));

        assert!(!pipeline.run(&mut event, "t", &rec));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(event.get(TOPIC_FIELD).is_none());
    }

    #[test]
    fn test_filtering_stage_cancels_matching_records() {
        let pipeline = EventPipeline::new(vec![
            Box::new(TopicStage),
            Box::new(FnStage::new(|_e, _t, record: &Record| {
                !record.contains_key("ignore")
            })),
            Box::new(PayloadStage),
        ]);

        let mut kept = Event::new();
        assert!(pipeline.run(&mut kept, "t", &record(json!({"v": 1}))));

        let mut dropped = Event::new();
        assert!(!pipeline.run(&mut dropped, "t", &record(json!({"ignore": true}))));
    }

    #[test]
    fn test_empty_pipeline_continues() {
        let pipeline = EventPipeline::new(Vec::new());
        let mut event = Event::new();
        assert!(pipeline.run(&mut event, "t", &record(json!({}))));
        assert!(pipeline.is_empty());
    }
}
