// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT topic filter matching.
//!
//! Topics are `/`-delimited hierarchies (`home/kitchen/temperature`).
//! Filters may use two wildcards:
//!
//! - `+` matches exactly one segment (`home/+/temperature`)
//! - `#` matches the remainder of the topic, including zero segments,
//!   and is only valid as the final segment (`home/#` matches `home`,
//!   `home/kitchen` and `home/kitchen/temperature`)
//!
//! Filters starting with a wildcard never match topics whose first
//! segment starts with `$` (broker-internal topics such as `$SYS/...`).

use thiserror::Error;

/// A topic filter that failed syntax validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid topic filter '{filter}': {reason}")]
pub struct InvalidFilter {
    /// The offending filter string.
    pub filter: String,
    /// Human-readable rejection reason.
    pub reason: &'static str,
}

impl InvalidFilter {
    fn new(filter: &str, reason: &'static str) -> Self {
        Self {
            filter: filter.to_string(),
            reason,
        }
    }
}

/// Check whether `topic` matches the subscription `filter`.
///
/// Segments are compared one by one: literals must be identical, `+`
/// consumes exactly one segment, and a trailing `#` consumes everything
/// that remains (including nothing). A malformed filter (`#` not in
/// final position) matches no topic at all.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    // [MQTT-4.7.2-1]: wildcard-first filters do not see $-topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let filter_segs: Vec<&str> = filter.split('/').collect();
    let topic_segs: Vec<&str> = topic.split('/').collect();

    for (i, seg) in filter_segs.iter().enumerate() {
        match *seg {
            "#" => return i == filter_segs.len() - 1,
            "+" => {
                if i >= topic_segs.len() {
                    return false;
                }
            }
            literal => {
                if i >= topic_segs.len() || topic_segs[i] != literal {
                    return false;
                }
            }
        }
    }

    topic_segs.len() == filter_segs.len()
}

/// Validate the syntax of a subscription filter.
///
/// Rules (MQTT 3.1.1, section 4.7.1): the filter must be non-empty,
/// `#` must stand alone as the final segment, and `+` must occupy an
/// entire segment on its own.
pub fn validate_filter(filter: &str) -> Result<(), InvalidFilter> {
    if filter.is_empty() {
        return Err(InvalidFilter::new(filter, "filter must not be empty"));
    }

    let segments: Vec<&str> = filter.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.contains('#') {
            if *seg != "#" {
                return Err(InvalidFilter::new(
                    filter,
                    "'#' must occupy a whole segment",
                ));
            }
            if i != segments.len() - 1 {
                return Err(InvalidFilter::new(
                    filter,
                    "'#' is only allowed as the final segment",
                ));
            }
        } else if seg.contains('+') && *seg != "+" {
            return Err(InvalidFilter::new(
                filter,
                "'+' must occupy a whole segment",
            ));
        }
    }

    Ok(())
}
