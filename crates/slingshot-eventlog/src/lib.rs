// SPDX-License-Identifier: Apache-2.0
//! Validation, decoding, and deadline-bounded waiting over a job's eventlog.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// A single decoded eventlog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventlogEntry {
    /// Event timestamp, seconds since epoch.
    pub timestamp: f64,
    /// Event name.
    pub name: String,
    /// Optional structured context, must be a JSON object when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Errors produced while decoding or waiting on eventlog entries.
#[derive(Debug, Error)]
pub enum EventlogError {
    /// The raw entry did not decode to a single, well-formed JSON object.
    #[error("malformed eventlog entry: {0}")]
    Malformed(String),
    /// The wait deadline elapsed before the target event appeared.
    #[error("deadline exceeded waiting for event")]
    DeadlineExceeded,
    /// An `exception` event with severity 0 (fatal) was observed first.
    #[error("fatal exception event observed: {0}")]
    Exception(Value),
    /// The underlying transport failed.
    #[error("eventlog transport error: {0}")]
    Transport(String),
}

/// Validate that a decoded JSON value is a well-formed eventlog entry:
/// an object with a string `name`, a numeric `timestamp`, and an optional
/// object `context`.
#[must_use]
pub fn entry_validate(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let name_ok = obj.get("name").is_some_and(Value::is_string);
    let ts_ok = obj.get("timestamp").is_some_and(Value::is_number);
    if !name_ok || !ts_ok {
        return false;
    }
    match obj.get("context") {
        None => true,
        Some(ctx) => ctx.is_object(),
    }
}

/// Decode one framed eventlog line: exactly one JSON object followed by a
/// single trailing newline, no embedded newlines.
pub fn entry_decode(line: &str) -> Result<EventlogEntry, EventlogError> {
    if line.is_empty() {
        return Err(EventlogError::Malformed("empty entry".to_string()));
    }
    let trimmed = line
        .strip_suffix('\n')
        .ok_or_else(|| EventlogError::Malformed("missing trailing newline".to_string()))?;
    if trimmed.contains('\n') {
        return Err(EventlogError::Malformed("embedded newline".to_string()));
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| EventlogError::Malformed(e.to_string()))?;
    if !entry_validate(&value) {
        return Err(EventlogError::Malformed("failed entry validation".to_string()));
    }
    serde_json::from_value(value).map_err(|e| EventlogError::Malformed(e.to_string()))
}

/// Source of eventlog entries, implemented by the embedding broker client.
#[async_trait]
pub trait EventlogTransport {
    /// Await and return the next entry on the stream.
    async fn next(&mut self) -> Result<EventlogEntry, EventlogError>;
}

/// Result of [`wait_for`]: either the target event was found, or a
/// "surpassing" event ended the wait first without that being an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The target event was observed.
    Matched(EventlogEntry),
    /// The job's `start` event was observed before the target event. Since
    /// `start` is posted once, after it no earlier event (such as the one
    /// being waited for) can still appear, so the wait ends without error.
    NoMatch,
}

/// Wait for an event named `target` to appear on `transport`, bounded by
/// `timeout`, or waiting indefinitely when `timeout` is `None` — the
/// post-barrier fetch of a job's own `cray-slingshot` event has no deadline,
/// since by that point the event is either already posted or about to be.
/// The remaining time budget is recomputed before each read, so a slow but
/// steady trickle of unrelated events cannot extend the overall wait past
/// the deadline.
///
/// A fatal `exception` event (context `{"severity": 0, ...}`) observed
/// before the target event short-circuits the wait with
/// [`EventlogError::Exception`]. The job's `start` event observed before
/// the target event ends the wait with [`WaitOutcome::NoMatch`] instead of
/// an error, since the plugin posting `target` may simply not be loaded.
pub async fn wait_for<T: EventlogTransport>(
    transport: &mut T,
    target: &str,
    timeout: Option<Duration>,
) -> Result<WaitOutcome, EventlogError> {
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        let entry = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(EventlogError::DeadlineExceeded);
                }
                tokio::time::timeout(remaining, transport.next())
                    .await
                    .map_err(|_| EventlogError::DeadlineExceeded)??
            }
            None => transport.next().await?,
        };
        if entry.name == target {
            return Ok(WaitOutcome::Matched(entry));
        }
        if entry.name == "exception" && is_fatal_exception(&entry) {
            return Err(EventlogError::Exception(
                entry.context.unwrap_or(Value::Null),
            ));
        }
        if entry.name == "start" {
            return Ok(WaitOutcome::NoMatch);
        }
    }
}

fn is_fatal_exception(entry: &EventlogEntry) -> bool {
    entry
        .context
        .as_ref()
        .and_then(|c| c.get("severity"))
        .and_then(Value::as_i64)
        == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeTransport(VecDeque<EventlogEntry>);

    #[async_trait]
    impl EventlogTransport for FakeTransport {
        async fn next(&mut self) -> Result<EventlogEntry, EventlogError> {
            self.0
                .pop_front()
                .ok_or_else(|| EventlogError::Transport("exhausted".to_string()))
        }
    }

    fn entry(name: &str) -> EventlogEntry {
        EventlogEntry {
            timestamp: 0.0,
            name: name.to_string(),
            context: None,
        }
    }

    #[test]
    fn decodes_a_well_formed_line() {
        let e = entry_decode("{\"name\":\"start\",\"timestamp\":1.0}\n").unwrap();
        assert_eq!(e.name, "start");
    }

    #[test]
    fn rejects_missing_trailing_newline() {
        assert!(entry_decode("{\"name\":\"start\",\"timestamp\":1.0}").is_err());
    }

    #[test]
    fn rejects_non_object_context() {
        let raw = "{\"name\":\"x\",\"timestamp\":1.0,\"context\":5}\n";
        assert!(entry_decode(raw).is_err());
    }

    #[tokio::test]
    async fn finds_target_event_among_noise() {
        let mut t = FakeTransport(VecDeque::from([entry("noise"), entry("cray-slingshot")]));
        let got = wait_for(&mut t, "cray-slingshot", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got, WaitOutcome::Matched(entry("cray-slingshot")));
    }

    #[tokio::test]
    async fn start_event_before_target_ends_the_wait_without_error() {
        let mut t = FakeTransport(VecDeque::from([entry("start")]));
        let got = wait_for(&mut t, "cray-slingshot", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got, WaitOutcome::NoMatch);
    }

    #[tokio::test]
    async fn fatal_exception_short_circuits() {
        let mut t = FakeTransport(VecDeque::from([EventlogEntry {
            timestamp: 0.0,
            name: "exception".to_string(),
            context: Some(serde_json::json!({"severity": 0, "type": "slingshot"})),
        }]));
        let err = wait_for(&mut t, "cray-slingshot", Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, EventlogError::Exception(_)));
    }

    #[tokio::test]
    async fn deadline_exceeded_when_transport_never_yields_target() {
        let mut t = FakeTransport(VecDeque::new());
        let err = wait_for(&mut t, "cray-slingshot", Some(Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventlogError::DeadlineExceeded | EventlogError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn no_deadline_waits_until_the_target_event_arrives() {
        let mut t = FakeTransport(VecDeque::from([entry("noise"), entry("cray-slingshot")]));
        let got = wait_for(&mut t, "cray-slingshot", None).await.unwrap();
        assert_eq!(got, WaitOutcome::Matched(entry("cray-slingshot")));
    }
}
