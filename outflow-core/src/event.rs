// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains the [`EventStream`] trait, the batch of `(time, record)` pairs that is handed to
//! outputs, and [`ArrayEventStream`], the plain in-memory implementation.

use std::{borrow::Cow, fmt::Debug, sync::Arc};

/// Event timestamp, in whole seconds since the Unix epoch.
pub type EventTime = i64;

/// A single event body.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A stream as it travels through an output chain.
///
/// Sequential chains hand every output a clone of the same [`Arc`]. Copy chains hand every
/// output but the last a freshly [duplicated](EventStream::dup) stream, which the receiving
/// output owns exclusively and may mutate through [`Arc::get_mut`].
pub type SharedEventStream = Arc<dyn EventStream>;

/// An ordered sequence of `(time, record)` pairs.
pub trait EventStream: Send + Sync + Debug {
    /// Iterate over the events in order. Iteration can be repeated.
    fn events(&self) -> Box<dyn Iterator<Item = (EventTime, Cow<'_, Record>)> + '_>;

    /// Number of events in the stream.
    fn len(&self) -> usize;

    /// Returns `true` if the stream has no events.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep-copy the stream into a new, independently owned instance.
    fn dup(&self) -> SharedEventStream;

    /// Mutable access to the events, if this stream keeps them in memory.
    ///
    /// Reach this through [`Arc::get_mut`] on a stream received from a copy chain.
    fn events_mut(&mut self) -> Option<&mut Vec<(EventTime, Record)>> {
        None
    }

    /// Serialize the stream for object-buffered outputs: one `[time, record]` JSON array per
    /// line.
    fn to_json_stream(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        for (time, record) in self.events() {
            serde_json::to_writer(&mut out, &(time, &*record))?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

/// An [`EventStream`] backed by a `Vec`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayEventStream {
    events: Vec<(EventTime, Record)>,
}

impl ArrayEventStream {
    /// Create a stream from already collected events.
    pub fn new(events: Vec<(EventTime, Record)>) -> Self {
        Self { events }
    }

    /// Create a stream holding a single event.
    pub fn one(time: EventTime, record: Record) -> Self {
        Self {
            events: vec![(time, record)],
        }
    }

    /// Append an event.
    pub fn push(&mut self, time: EventTime, record: Record) {
        self.events.push((time, record));
    }

    /// Wrap into a [`SharedEventStream`].
    pub fn shared(self) -> SharedEventStream {
        Arc::new(self)
    }
}

impl FromIterator<(EventTime, Record)> for ArrayEventStream {
    fn from_iter<T: IntoIterator<Item = (EventTime, Record)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl EventStream for ArrayEventStream {
    fn events(&self) -> Box<dyn Iterator<Item = (EventTime, Cow<'_, Record>)> + '_> {
        Box::new(
            self.events
                .iter()
                .map(|(time, record)| (*time, Cow::Borrowed(record))),
        )
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn dup(&self) -> SharedEventStream {
        Arc::new(self.clone())
    }

    fn events_mut(&mut self) -> Option<&mut Vec<(EventTime, Record)>> {
        Some(&mut self.events)
    }
}

/// Build a [`Record`] from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty record.
pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Record::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_stream_has_one_line_per_event() {
        let stream: ArrayEventStream = vec![
            (1, record(json!({"a": 1}))),
            (2, record(json!({"b": "x"}))),
        ]
        .into_iter()
        .collect();
        let out = stream.to_json_stream().unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[1,{\"a\":1}]\n[2,{\"b\":\"x\"}]\n"
        );
    }

    #[test]
    fn dup_is_independent() {
        let stream = ArrayEventStream::one(5, record(json!({"k": "v"}))).shared();
        let mut copy = stream.dup();
        assert!(!Arc::ptr_eq(&stream, &copy));
        let events = Arc::get_mut(&mut copy).unwrap().events_mut().unwrap();
        events.clear();
        assert_eq!(copy.len(), 0);
        assert_eq!(stream.len(), 1);
    }
}
