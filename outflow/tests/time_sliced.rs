// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, UNIX_EPOCH};

use outflow::{
    TimeSlicedOutput, default_registry,
    test_util::{RecordingSink, SinkHandle},
};
use outflow_clock::{TimeSource, fakes::ManualClock};
use outflow_core::{
    ArrayEventStream, Chain, ConfigContext, EmitError, Output, PluginConfig, record,
};
use serde_json::json;

// 2023-11-14T22:13:20Z
const NOW: i64 = 1_700_000_000;

#[derive(Default)]
struct CountingChain(usize);

impl Chain for CountingChain {
    fn next(&mut self) -> Result<(), EmitError> {
        self.0 += 1;
        Ok(())
    }
}

fn setup(params: serde_json::Value) -> (ManualClock, SinkHandle, TimeSlicedOutput<RecordingSink>) {
    let clock = ManualClock::at_time(UNIX_EPOCH + Duration::from_secs(NOW as u64));
    let ctx = ConfigContext::new(default_registry()).with_clock(TimeSource::custom(clock.clone()));
    let sink = SinkHandle::default();
    let mut output = TimeSlicedOutput::new(RecordingSink::new("file", sink.clone()));
    output
        .configure(&PluginConfig::new("match").with_params(params), &ctx)
        .unwrap();
    (clock, sink, output)
}

fn stream(times: &[i64]) -> ArrayEventStream {
    times
        .iter()
        .map(|&time| (time, record(json!({"t": time}))))
        .collect()
}

#[test]
fn events_are_keyed_by_slice_and_chain_continues_once() {
    let (_, _, output) = setup(json!({"time_slice_format": "%Y%m%d%H", "utc": true}));
    let mut chain = CountingChain::default();
    output
        .emit("app", stream(&[NOW - 7200, NOW, NOW - 7100]).shared(), &mut chain)
        .unwrap();
    assert_eq!(chain.0, 1);

    let mut keys = output.inner().buffer().keys();
    keys.sort();
    assert_eq!(keys, ["2023111420", "2023111422"]);
    assert_eq!(output.inner().emit_count(), 1);
}

#[test]
fn empty_stream_still_continues_the_chain() {
    let (_, _, output) = setup(json!({"utc": true}));
    let mut chain = CountingChain::default();
    output
        .emit("app", ArrayEventStream::default().shared(), &mut chain)
        .unwrap();
    assert_eq!(chain.0, 1);
    assert!(output.inner().buffer().keys().is_empty());
}

#[test]
fn only_slices_older_than_the_wait_are_flushed() {
    let (clock, sink, output) = setup(json!({
        "time_slice_format": "%Y%m%d%H",
        "time_slice_wait": "10m",
        "utc": true,
    }));
    // hourly slices are cached for 30s, which also becomes the flush interval
    assert_eq!(output.cache_interval(), 30);
    assert_eq!(output.inner().settings().flush_interval.0, 30.0);
    assert_eq!(
        output.inner().settings().retry_limit,
        17,
        "engine defaults are kept"
    );

    output
        .emit("app", stream(&[NOW - 7200, NOW]).shared(), &mut CountingChain::default())
        .unwrap();

    output.inner().try_flush();
    assert_eq!(sink.attempts(), 0);

    clock.advance(Duration::from_secs(30));
    output.inner().try_flush();
    let written = sink.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].key, "2023111420");
    assert_eq!(output.inner().buffer().keys(), ["2023111422"]);

    output.inner().force_flush();
    output.inner().try_flush();
    let keys: Vec<_> = sink.written().into_iter().map(|chunk| chunk.key).collect();
    assert_eq!(keys, ["2023111420", "2023111422"]);
}

#[test]
fn explicit_flush_interval_flushes_every_slice() {
    let (clock, sink, output) = setup(json!({
        "time_slice_format": "%Y%m%d%H",
        "flush_interval": "5s",
        "utc": true,
    }));
    output
        .emit("app", stream(&[NOW - 7200, NOW]).shared(), &mut CountingChain::default())
        .unwrap();
    clock.advance(Duration::from_secs(5));
    output.inner().try_flush();
    output.inner().try_flush();
    let mut keys: Vec<_> = sink.written().into_iter().map(|chunk| chunk.key).collect();
    keys.sort();
    assert_eq!(keys, ["2023111420", "2023111422"]);
}

#[test]
fn localtime_false_slices_in_utc() {
    let (_, _, output) = setup(json!({"time_slice_format": "%Y%m%d%H", "localtime": false}));
    output
        .emit("app", stream(&[NOW]).shared(), &mut CountingChain::default())
        .unwrap();
    assert_eq!(output.inner().buffer().keys(), ["2023111422"]);
    assert_eq!(output.slicer().format(), "%Y%m%d%H");
}

#[test]
fn timezone_offset_shifts_the_slice() {
    let (_, _, output) = setup(json!({"time_slice_format": "%Y%m%d%H", "timezone": "-03:00"}));
    output
        .emit("app", stream(&[0]).shared(), &mut CountingChain::default())
        .unwrap();
    assert_eq!(output.inner().buffer().keys(), ["1969123121"]);
}

#[test]
fn large_streams_are_split_at_the_chunk_limit() {
    let (_, sink, output) = setup(json!({
        "time_slice_format": "%Y%m%d%H",
        "buffer_chunk_limit": 100,
        "utc": true,
    }));
    let times: Vec<i64> = (NOW..NOW + 10).collect();
    let mut chain = CountingChain::default();
    output.emit("app", stream(&times).shared(), &mut chain).unwrap();
    assert_eq!(chain.0, 1);
    assert_eq!(output.inner().emit_count(), 1);
    assert!(output.inner().queue_size() > 0);

    output.inner().force_flush();
    while output.inner().queue_size() > 0 {
        output.inner().try_flush();
    }
    let written = sink.written();
    assert!(written.len() > 1);
    assert!(written.iter().all(|chunk| chunk.data.len() <= 100));
    assert!(written.iter().all(|chunk| chunk.key == "2023111422"));
    assert_eq!(sink.lines().len(), 10);
}
