// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Recording sinks for tests.
//!
//! Enable the `test-util` feature to use this module.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use outflow_core::{
    Chain, Chunk, ChunkWriter, EmitError, EventRouter, EventTime, Output, OutputBase,
    PluginRegistry, Record, SharedEventStream, WriteError,
};

/// A chunk that reached a recording sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenChunk {
    /// The buffer key.
    pub key: String,
    /// The chunk bytes.
    pub data: Vec<u8>,
}

impl WrittenChunk {
    /// The chunk bytes split into lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.data)
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Default)]
struct SinkState {
    written: Mutex<Vec<WrittenChunk>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    failing: AtomicBool,
}

/// Shared view of what a [`RecordingSink`] or [`RecordingOutput`] received, and a switch to
/// make it fail.
#[derive(Clone, Default)]
pub struct SinkHandle(Arc<SinkState>);

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle")
            .field("attempts", &self.attempts())
            .field("written", &self.written().len())
            .finish()
    }
}

impl SinkHandle {
    /// Every chunk written successfully, in write order.
    pub fn written(&self) -> Vec<WrittenChunk> {
        self.0.written.lock().unwrap().clone()
    }

    /// Every line of every chunk written successfully.
    pub fn lines(&self) -> Vec<String> {
        self.written().iter().flat_map(WrittenChunk::lines).collect()
    }

    /// Number of write calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `n` writes.
    pub fn fail_next(&self, n: usize) {
        self.0.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every write until turned off again.
    pub fn set_failing(&self, failing: bool) {
        self.0.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .0
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.0.failing.load(Ordering::SeqCst) || pending.is_ok() {
            return Err(WriteError::msg("sink unavailable"));
        }
        self.0.written.lock().unwrap().push(WrittenChunk {
            key: chunk.key().to_owned(),
            data: chunk.data().to_vec(),
        });
        Ok(())
    }
}

/// A [`BufferedPlugin`](crate::BufferedPlugin) that formats events as `[tag, time, record]`
/// JSON lines and records the chunks it is asked to write.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    plugin_type: String,
    handle: SinkHandle,
}

impl RecordingSink {
    /// Create a sink registered as `plugin_type`, reporting to `handle`.
    pub fn new(plugin_type: impl Into<String>, handle: SinkHandle) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            handle,
        }
    }

    /// The shared handle.
    pub fn handle(&self) -> &SinkHandle {
        &self.handle
    }
}

impl ChunkWriter for RecordingSink {
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        self.handle.record(chunk)
    }
}

impl crate::BufferedPlugin for RecordingSink {
    fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    fn format(
        &self,
        tag: &str,
        time: EventTime,
        record: &Record,
        out: &mut Vec<u8>,
    ) -> Result<(), EmitError> {
        serde_json::to_writer(&mut *out, &(tag, time, record)).map_err(EmitError::format)?;
        out.push(b'\n');
        Ok(())
    }
}

/// An unbuffered [`Output`] that records the chunks it is asked to write. Useful as a
/// secondary.
pub struct RecordingOutput {
    base: OutputBase,
    plugin_type: String,
    handle: SinkHandle,
}

impl RecordingOutput {
    /// Create an output registered as `plugin_type`, reporting to `handle`.
    pub fn new(plugin_type: impl Into<String>, handle: SinkHandle) -> Self {
        Self {
            base: OutputBase::default(),
            plugin_type: plugin_type.into(),
            handle,
        }
    }

    /// Register a factory for `plugin_type` whose outputs all report to `handle`.
    pub fn register(registry: &mut PluginRegistry, plugin_type: &str, handle: &SinkHandle) {
        let name = plugin_type.to_owned();
        let handle = handle.clone();
        registry.register_output(plugin_type, move || {
            Box::new(RecordingOutput::new(name.clone(), handle.clone()))
        });
    }
}

impl Output for RecordingOutput {
    fn base(&self) -> &OutputBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OutputBase {
        &mut self.base
    }

    fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    fn emit(
        &self,
        _tag: &str,
        _stream: SharedEventStream,
        chain: &mut dyn Chain,
    ) -> Result<(), EmitError> {
        chain.next()
    }
}

impl ChunkWriter for RecordingOutput {
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        self.handle.record(chunk)
    }
}

/// An [`EventRouter`] that remembers the tag and size of every stream routed through it.
#[derive(Debug, Default)]
pub struct RecordingRouter {
    routed: Mutex<Vec<(String, usize)>>,
}

impl RecordingRouter {
    /// The `(tag, number of events)` pairs routed so far.
    pub fn routed(&self) -> Vec<(String, usize)> {
        self.routed.lock().unwrap().clone()
    }
}

impl EventRouter for RecordingRouter {
    fn emit_stream(&self, tag: &str, stream: SharedEventStream) -> Result<(), EmitError> {
        self.routed
            .lock()
            .unwrap()
            .push((tag.to_owned(), stream.len()));
        Ok(())
    }
}
