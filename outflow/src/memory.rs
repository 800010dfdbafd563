// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An in-memory [`Buffer`].

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use outflow_core::{
    Buffer, ByteSize, Chain, Chunk, ChunkWriter, ConfigError, EmitError, PluginConfig,
    WriteError,
};
use serde::Deserialize;

/// A chunk held in memory.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    key: String,
    data: Vec<u8>,
    id: u64,
}

impl Chunk for MemoryChunk {
    fn key(&self) -> &str {
        &self.key
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn unique_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct Sealed {
    chunk: MemoryChunk,
    in_flight: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    active: HashMap<String, MemoryChunk>,
    queue: VecDeque<Arc<Sealed>>,
}

/// Options read by [`MemoryBuffer::configure`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryBufferSettings {
    /// Largest size an active chunk may grow to.
    pub buffer_chunk_limit: ByteSize,
    /// Largest number of sealed chunks.
    pub buffer_queue_limit: usize,
    /// Write out everything in [`Buffer::before_shutdown`].
    pub flush_at_shutdown: bool,
}

impl Default for MemoryBufferSettings {
    fn default() -> Self {
        Self {
            buffer_chunk_limit: ByteSize(8 * 1024 * 1024),
            buffer_queue_limit: 64,
            flush_at_shutdown: true,
        }
    }
}

/// Keeps active and sealed chunks in memory. Registered as `memory`.
#[derive(Debug, Default)]
pub struct MemoryBuffer {
    settings: MemoryBufferSettings,
    parallel: bool,
    state: Mutex<State>,
    enqueue_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl MemoryBuffer {
    /// The resolved options.
    pub fn settings(&self) -> &MemoryBufferSettings {
        &self.settings
    }

    fn new_chunk(&self, key: &str) -> MemoryChunk {
        MemoryChunk {
            key: key.to_owned(),
            data: Vec::new(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    // A panicking downstream chain leaves `State` untouched, so a poisoned lock is still
    // consistent.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_limit(&self) -> usize {
        usize::try_from(self.settings.buffer_chunk_limit.bytes()).unwrap_or(usize::MAX)
    }
}

impl Buffer for MemoryBuffer {
    fn configure(&mut self, conf: &PluginConfig) -> Result<(), ConfigError> {
        let settings: MemoryBufferSettings = conf.parse()?;
        if settings.buffer_chunk_limit.bytes() == 0 {
            return Err(ConfigError::invalid("buffer_chunk_limit", "must be positive"));
        }
        if settings.buffer_queue_limit == 0 {
            return Err(ConfigError::invalid("buffer_queue_limit", "must be positive"));
        }
        self.settings = settings;
        Ok(())
    }

    fn enable_parallel(&mut self, parallel: bool) {
        self.parallel = parallel;
    }

    fn emit(&self, key: &str, data: &[u8], chain: &mut dyn Chain) -> Result<bool, EmitError> {
        let limit = self.chunk_limit();
        let mut state = self.state();

        let active_len = state.active.get(key).map_or(0, |chunk| chunk.len());
        if active_len + data.len() <= limit {
            chain.next()?;
            state
                .active
                .entry(key.to_owned())
                .or_insert_with(|| self.new_chunk(key))
                .data
                .extend_from_slice(data);
            return Ok(false);
        }
        if state.queue.len() >= self.settings.buffer_queue_limit {
            return Err(EmitError::QueueLimitExceeded {
                limit: self.settings.buffer_queue_limit,
            });
        }
        if data.len() > limit {
            tracing::warn!(
                key,
                size = data.len(),
                buffer_chunk_limit = limit,
                "size of the emitted data exceeds buffer_chunk_limit"
            );
        }

        let mut chunk = self.new_chunk(key);
        chunk.data.extend_from_slice(data);
        chain.next()?;

        let was_empty = state.queue.is_empty();
        let previous = state.active.insert(key.to_owned(), chunk);
        match previous {
            Some(previous) if !previous.is_empty() => {
                state.queue.push_back(Arc::new(Sealed {
                    chunk: previous,
                    in_flight: AtomicBool::new(false),
                }));
                Ok(was_empty)
            }
            _ => Ok(false),
        }
    }

    fn keys(&self) -> Vec<String> {
        self.state().active.keys().cloned().collect()
    }

    fn queue_size(&self) -> usize {
        self.state().queue.len()
    }

    fn push(&self, key: &str) -> bool {
        let mut state = self.state();
        match state.active.remove(key) {
            Some(chunk) if !chunk.is_empty() => {
                state.queue.push_back(Arc::new(Sealed {
                    chunk,
                    in_flight: AtomicBool::new(false),
                }));
                true
            }
            _ => false,
        }
    }

    fn pop(&self, writer: &dyn ChunkWriter) -> Result<bool, WriteError> {
        let sealed = {
            let state = self.state();
            let mut candidates = state.queue.iter();
            let next = if self.parallel {
                candidates.find(|sealed| !sealed.in_flight.swap(true, Ordering::AcqRel))
            } else {
                candidates
                    .next()
                    .filter(|sealed| !sealed.in_flight.swap(true, Ordering::AcqRel))
            };
            match next {
                Some(sealed) => Arc::clone(sealed),
                None => return Ok(false),
            }
        };

        let result = writer.write(&sealed.chunk);

        let mut state = self.state();
        match result {
            Ok(()) => {
                state
                    .queue
                    .retain(|queued| queued.chunk.id != sealed.chunk.id);
                Ok(!state.queue.is_empty())
            }
            Err(err) => {
                sealed.in_flight.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn clear(&self) -> io::Result<()> {
        self.state().queue.clear();
        Ok(())
    }

    fn before_shutdown(&self, writer: &dyn ChunkWriter) -> Result<(), WriteError> {
        if !self.settings.flush_at_shutdown {
            return Ok(());
        }
        for key in self.keys() {
            self.push(&key);
        }
        while self.pop(writer)? {}
        Ok(())
    }

    fn synchronized(&self, body: &mut dyn FnMut()) {
        let _guard = self
            .enqueue_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        body();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use outflow_core::NullOutputChain;

    use super::*;

    #[derive(Default)]
    struct Collect {
        written: Mutex<Vec<(String, Vec<u8>)>>,
        fail: AtomicBool,
    }

    impl ChunkWriter for Collect {
        fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WriteError::msg("sink down"));
            }
            self.written
                .lock()
                .unwrap()
                .push((chunk.key().to_owned(), chunk.data().to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingChain {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Chain for CountingChain {
        fn next(&mut self) -> Result<(), EmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmitError::Downstream("next output failed".into()));
            }
            Ok(())
        }
    }

    fn buffer(params: serde_json::Value) -> MemoryBuffer {
        let mut buffer = MemoryBuffer::default();
        buffer
            .configure(&PluginConfig::new("match").with_params(params))
            .unwrap();
        buffer
    }

    #[test]
    fn emit_continues_the_chain_before_committing() {
        let buffer = buffer(serde_json::json!({}));
        let mut chain = CountingChain {
            fail: true,
            ..CountingChain::default()
        };
        assert!(buffer.emit("k", b"abc", &mut chain).is_err());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
        assert!(buffer.keys().is_empty());

        let mut chain = CountingChain::default();
        assert!(!buffer.emit("k", b"abc", &mut chain).unwrap());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.keys(), vec!["k".to_owned()]);
    }

    #[test]
    fn full_chunk_is_sealed_and_reports_threshold_once() {
        let buffer = buffer(serde_json::json!({"buffer_chunk_limit": 4}));
        let chain = &mut NullOutputChain;
        assert!(!buffer.emit("k", b"aaa", chain).unwrap());
        // doesn't fit: seals "aaa", queue was empty
        assert!(buffer.emit("k", b"bbb", chain).unwrap());
        assert_eq!(buffer.queue_size(), 1);
        // seals "bbb", queue was not empty
        assert!(!buffer.emit("k", b"ccc", chain).unwrap());
        assert_eq!(buffer.queue_size(), 2);
    }

    #[test]
    fn queue_limit_rejects_new_chunks() {
        let buffer = buffer(serde_json::json!({"buffer_chunk_limit": 4, "buffer_queue_limit": 1}));
        let chain = &mut NullOutputChain;
        buffer.emit("k", b"aaa", chain).unwrap();
        buffer.emit("k", b"bbb", chain).unwrap();
        assert_eq!(buffer.queue_size(), 1);
        // data that still fits the active chunk is accepted
        buffer.emit("k", b"c", chain).unwrap();
        let err = buffer.emit("k", b"dd", chain).unwrap_err();
        assert!(matches!(err, EmitError::QueueLimitExceeded { limit: 1 }));
        assert_eq!(buffer.queue_size(), 1);
    }

    #[test]
    fn oversized_data_becomes_its_own_chunk() {
        let buffer = buffer(serde_json::json!({"buffer_chunk_limit": 4}));
        let chain = &mut NullOutputChain;
        buffer.emit("k", b"ab", chain).unwrap();
        buffer.emit("k", b"0123456789", chain).unwrap();
        assert!(buffer.push("k"));

        let sink = Collect::default();
        while buffer.pop(&sink).unwrap() {}
        let written = sink.written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].1, b"ab");
        assert_eq!(written[1].1, b"0123456789");
    }

    #[test]
    fn failed_pop_keeps_the_chunk() {
        let buffer = buffer(serde_json::json!({}));
        buffer.emit("a", b"1", &mut NullOutputChain).unwrap();
        buffer.emit("b", b"2", &mut NullOutputChain).unwrap();
        assert!(buffer.push("a"));
        assert!(buffer.push("b"));
        assert!(!buffer.push("b"));

        let sink = Collect::default();
        sink.fail.store(true, Ordering::SeqCst);
        assert!(buffer.pop(&sink).is_err());
        assert_eq!(buffer.queue_size(), 2);

        sink.fail.store(false, Ordering::SeqCst);
        assert!(buffer.pop(&sink).unwrap());
        assert!(!buffer.pop(&sink).unwrap());
        assert_eq!(buffer.queue_size(), 0);
        let keys: Vec<_> = sink
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn clear_drops_sealed_chunks_only() {
        let buffer = buffer(serde_json::json!({}));
        buffer.emit("a", b"1", &mut NullOutputChain).unwrap();
        buffer.push("a");
        buffer.emit("b", b"2", &mut NullOutputChain).unwrap();
        buffer.clear().unwrap();
        assert_eq!(buffer.queue_size(), 0);
        assert_eq!(buffer.keys(), vec!["b".to_owned()]);
    }

    #[test]
    fn before_shutdown_writes_everything() {
        let buffer = buffer(serde_json::json!({}));
        buffer.emit("a", b"1", &mut NullOutputChain).unwrap();
        buffer.emit("b", b"2", &mut NullOutputChain).unwrap();
        buffer.push("a");
        let sink = Collect::default();
        buffer.before_shutdown(&sink).unwrap();
        assert_eq!(sink.written.lock().unwrap().len(), 2);
        assert!(buffer.keys().is_empty());
        assert_eq!(buffer.queue_size(), 0);

        let buffer = buffer_no_flush();
        buffer.emit("a", b"1", &mut NullOutputChain).unwrap();
        let sink = Collect::default();
        buffer.before_shutdown(&sink).unwrap();
        assert!(sink.written.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_chain_does_not_wedge_the_buffer() {
        struct Panicking;
        impl Chain for Panicking {
            fn next(&mut self) -> Result<(), EmitError> {
                panic!("downstream output blew up");
            }
        }

        let buffer = buffer(serde_json::json!({}));
        buffer.emit("k", b"a", &mut NullOutputChain).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            buffer.emit("k", b"b", &mut Panicking)
        }));
        assert!(result.is_err());

        assert_eq!(buffer.keys(), vec!["k".to_owned()]);
        let sink = Collect::default();
        buffer.before_shutdown(&sink).unwrap();
        assert_eq!(*sink.written.lock().unwrap(), [("k".to_owned(), b"a".to_vec())]);
    }

    fn buffer_no_flush() -> MemoryBuffer {
        buffer(serde_json::json!({"flush_at_shutdown": false}))
    }

    #[test]
    fn parallel_pop_skips_chunks_in_flight() {
        let mut buffer = buffer(serde_json::json!({}));
        buffer.enable_parallel(true);
        for key in ["a", "b"] {
            buffer.emit(key, key.as_bytes(), &mut NullOutputChain).unwrap();
            buffer.push(key);
        }

        struct Nested<'a>(&'a MemoryBuffer, Collect);
        impl ChunkWriter for Nested<'_> {
            fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
                if chunk.key() == "a" {
                    // a second worker pops while "a" is being written
                    self.0.pop(&self.1)?;
                }
                self.1.write(chunk)
            }
        }

        let nested = Nested(&buffer, Collect::default());
        assert!(!buffer.pop(&nested).unwrap());
        let keys: Vec<_> = nested
            .1
            .written
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect();
        assert_eq!(keys, ["b", "a"]);
    }

    #[test]
    fn configure_rejects_zero_limits() {
        let mut buffer = MemoryBuffer::default();
        let err = buffer
            .configure(&PluginConfig::new("match").with_param("buffer_queue_limit", 0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));
        buffer
            .configure(&PluginConfig::new("match").with_param("buffer_chunk_limit", "1m"))
            .unwrap();
        assert_eq!(buffer.settings().buffer_chunk_limit, ByteSize(1024 * 1024));
    }
}
