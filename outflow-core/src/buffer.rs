// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The contract between buffered outputs and their chunk storage.

use std::io;

use crate::{Chain, ChunkWriter, ConfigError, EmitError, PluginConfig, WriteError};

/// A sealed or staged batch of serialized events for one buffer key.
pub trait Chunk: Send + Sync {
    /// The buffer key this chunk was accumulated under.
    fn key(&self) -> &str;

    /// The serialized events.
    fn data(&self) -> &[u8];

    /// Size of the chunk in bytes.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the chunk holds no data.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An identifier unique among the chunks of one buffer.
    fn unique_id(&self) -> u64;
}

/// Key-addressed chunk storage.
///
/// Data is appended to a per-key active chunk. Active chunks are sealed into a FIFO queue
/// when they fill up or when they are [pushed](Buffer::push), and sealed chunks are handed to
/// a [`ChunkWriter`] by [`Buffer::pop`].
///
/// Every method takes `&self`; implementations synchronize internally. The
/// [`synchronized`](Buffer::synchronized) section must use a lock of its own so that its body
/// may call the other methods.
pub trait Buffer: Send + Sync {
    /// Read buffer options.
    fn configure(&mut self, conf: &PluginConfig) -> Result<(), ConfigError>;

    /// Allow several chunks to be written at the same time by different flush workers.
    fn enable_parallel(&mut self, _parallel: bool) {}

    /// Called when the owning output starts.
    fn start(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called when the owning output has stopped all of its flush workers.
    fn shutdown(&self) {}

    /// Append `data` to the active chunk of `key`.
    ///
    /// Implementations must call `chain.next()` before committing the data and must not
    /// commit it when the chain fails. Returns `true` when the caller should request a flush
    /// right away.
    fn emit(&self, key: &str, data: &[u8], chain: &mut dyn Chain) -> Result<bool, EmitError>;

    /// The keys that currently have an active chunk.
    fn keys(&self) -> Vec<String>;

    /// Number of sealed chunks waiting to be written.
    fn queue_size(&self) -> usize;

    /// Seal the active chunk of `key` into the queue. Returns `false` if there was nothing
    /// to seal.
    fn push(&self, key: &str) -> bool;

    /// Write the oldest sealed chunk with `writer` and drop it on success.
    ///
    /// Returns `Ok(true)` while more sealed chunks remain. On failure the chunk stays queued.
    fn pop(&self, writer: &dyn ChunkWriter) -> Result<bool, WriteError>;

    /// Drop every sealed chunk.
    fn clear(&self) -> io::Result<()>;

    /// Last chance to write out data before shutdown.
    fn before_shutdown(&self, writer: &dyn ChunkWriter) -> Result<(), WriteError>;

    /// Run `body` in the buffer's enqueue critical section.
    fn synchronized(&self, body: &mut dyn FnMut());
}
