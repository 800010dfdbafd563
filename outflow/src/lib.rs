// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffered;
mod memory;
pub mod object;
pub mod time_sliced;

#[cfg(feature = "test-util")]
pub mod test_util;

pub use buffered::{BufferedOutput, BufferedPlugin, BufferedSettings};
pub use memory::{MemoryBuffer, MemoryBufferSettings, MemoryChunk};
pub use object::{ChunkEventView, ObjectBufferedOutput, ObjectFormat, ObjectPlugin};
pub use time_sliced::{TimeSlicedOutput, TimeSlicer, parse_timezone};

use outflow_core::PluginRegistry;

/// A registry with the buffer types shipped in this crate (`memory`) and no output types.
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::default();
    registry.register_buffer("memory", || Box::new(MemoryBuffer::default()));
    registry
}
