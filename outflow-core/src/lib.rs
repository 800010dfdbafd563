// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod buffer;
pub mod chain;
pub mod config;
mod error;
mod event;
mod output;
mod registry;
mod router;
pub mod status;

pub use buffer::{Buffer, Chunk};
pub use chain::{Chain, ChainMode, NullOutputChain, OutputChain};
pub use config::{ByteSize, PluginConfig, Seconds};
pub use error::{BoxError, ConfigError, EmitError, WriteError};
pub use event::{ArrayEventStream, EventStream, EventTime, Record, SharedEventStream, record};
pub use output::{ChunkWriter, Lifecycle, Output, OutputBase, SecondaryOutput};
pub use registry::{BufferFactory, ConfigContext, OutputFactory, PluginRegistry};
pub use router::{DiscardRouter, EventRouter, RootAgent, RouterHandle};
pub use status::{MetricRecorder, StatusEntry, StatusRegistry};
