// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Output chains walk a fixed list of outputs for one tagged event stream.
//!
//! Every output receives the chain it was called from and is expected to call
//! [`Chain::next`] exactly once to pass the stream on. Buffered outputs do that from inside
//! the buffer, right before committing the data, so a failing downstream output prevents
//! the data from being stored. Outputs never need to know whether they are last: past the
//! end, the chain hands over to its parent chain, or to [`NullOutputChain`].

use std::sync::Arc;

use crate::{EmitError, Output, SharedEventStream};

/// A step-by-step dispatcher over a list of outputs.
pub trait Chain {
    /// Dispatch the stream to the next output and return that output's result.
    fn next(&mut self) -> Result<(), EmitError>;
}

/// Terminal chain. Its `next` does nothing.
///
/// This is the only process-wide chain value and carries no state, so it is safe to use from
/// any number of chains at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutputChain;

impl Chain for NullOutputChain {
    fn next(&mut self) -> Result<(), EmitError> {
        Ok(())
    }
}

/// How an [`OutputChain`] hands the stream to each output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Every output receives the same stream instance.
    Sequential,
    /// Every output but the last receives its own duplicate, created when it is dispatched to.
    Copy,
}

/// Chain over a fixed slice of outputs.
pub struct OutputChain<'a> {
    outputs: &'a [Arc<dyn Output>],
    tag: &'a str,
    stream: SharedEventStream,
    offset: usize,
    mode: ChainMode,
    parent: Option<&'a mut dyn Chain>,
}

impl<'a> OutputChain<'a> {
    /// A chain that hands the same stream to every output.
    pub fn new(outputs: &'a [Arc<dyn Output>], tag: &'a str, stream: SharedEventStream) -> Self {
        Self {
            outputs,
            tag,
            stream,
            offset: 0,
            mode: ChainMode::Sequential,
            parent: None,
        }
    }

    /// A chain that hands every output but the last an independent duplicate of the stream.
    ///
    /// The last output receives the original stream.
    pub fn copy(outputs: &'a [Arc<dyn Output>], tag: &'a str, stream: SharedEventStream) -> Self {
        Self {
            mode: ChainMode::Copy,
            ..Self::new(outputs, tag, stream)
        }
    }

    /// Continue with `parent` once this chain runs out of outputs.
    pub fn with_parent(mut self, parent: &'a mut dyn Chain) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The dispatch mode of this chain.
    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    /// Index of the next output to dispatch to.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Chain for OutputChain<'_> {
    fn next(&mut self) -> Result<(), EmitError> {
        let outputs = self.outputs;
        if outputs.len() <= self.offset {
            return match self.parent.as_deref_mut() {
                Some(parent) => parent.next(),
                None => NullOutputChain.next(),
            };
        }
        self.offset += 1;
        let stream = if self.mode == ChainMode::Copy && outputs.len() > self.offset {
            self.stream.dup()
        } else {
            Arc::clone(&self.stream)
        };
        let tag = self.tag;
        outputs[self.offset - 1].emit(tag, stream, self)
    }
}

impl std::fmt::Debug for OutputChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChain")
            .field("tag", &self.tag)
            .field("outputs", &self.outputs.len())
            .field("offset", &self.offset)
            .field("mode", &self.mode)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
