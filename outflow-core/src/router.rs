// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use crate::{EmitError, SharedEventStream};

/// The routing layer an output can re-emit events into.
///
/// Outputs receive their router at configure time: the router of the label named by
/// `@label`, or the root agent's default router.
pub trait EventRouter: Send + Sync + Debug {
    /// Route a stream by tag.
    fn emit_stream(&self, tag: &str, stream: SharedEventStream) -> Result<(), EmitError>;
}

/// Shared handle to an [`EventRouter`].
pub type RouterHandle = Arc<dyn EventRouter>;

/// A router that accepts and drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardRouter;

impl EventRouter for DiscardRouter {
    fn emit_stream(&self, _tag: &str, _stream: SharedEventStream) -> Result<(), EmitError> {
        Ok(())
    }
}

/// The top of the routing tree: a default router plus named label scopes.
#[derive(Debug, Clone)]
pub struct RootAgent {
    event_router: RouterHandle,
    labels: HashMap<String, RouterHandle>,
}

impl Default for RootAgent {
    fn default() -> Self {
        Self::new(Arc::new(DiscardRouter))
    }
}

impl RootAgent {
    /// Create an agent with the given default router and no labels.
    pub fn new(event_router: RouterHandle) -> Self {
        Self {
            event_router,
            labels: HashMap::new(),
        }
    }

    /// Register a label scope, e.g. `@ERROR`.
    pub fn with_label(mut self, name: impl Into<String>, router: RouterHandle) -> Self {
        self.labels.insert(name.into(), router);
        self
    }

    /// The default router.
    pub fn event_router(&self) -> &RouterHandle {
        &self.event_router
    }

    /// The router of a label scope, if one is registered under `name`.
    pub fn find_label(&self, name: &str) -> Option<&RouterHandle> {
        self.labels.get(name)
    }
}
