// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, fmt, sync::Arc};

use outflow_clock::TimeSource;

use crate::{Buffer, ConfigError, RootAgent, SecondaryOutput, StatusRegistry};

/// Creates a fresh, unconfigured buffer.
pub type BufferFactory = Arc<dyn Fn() -> Box<dyn Buffer> + Send + Sync>;

/// Creates a fresh, unconfigured output that can serve as a secondary.
pub type OutputFactory = Arc<dyn Fn() -> Box<dyn SecondaryOutput> + Send + Sync>;

/// Buffer and output factories by type name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    buffers: HashMap<String, BufferFactory>,
    outputs: HashMap<String, OutputFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buffers: Vec<_> = self.buffers.keys().collect();
        buffers.sort();
        let mut outputs: Vec<_> = self.outputs.keys().collect();
        outputs.sort();
        f.debug_struct("PluginRegistry")
            .field("buffers", &buffers)
            .field("outputs", &outputs)
            .finish()
    }
}

impl PluginRegistry {
    /// Register a buffer type.
    pub fn register_buffer(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Buffer> + Send + Sync + 'static,
    ) -> &mut Self {
        self.buffers.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register an output type.
    pub fn register_output(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn SecondaryOutput> + Send + Sync + 'static,
    ) -> &mut Self {
        self.outputs.insert(name.into(), Arc::new(factory));
        self
    }

    /// Create a buffer of the given type.
    pub fn new_buffer(&self, name: &str) -> Result<Box<dyn Buffer>, ConfigError> {
        self.buffers
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownPluginType(name.to_owned()))
    }

    /// Create an output of the given type.
    pub fn new_output(&self, name: &str) -> Result<Box<dyn SecondaryOutput>, ConfigError> {
        self.outputs
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownPluginType(name.to_owned()))
    }
}

/// Everything an output may look up while it is configured.
#[derive(Debug, Clone, Default)]
pub struct ConfigContext {
    /// Factories for buffers and secondary outputs.
    pub registry: Arc<PluginRegistry>,
    /// Routing scopes.
    pub agent: Arc<RootAgent>,
    /// Where outputs register their status probes.
    pub status: Arc<StatusRegistry>,
    /// The clock used by flush workers and retry scheduling.
    pub clock: TimeSource,
}

impl ConfigContext {
    /// Create a context around a registry, with the default agent, a fresh status registry
    /// and the system clock.
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            ..Self::default()
        }
    }

    /// Use `agent` for routing scope lookups.
    pub fn with_agent(mut self, agent: RootAgent) -> Self {
        self.agent = Arc::new(agent);
        self
    }

    /// Register status probes with `status`.
    pub fn with_status(mut self, status: Arc<StatusRegistry>) -> Self {
        self.status = status;
        self
    }

    /// Use `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: TimeSource) -> Self {
        self.clock = clock;
        self
    }
}
