// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
};

use crate::{
    Chain, Chunk, ConfigContext, ConfigError, EmitError, PluginConfig, RouterHandle,
    SharedEventStream, WriteError,
};

/// Lifecycle of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Lifecycle {
    /// Created or configured, not yet started.
    #[default]
    Unstarted = 0,
    /// Started and accepting events.
    Running = 1,
    /// Shutdown has begun.
    ShuttingDown = 2,
    /// Shut down.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// State shared by every output: identity, router and lifecycle.
#[derive(Debug, Default)]
pub struct OutputBase {
    plugin_id: Option<String>,
    router: Option<RouterHandle>,
    state: AtomicU8,
}

fn generated_plugin_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("object:{:x}", NEXT.fetch_add(1, Ordering::Relaxed))
}

impl OutputBase {
    /// Resolve the plugin id and the routing scope.
    ///
    /// The id comes from `@id`, or is generated. The router is the one registered on the root
    /// agent under `@label`, or the agent's default router when no label is given.
    pub fn configure(
        &mut self,
        conf: &PluginConfig,
        ctx: &ConfigContext,
    ) -> Result<(), ConfigError> {
        self.plugin_id = Some(match conf.get_str("@id") {
            Some(id) => id.to_owned(),
            None => generated_plugin_id(),
        });
        let router = match conf.get_str("@label") {
            Some(label) => ctx
                .agent
                .find_label(label)
                .ok_or_else(|| ConfigError::UnknownLabel(label.to_owned()))?,
            None => ctx.agent.event_router(),
        };
        self.router = Some(router.clone());
        Ok(())
    }

    /// The plugin id. Empty before configure.
    pub fn plugin_id(&self) -> &str {
        self.plugin_id.as_deref().unwrap_or_default()
    }

    /// The resolved router. `None` before configure.
    pub fn router(&self) -> Option<&RouterHandle> {
        self.router.as_ref()
    }

    /// Use `router` instead of the one resolved at configure.
    pub fn set_router(&mut self, router: RouterHandle) {
        self.router = Some(router);
    }

    /// The current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `Unstarted` to `Running`. Returns `false` if the output was started before.
    pub fn begin_start(&self) -> bool {
        self.transition(Lifecycle::Unstarted, Lifecycle::Running)
    }

    /// Move to `ShuttingDown`. Returns `false` if shutdown already began.
    pub fn begin_shutdown(&self) -> bool {
        self.transition(Lifecycle::Running, Lifecycle::ShuttingDown)
            || self.transition(Lifecycle::Unstarted, Lifecycle::ShuttingDown)
    }

    /// Move to `Stopped`.
    pub fn finish_shutdown(&self) {
        self.state.store(Lifecycle::Stopped as u8, Ordering::Release);
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The contract every sink implements.
pub trait Output: Send + Sync {
    /// Shared identity, router and lifecycle state.
    fn base(&self) -> &OutputBase;

    /// Mutable access to the shared state, used during configure.
    fn base_mut(&mut self) -> &mut OutputBase;

    /// The registered type name of this output, e.g. `forward`.
    fn plugin_type(&self) -> &str;

    /// Apply configuration. Outputs that override this must call
    /// [`OutputBase::configure`] through [`Output::base_mut`].
    fn configure(&mut self, conf: &PluginConfig, ctx: &ConfigContext) -> Result<(), ConfigError> {
        self.base_mut().configure(conf, ctx)
    }

    /// Start the output. Starting a running output does nothing.
    fn start(&self) -> io::Result<()> {
        self.base().begin_start();
        Ok(())
    }

    /// Stop the output. Idempotent.
    fn shutdown(&self) {
        if self.base().begin_shutdown() {
            self.base().finish_shutdown();
        }
    }

    /// Accept a stream, then continue `chain`.
    fn emit(
        &self,
        tag: &str,
        stream: SharedEventStream,
        chain: &mut dyn Chain,
    ) -> Result<(), EmitError>;

    /// Called on an output configured as the secondary of `primary`.
    fn secondary_init(&self, primary: &dyn Output) {
        if primary.plugin_type() != self.plugin_type() {
            tracing::warn!(
                primary = primary.plugin_type(),
                secondary = self.plugin_type(),
                "type of secondary output should be same as the output"
            );
        }
    }

    /// Shorthand for [`OutputBase::plugin_id`].
    fn plugin_id(&self) -> &str {
        self.base().plugin_id()
    }
}

/// Anything that can write a sealed chunk to its destination.
///
/// [`Buffer::pop`](crate::Buffer::pop) hands chunks to a writer and keeps them queued when the
/// write fails.
pub trait ChunkWriter: Send + Sync {
    /// Write one chunk.
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError>;
}

/// An output that can take over chunk writes when the primary gives up.
pub trait SecondaryOutput: Output + ChunkWriter {}

impl<T: Output + ChunkWriter + ?Sized> SecondaryOutput for T {}
