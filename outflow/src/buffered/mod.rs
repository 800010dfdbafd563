// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The buffered output engine.
//!
//! A [`BufferedOutput`] serializes every stream it receives with its [`BufferedPlugin`],
//! appends the bytes to a [`Buffer`], and leaves the actual writing to background flush
//! workers. The workers periodically seal the buffer's active chunks, pop sealed chunks and
//! hand them to the plugin's [`ChunkWriter::write`]. Failed writes are retried with
//! exponential backoff. Once the retry limit is reached the chunks go to the secondary
//! output, if one is configured, and are finally dropped when the secondary fails too.

use std::{
    io,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::SystemTime,
};

use outflow_clock::{TimeSource, add_secs_f64};
use outflow_core::{
    Buffer, Chain, Chunk, ChunkWriter, ConfigContext, ConfigError, EmitError, EventStream,
    EventTime, Output, OutputBase, PluginConfig, Record, SecondaryOutput, Seconds,
    SharedEventStream, WriteError,
};
use serde::Deserialize;

use crate::{memory::MemoryBuffer, time_sliced::TimeSlicer};

mod retry;
mod thread;

use retry::{FailureAction, RetryPolicy, RetryState, Step};
use thread::{FlushTarget, OutputThread};

/// The sink side of a buffered output: how events are serialized and how chunks are written.
pub trait BufferedPlugin: ChunkWriter + 'static {
    /// The registered type name, e.g. `forward`.
    fn plugin_type(&self) -> &str;

    /// Read plugin-specific parameters.
    fn configure(
        &mut self,
        _conf: &PluginConfig,
        _ctx: &ConfigContext,
    ) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Called before the flush workers start.
    fn start(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called after the flush workers and the secondary have stopped.
    fn shutdown(&self) {}

    /// Serialize one event into `out`.
    fn format(
        &self,
        tag: &str,
        time: EventTime,
        record: &Record,
        out: &mut Vec<u8>,
    ) -> Result<(), EmitError>;

    /// Serialize a whole stream into `out`.
    fn format_stream(
        &self,
        tag: &str,
        stream: &dyn EventStream,
        out: &mut Vec<u8>,
    ) -> Result<(), EmitError> {
        for (time, record) in stream.events() {
            self.format(tag, time, &record, out)?;
        }
        Ok(())
    }

    /// The buffer key streams with this tag are stored under.
    fn buffer_key<'a>(&self, _tag: &'a str) -> &'a str {
        ""
    }
}

/// Typed view over the engine options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferedSettings {
    /// Buffer implementation, looked up in the plugin registry.
    pub buffer_type: String,
    /// Time between passes that seal every active chunk.
    pub flush_interval: Seconds,
    /// Time between flush attempts while the queue is empty.
    pub try_flush_interval: Seconds,
    /// Retry forever with the primary.
    pub disable_retry_limit: bool,
    /// Number of retries before switching to the secondary or giving up.
    pub retry_limit: u32,
    /// Base wait between retries.
    pub retry_wait: Seconds,
    /// Upper bound for any single wait between retries.
    pub max_retry_wait: Option<Seconds>,
    /// Number of flush workers.
    pub num_threads: usize,
    /// Time between flush attempts while more sealed chunks are queued.
    pub queued_chunk_flush_interval: Seconds,
    /// Number of retries with the secondary before giving up.
    pub secondary_limit: i64,
}

impl Default for BufferedSettings {
    fn default() -> Self {
        Self {
            buffer_type: "memory".to_owned(),
            flush_interval: Seconds(60.0),
            try_flush_interval: Seconds(1.0),
            disable_retry_limit: false,
            retry_limit: 17,
            retry_wait: Seconds(1.0),
            max_retry_wait: None,
            num_threads: 1,
            queued_chunk_flush_interval: Seconds(1.0),
            secondary_limit: 8,
        }
    }
}

impl BufferedSettings {
    fn validate(&self) -> Result<RetryPolicy, ConfigError> {
        if self.num_threads < 1 {
            return Err(ConfigError::invalid("num_threads", "must be at least 1"));
        }
        let secondary_limit = u32::try_from(self.secondary_limit).map_err(|_| {
            ConfigError::invalid(
                "secondary_limit",
                format!("must be between 0 and {} ({})", u32::MAX, self.secondary_limit),
            )
        })?;
        for (name, value) in [
            ("flush_interval", self.flush_interval),
            ("try_flush_interval", self.try_flush_interval),
            ("retry_wait", self.retry_wait),
            ("queued_chunk_flush_interval", self.queued_chunk_flush_interval),
        ] {
            if value.0.is_nan() || value.0 < 0.0 {
                return Err(ConfigError::invalid(name, "must not be negative"));
            }
        }
        Ok(RetryPolicy {
            retry_wait: self.retry_wait.0,
            max_retry_wait: self.max_retry_wait.map(Seconds::as_secs_f64),
            retry_limit: self.retry_limit,
            disable_retry_limit: self.disable_retry_limit,
            secondary_limit,
        })
    }
}

/// Which active chunks a periodic enqueue pass seals.
#[derive(Debug, Clone)]
pub(crate) enum EnqueuePolicy {
    /// Every key.
    AllKeys,
    /// Only keys older than the bucket of `now - wait`.
    TimeSliced { slicer: TimeSlicer, wait: i64 },
}

/// The state shared between an output and its flush workers.
pub(crate) struct FlushCore<P> {
    plugin: P,
    plugin_id: String,
    buffer: Box<dyn Buffer>,
    secondary: Option<Box<dyn SecondaryOutput>>,
    settings: BufferedSettings,
    policy: RetryPolicy,
    enqueue: EnqueuePolicy,
    clock: TimeSource,
    next_flush_time: Mutex<SystemTime>,
    retry: Mutex<RetryState>,
    emit_count: AtomicU64,
}

impl<P: BufferedPlugin> FlushCore<P> {
    fn new(plugin: P) -> Self {
        let clock = TimeSource::default();
        let now = clock.now();
        Self {
            plugin,
            plugin_id: String::new(),
            buffer: Box::new(MemoryBuffer::default()),
            secondary: None,
            settings: BufferedSettings::default(),
            policy: RetryPolicy::default(),
            enqueue: EnqueuePolicy::AllKeys,
            clock,
            next_flush_time: Mutex::new(now),
            retry: Mutex::new(RetryState::new(now)),
            emit_count: AtomicU64::new(0),
        }
    }

    fn backoff(&self, num_errors: u32) -> f64 {
        self.policy.backoff(num_errors, &mut rand::rng())
    }

    fn enqueue_buffer(&self, force: bool) {
        let keys = self.buffer.keys();
        match &self.enqueue {
            EnqueuePolicy::TimeSliced { slicer, wait } if !force => {
                let now = self.clock.unix_seconds();
                let limit = match slicer.key(now.saturating_sub(*wait)) {
                    Ok(limit) => limit,
                    Err(err) => {
                        tracing::warn!(
                            plugin_id = %self.plugin_id,
                            error = %err,
                            "couldn't compute the current time slice"
                        );
                        return;
                    }
                };
                for key in keys.iter().filter(|key| **key < limit) {
                    self.buffer.push(key);
                }
            }
            _ => {
                for key in &keys {
                    self.buffer.push(key);
                }
            }
        }
    }

    fn write_abort(&self) {
        tracing::error!(plugin_id = %self.plugin_id, "throwing away old logs");
        if let Err(err) = self.buffer.clear() {
            tracing::error!(
                plugin_id = %self.plugin_id,
                error = %err,
                "unexpected error while clearing the buffer"
            );
        }
    }

    fn secondary_writer(&self) -> Option<&dyn ChunkWriter> {
        self.secondary.as_deref().map(|s| s as &dyn ChunkWriter)
    }

    fn flush(&self, now: SystemTime) -> SystemTime {
        let try_again = add_secs_f64(now, self.settings.try_flush_interval.0);
        let mut force_retry = false;
        loop {
            let step = {
                let mut retry = self.retry.lock().unwrap();
                retry.begin_step(now, force_retry, |n| self.backoff(n))
            };
            let retrying = match step {
                Step::NotDue => return try_again,
                Step::Fresh => None,
                Step::Retry(num_errors) => Some(num_errors),
            };

            let target: &dyn ChunkWriter = match (retrying, self.secondary_writer()) {
                (Some(num_errors), Some(secondary)) if self.policy.uses_secondary(num_errors) => {
                    secondary
                }
                _ => &self.plugin,
            };

            let err = match self.buffer.pop(target) {
                Ok(has_next) => {
                    if retrying.is_some() && self.retry.lock().unwrap().record_success() {
                        tracing::warn!(plugin_id = %self.plugin_id, "retry succeeded");
                    }
                    return if has_next {
                        add_secs_f64(
                            self.clock.now(),
                            self.settings.queued_chunk_flush_interval.0,
                        )
                    } else {
                        try_again
                    };
                }
                Err(err) => err,
            };

            let (error_count, next_retry) = {
                let mut retry = self.retry.lock().unwrap();
                let error_count = if retrying.is_none()
                    && retry.record_first_failure(now, |n| self.backoff(n))
                {
                    0
                } else {
                    retry.num_errors()
                };
                (error_count, retry.next_retry_time())
            };

            match self
                .policy
                .on_failure(error_count, self.secondary.is_some())
            {
                FailureAction::Retry => {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        next_retry = %display_time(next_retry),
                        error_class = err.error_class(),
                        error = %err,
                        "temporarily failed to flush the buffer"
                    );
                }
                FailureAction::FallBackNow => {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        error_class = err.error_class(),
                        error = %err,
                        "failed to flush the buffer"
                    );
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        "retry count exceeded limit, falling back to secondary output"
                    );
                    force_retry = true;
                    continue;
                }
                FailureAction::RetryWithSecondary => {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        next_retry = %display_time(next_retry),
                        error_class = err.error_class(),
                        error = %err,
                        "failed to flush the buffer, next retry will be with secondary output"
                    );
                }
                FailureAction::AbandonSecondary => {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        error_class = err.error_class(),
                        error = %err,
                        "failed to flush the buffer"
                    );
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        "secondary retry count exceeded limit"
                    );
                    self.write_abort();
                    self.retry.lock().unwrap().reset();
                }
                FailureAction::Abandon => {
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        error_class = err.error_class(),
                        error = %err,
                        "failed to flush the buffer"
                    );
                    tracing::warn!(plugin_id = %self.plugin_id, "retry count exceeded limit");
                    self.write_abort();
                    self.retry.lock().unwrap().reset();
                }
            }
            return next_retry;
        }
    }
}

impl<P: BufferedPlugin> FlushTarget for FlushCore<P> {
    fn try_flush(&self) -> SystemTime {
        let now = self.clock.now();

        if self.buffer.queue_size() == 0 && *self.next_flush_time.lock().unwrap() <= now {
            self.buffer.synchronized(&mut || {
                let mut next_flush_time = self.next_flush_time.lock().unwrap();
                if *next_flush_time <= now {
                    self.enqueue_buffer(false);
                    *next_flush_time = add_secs_f64(now, self.settings.flush_interval.0);
                }
            });
        }

        if self.buffer.queue_size() == 0 {
            return add_secs_f64(now, self.settings.try_flush_interval.0);
        }
        self.flush(now)
    }

    fn before_shutdown(&self) {
        if let Err(err) = self.buffer.before_shutdown(&self.plugin) {
            tracing::warn!(
                plugin_id = %self.plugin_id,
                error_class = err.error_class(),
                error = %err,
                "before_shutdown failed"
            );
        }
    }
}

fn display_time(time: SystemTime) -> String {
    match jiff::Timestamp::try_from(time) {
        Ok(ts) => ts.to_string(),
        Err(_) => format!("{time:?}"),
    }
}

/// Time-slicing parameters resolved before the engine is configured.
pub(crate) struct Slicing {
    pub(crate) policy: EnqueuePolicy,
    /// Replaces `flush_interval` when set.
    pub(crate) flush_interval: Option<f64>,
}

/// An [`Output`] that buffers serialized events and writes them from background workers.
///
/// ```
/// use outflow::{BufferedOutput, BufferedPlugin, default_registry};
/// use outflow_core::{
///     ArrayEventStream, Chunk, ChunkWriter, ConfigContext, EmitError, EventTime,
///     NullOutputChain, Output, PluginConfig, Record, WriteError, record,
/// };
/// use serde_json::json;
///
/// struct Stdout;
///
/// impl ChunkWriter for Stdout {
///     fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
///         print!("{}", String::from_utf8_lossy(chunk.data()));
///         Ok(())
///     }
/// }
///
/// impl BufferedPlugin for Stdout {
///     fn plugin_type(&self) -> &str {
///         "stdout"
///     }
///
///     fn format(
///         &self,
///         tag: &str,
///         time: EventTime,
///         record: &Record,
///         out: &mut Vec<u8>,
///     ) -> Result<(), EmitError> {
///         serde_json::to_writer(&mut *out, &(tag, time, record)).map_err(EmitError::format)?;
///         out.push(b'\n');
///         Ok(())
///     }
/// }
///
/// let ctx = ConfigContext::new(default_registry());
/// let mut output = BufferedOutput::new(Stdout);
/// output
///     .configure(&PluginConfig::new("match").with_param("flush_interval", "10s"), &ctx)
///     .unwrap();
/// output.start().unwrap();
/// let stream = ArrayEventStream::one(1_700_000_000, record(json!({"message": "hi"})));
/// output
///     .emit("app", stream.shared(), &mut NullOutputChain)
///     .unwrap();
/// output.force_flush();
/// output.shutdown();
/// assert_eq!(output.emit_count(), 1);
/// assert_eq!(output.queue_size(), 0);
/// ```
pub struct BufferedOutput<P> {
    base: OutputBase,
    core: Arc<FlushCore<P>>,
    writers: Vec<OutputThread>,
    next_writer: AtomicUsize,
}

impl<P: BufferedPlugin> BufferedOutput<P> {
    /// Wrap a plugin. The output must be configured before it is started.
    pub fn new(plugin: P) -> Self {
        Self {
            base: OutputBase::default(),
            core: Arc::new(FlushCore::new(plugin)),
            writers: Vec::new(),
            next_writer: AtomicUsize::new(0),
        }
    }

    pub(crate) fn configure_with(
        &mut self,
        conf: &PluginConfig,
        ctx: &ConfigContext,
        slicing: Option<Slicing>,
    ) -> Result<(), ConfigError> {
        if Arc::get_mut(&mut self.core).is_none() {
            return Err(ConfigError::AlreadyConfigured);
        }
        self.base.configure(conf, ctx)?;

        let mut settings: BufferedSettings = conf.parse()?;
        let policy = settings.validate()?;
        let enqueue = match slicing {
            Some(slicing) => {
                if let Some(flush_interval) = slicing.flush_interval {
                    settings.flush_interval = Seconds(flush_interval);
                }
                slicing.policy
            }
            None => EnqueuePolicy::AllKeys,
        };

        let mut buffer = ctx.registry.new_buffer(&settings.buffer_type)?;
        buffer.configure(conf)?;
        buffer.enable_parallel(settings.num_threads > 1);

        let secondary = match conf.element("secondary") {
            Some(element) => Some(self.new_secondary(element, ctx)?),
            None => None,
        };

        let plugin_id = self.base.plugin_id().to_owned();
        let core = Arc::get_mut(&mut self.core).ok_or(ConfigError::AlreadyConfigured)?;
        core.plugin.configure(conf, ctx)?;
        let now = ctx.clock.now();
        core.plugin_id = plugin_id.clone();
        core.buffer = buffer;
        core.secondary = secondary;
        core.enqueue = enqueue;
        core.policy = policy;
        core.clock = ctx.clock.clone();
        core.next_flush_time = Mutex::new(add_secs_f64(now, settings.flush_interval.0));
        core.retry = Mutex::new(RetryState::new(now));
        self.writers = (0..settings.num_threads)
            .map(|i| {
                OutputThread::new(format!("outflow-flush-{plugin_id}-{i}"), ctx.clock.clone())
            })
            .collect();
        core.settings = settings;

        let weak: Weak<FlushCore<P>> = Arc::downgrade(&self.core);
        ctx.status.register(&plugin_id, "queue_size", move || {
            weak.upgrade()
                .map_or(0, |core| core.buffer.queue_size() as u64)
        });
        let weak: Weak<FlushCore<P>> = Arc::downgrade(&self.core);
        ctx.status.register(&plugin_id, "emit_count", move || {
            weak.upgrade()
                .map_or(0, |core| core.emit_count.load(Ordering::Relaxed))
        });
        Ok(())
    }

    fn new_secondary(
        &self,
        element: &PluginConfig,
        ctx: &ConfigContext,
    ) -> Result<Box<dyn SecondaryOutput>, ConfigError> {
        let plugin_type = element
            .plugin_type()
            .unwrap_or_else(|| self.core.plugin.plugin_type());
        let mut secondary = ctx.registry.new_output(plugin_type)?;
        secondary.configure(element, ctx)?;
        // an explicit `@label` on the secondary wins over the primary's router
        if !element.has("@label")
            && let Some(router) = self.base.router()
        {
            secondary.base_mut().set_router(router.clone());
        }
        secondary.secondary_init(self);
        Ok(secondary)
    }

    /// The wrapped plugin.
    pub fn plugin(&self) -> &P {
        &self.core.plugin
    }

    /// The buffer in use.
    pub fn buffer(&self) -> &dyn Buffer {
        &*self.core.buffer
    }

    /// The secondary output, if one is configured.
    pub fn secondary(&self) -> Option<&dyn SecondaryOutput> {
        self.core.secondary.as_deref()
    }

    /// The resolved engine options.
    pub fn settings(&self) -> &BufferedSettings {
        &self.core.settings
    }

    /// Number of streams handed to this output.
    pub fn emit_count(&self) -> u64 {
        self.core.emit_count.load(Ordering::Relaxed)
    }

    /// Number of sealed chunks waiting to be written.
    pub fn queue_size(&self) -> usize {
        self.core.buffer.queue_size()
    }

    /// Failures in the current retry episode, or 0 outside of one.
    pub fn num_errors(&self) -> u32 {
        self.core.retry.lock().unwrap().num_errors()
    }

    /// When the next retry is due. Only meaningful while [`num_errors`](Self::num_errors) is
    /// non-zero.
    pub fn next_retry_time(&self) -> SystemTime {
        self.core.retry.lock().unwrap().next_retry_time()
    }

    /// When the last write attempt of a retry episode started, if there ever was one.
    pub fn last_retry_time(&self) -> Option<SystemTime> {
        self.core.retry.lock().unwrap().last_retry_time()
    }

    /// Run one flush attempt on the calling thread and return when to try next.
    ///
    /// This is what every flush worker calls in its loop.
    pub fn try_flush(&self) -> SystemTime {
        self.core.try_flush()
    }

    /// Seal every active chunk and wake a flush worker. A pending retry still waits for its
    /// backoff.
    pub fn force_flush(&self) {
        self.core.enqueue_buffer(true);
        self.submit_flush();
    }

    /// Wake the next flush worker in round-robin order.
    pub fn submit_flush(&self) {
        if self.writers.is_empty() {
            return;
        }
        let index = self.next_writer.fetch_add(1, Ordering::Relaxed) % self.writers.len();
        self.writers[index].submit_flush();
    }

    /// Write out buffered data before shutdown, per the buffer's `flush_at_shutdown` policy.
    pub fn before_shutdown(&self) {
        self.core.before_shutdown();
    }

    pub(crate) fn count_emit(&self) {
        self.core.emit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn emit_keyed(
        &self,
        key: &str,
        data: &[u8],
        chain: &mut dyn Chain,
    ) -> Result<(), EmitError> {
        if self.core.buffer.emit(key, data, chain)? {
            self.submit_flush();
        }
        Ok(())
    }
}

impl<P: BufferedPlugin> Output for BufferedOutput<P> {
    fn base(&self) -> &OutputBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OutputBase {
        &mut self.base
    }

    fn plugin_type(&self) -> &str {
        self.core.plugin.plugin_type()
    }

    fn configure(&mut self, conf: &PluginConfig, ctx: &ConfigContext) -> Result<(), ConfigError> {
        self.configure_with(conf, ctx, None)
    }

    fn start(&self) -> io::Result<()> {
        if !self.base.begin_start() {
            return Ok(());
        }
        self.core.plugin.start()?;
        self.core.buffer.start()?;
        if let Some(secondary) = &self.core.secondary {
            secondary.start()?;
        }
        for writer in &self.writers {
            writer.start(Arc::clone(&self.core) as Arc<dyn FlushTarget>)?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if !self.base.begin_shutdown() {
            return;
        }
        for writer in &self.writers {
            writer.shutdown();
        }
        if let Some(secondary) = &self.core.secondary {
            secondary.shutdown();
        }
        self.core.plugin.shutdown();
        self.core.buffer.shutdown();
        self.base.finish_shutdown();
    }

    fn emit(
        &self,
        tag: &str,
        stream: SharedEventStream,
        chain: &mut dyn Chain,
    ) -> Result<(), EmitError> {
        self.count_emit();
        let mut data = Vec::new();
        self.core.plugin.format_stream(tag, &*stream, &mut data)?;
        self.emit_keyed(self.core.plugin.buffer_key(tag), &data, chain)
    }
}

impl<P: BufferedPlugin> ChunkWriter for BufferedOutput<P> {
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        self.core.plugin.write(chunk)
    }
}

/// Forwards the first `next` to the wrapped chain and succeeds on every later call, so a
/// stream split over several buffer keys continues the chain exactly once.
pub(crate) struct OnceChain<'c> {
    inner: &'c mut dyn Chain,
    done: bool,
}

impl<'c> OnceChain<'c> {
    pub(crate) fn new(inner: &'c mut dyn Chain) -> Self {
        Self { inner, done: false }
    }

    /// Continue the chain if nothing did yet.
    pub(crate) fn finish(mut self) -> Result<(), EmitError> {
        self.next()
    }
}

impl Chain for OnceChain<'_> {
    fn next(&mut self) -> Result<(), EmitError> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(());
        }
        self.inner.next()
    }
}
