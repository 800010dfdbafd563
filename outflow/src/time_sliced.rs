// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffered outputs that bucket events by a formatted time key.
//!
//! Every event is stored under the key produced by formatting its timestamp with
//! `time_slice_format`, so one chunk never mixes events from different time slices. Unless
//! `flush_interval` is set, a slice is only sealed once it is older than `time_slice_wait`,
//! giving late events a chance to land in the right chunk.

use std::{
    io,
    sync::{Mutex, PoisonError},
};

use jiff::{
    Timestamp,
    fmt::strtime,
    tz::{Offset, TimeZone},
};
use outflow_core::{
    Chain, Chunk, ChunkWriter, ConfigContext, ConfigError, EmitError, EventTime, Output,
    OutputBase, PluginConfig, Seconds, SharedEventStream, WriteError,
};
use serde::Deserialize;

use crate::buffered::{BufferedOutput, BufferedPlugin, EnqueuePolicy, OnceChain, Slicing};

const DEFAULT_CHUNK_LIMIT: u64 = 256 * 1024 * 1024;

/// Formats event timestamps into bucket keys.
#[derive(Debug, Clone)]
pub struct TimeSlicer {
    format: String,
    zone: TimeZone,
}

impl TimeSlicer {
    /// Create a slicer, rejecting formats that can't format a timestamp.
    ///
    /// ```
    /// use jiff::tz::TimeZone;
    /// use outflow::TimeSlicer;
    ///
    /// let slicer = TimeSlicer::new("%Y%m%d%H", TimeZone::UTC).unwrap();
    /// assert_eq!(slicer.key(1_700_000_000).unwrap(), "2023111422");
    /// ```
    pub fn new(format: impl Into<String>, zone: TimeZone) -> Result<Self, ConfigError> {
        let slicer = Self {
            format: format.into(),
            zone,
        };
        if let Err(err) = slicer.key(0) {
            return Err(ConfigError::InvalidTimeFormat {
                format: slicer.format,
                reason: err.to_string(),
            });
        }
        Ok(slicer)
    }

    /// The bucket key of `time`.
    pub fn key(&self, time: EventTime) -> Result<String, jiff::Error> {
        let zoned = Timestamp::from_second(time)?.to_zoned(self.zone.clone());
        strtime::format(&self.format, &zoned)
    }

    /// The format string.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// The zone keys are computed in.
    pub fn zone(&self) -> &TimeZone {
        &self.zone
    }

    /// The longest interval, in seconds, that never contains a bucket boundary except at
    /// its start, for intervals aligned to the Unix epoch.
    pub fn cache_interval(&self) -> Result<i64, jiff::Error> {
        let start = self.key(0)?;
        let probed = if start != self.key(59)? {
            1
        } else if start != self.key(3599)? {
            30
        } else if start != self.key(86399)? {
            1800
        } else {
            43200
        };
        let offset = i64::from(self.zone.to_offset(Timestamp::now()).seconds());
        Ok(gcd(probed, offset.abs()))
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Parse an IANA zone name or a fixed `±HH:MM`, `±HHMM` or `±HH` offset.
pub fn parse_timezone(name: &str) -> Result<TimeZone, ConfigError> {
    let invalid = || ConfigError::InvalidTimezone(name.to_owned());
    if name.starts_with(['+', '-']) {
        let seconds = parse_offset(name).ok_or_else(invalid)?;
        let offset = Offset::from_seconds(seconds).map_err(|_| invalid())?;
        return Ok(TimeZone::fixed(offset));
    }
    TimeZone::get(name).map_err(|_| invalid())
}

fn parse_offset(value: &str) -> Option<i32> {
    let (sign, rest) = match value.split_at_checked(1)? {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some(parts) => parts,
        None if rest.len() == 4 => rest.split_at_checked(2)?,
        None => (rest, "00"),
    };
    let digits = |s: &str, min_len: usize| {
        ((min_len..=2).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit()))
            .then(|| s.parse::<i32>().ok())
            .flatten()
    };
    let hours = digits(hours, 1)?;
    let minutes = digits(minutes, 2)?;
    (minutes < 60).then_some(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TimeSliceSettings {
    time_slice_format: String,
    time_slice_wait: Seconds,
    timezone: Option<String>,
    utc: bool,
    localtime: bool,
}

impl Default for TimeSliceSettings {
    fn default() -> Self {
        Self {
            time_slice_format: "%Y%m%d".to_owned(),
            time_slice_wait: Seconds(600.0),
            timezone: None,
            utc: false,
            localtime: true,
        }
    }
}

impl TimeSliceSettings {
    fn zone(&self) -> Result<TimeZone, ConfigError> {
        match &self.timezone {
            Some(name) => parse_timezone(name),
            None if self.utc || !self.localtime => Ok(TimeZone::UTC),
            None => Ok(TimeZone::system()),
        }
    }
}

/// A [`BufferedOutput`] whose buffer keys are time slices.
///
/// Defaults differ from a plain buffered output: `buffer_chunk_limit` is 256MiB and, unless
/// `flush_interval` is given, the flush interval is derived from the slice granularity.
pub struct TimeSlicedOutput<P> {
    inner: BufferedOutput<P>,
    slicer: TimeSlicer,
    cache_interval: i64,
    // (time / cache_interval, key) of the last event
    last_key: Mutex<Option<(i64, String)>>,
}

impl<P: BufferedPlugin> TimeSlicedOutput<P> {
    /// Wrap a plugin. The output must be configured before it is started.
    pub fn new(plugin: P) -> Self {
        Self {
            inner: BufferedOutput::new(plugin),
            slicer: TimeSlicer {
                format: "%Y%m%d".to_owned(),
                zone: TimeZone::system(),
            },
            cache_interval: 1,
            last_key: Mutex::new(None),
        }
    }

    /// The underlying buffered output.
    pub fn inner(&self) -> &BufferedOutput<P> {
        &self.inner
    }

    /// The configured slicer.
    pub fn slicer(&self) -> &TimeSlicer {
        &self.slicer
    }

    /// Seconds during which consecutive events reuse the previous event's key.
    pub fn cache_interval(&self) -> i64 {
        self.cache_interval
    }

    fn key_for(&self, time: EventTime) -> Result<String, EmitError> {
        let bucket = time.div_euclid(self.cache_interval);
        let mut last_key = self.last_key.lock().unwrap();
        if let Some((last_bucket, key)) = &*last_key
            && *last_bucket == bucket
        {
            return Ok(key.clone());
        }
        let key = self.slicer.key(time).map_err(EmitError::format)?;
        *last_key = Some((bucket, key.clone()));
        Ok(key)
    }
}

impl<P: BufferedPlugin> Output for TimeSlicedOutput<P> {
    fn base(&self) -> &OutputBase {
        self.inner.base()
    }

    fn base_mut(&mut self) -> &mut OutputBase {
        self.inner.base_mut()
    }

    fn plugin_type(&self) -> &str {
        self.inner.plugin_type()
    }

    fn configure(&mut self, conf: &PluginConfig, ctx: &ConfigContext) -> Result<(), ConfigError> {
        let settings: TimeSliceSettings = conf.parse()?;
        if settings.time_slice_wait.0.is_nan() || settings.time_slice_wait.0 < 0.0 {
            return Err(ConfigError::invalid("time_slice_wait", "must not be negative"));
        }
        let slicer = TimeSlicer::new(settings.time_slice_format.clone(), settings.zone()?)?;
        let cache_interval =
            slicer
                .cache_interval()
                .map_err(|err| ConfigError::InvalidTimeFormat {
                    format: settings.time_slice_format.clone(),
                    reason: err.to_string(),
                })?;

        let slicing = if conf.has("flush_interval") {
            if conf.has("time_slice_wait") {
                tracing::warn!("time_slice_wait is overwritten by flush_interval");
            }
            Slicing {
                policy: EnqueuePolicy::AllKeys,
                flush_interval: None,
            }
        } else {
            Slicing {
                policy: EnqueuePolicy::TimeSliced {
                    slicer: slicer.clone(),
                    wait: settings.time_slice_wait.0.ceil() as i64,
                },
                flush_interval: Some(cache_interval.min(60) as f64),
            }
        };

        let mut conf = conf.clone();
        if !conf.has("buffer_chunk_limit") {
            conf = conf.with_param("buffer_chunk_limit", DEFAULT_CHUNK_LIMIT);
        }
        self.inner.configure_with(&conf, ctx, Some(slicing))?;

        self.slicer = slicer;
        self.cache_interval = cache_interval;
        *self
            .last_key
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn start(&self) -> io::Result<()> {
        self.inner.start()
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }

    fn emit(
        &self,
        tag: &str,
        stream: SharedEventStream,
        chain: &mut dyn Chain,
    ) -> Result<(), EmitError> {
        self.inner.count_emit();
        let mut chain = OnceChain::new(chain);
        let mut data = Vec::new();
        // one buffer emit per event keeps every chunk within buffer_chunk_limit
        for (time, record) in stream.events() {
            let key = self.key_for(time)?;
            data.clear();
            self.inner.plugin().format(tag, time, &record, &mut data)?;
            self.inner.emit_keyed(&key, &data, &mut chain)?;
        }
        chain.finish()
    }
}

impl<P: BufferedPlugin> ChunkWriter for TimeSlicedOutput<P> {
    fn write(&self, chunk: &dyn Chunk) -> Result<(), WriteError> {
        self.inner.write(chunk)
    }
}
